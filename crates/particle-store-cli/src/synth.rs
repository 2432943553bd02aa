//! Synthetic packet source for load testing a store.

use std::{path::Path, time::Duration};

use chrono::Utc;
use futures::{Stream, StreamExt, future, stream};
use log::info;
use particle_store_core::{
    ParticleBatch, StoreConfig, StoreLocation, ingest,
    model::{BatchError, SCATTERING_LEN, SPECTRAL_LEN},
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use snafu::ResultExt;
use tokio::time::Instant;

use crate::error::{CliResult, IngestSnafu, InvalidPacketSnafu};

/// Largest number of particles in one packet.
pub const MAX_PACKET_PARTICLES: usize = 1_000;

/// Raw size of one particle: an f64 timestamp plus both i32 grids.
pub const PARTICLE_BYTES: u64 = (8 + 4 * (SCATTERING_LEN + SPECTRAL_LEN)) as u64;

#[derive(Debug, Clone)]
pub struct SynthArgs {
    /// Stop after this many packets (0 = unlimited).
    pub packets: u64,
    /// Stop after this many MiB of raw particle data (0 = unlimited).
    pub max_mb: f64,
    /// Packets per second (0 = as fast as possible).
    pub pps: f64,
    pub seed: Option<u64>,
}

struct Generator {
    rng: StdRng,
    sent_packets: u64,
    sent_bytes: u64,
    max_packets: u64,
    max_bytes: u64,
    interval: Option<Duration>,
    next_at: Instant,
}

impl Generator {
    fn new(args: &SynthArgs) -> Self {
        let rng = match args.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let max_bytes = if args.max_mb > 0.0 {
            (args.max_mb * 1024.0 * 1024.0) as u64
        } else {
            0
        };
        let interval = (args.pps > 0.0).then(|| Duration::from_secs_f64(1.0 / args.pps));
        Self {
            rng,
            sent_packets: 0,
            sent_bytes: 0,
            max_packets: args.packets,
            max_bytes,
            interval,
            next_at: Instant::now(),
        }
    }

    fn exhausted(&self) -> bool {
        (self.max_packets > 0 && self.sent_packets >= self.max_packets)
            || (self.max_bytes > 0 && self.sent_bytes >= self.max_bytes)
    }

    /// A packet of 1..=1000 particles sharing the current wall-clock time.
    fn packet(&mut self) -> Result<ParticleBatch, BatchError> {
        let n = self.rng.random_range(1..=MAX_PACKET_PARTICLES);
        let now = Utc::now();
        let ts = now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) / 1e9;

        let mut scattering = vec![0i32; n * SCATTERING_LEN];
        let mut spectral = vec![0i32; n * SPECTRAL_LEN];
        self.rng.fill(scattering.as_mut_slice());
        self.rng.fill(spectral.as_mut_slice());

        let batch = ParticleBatch::new(vec![ts; n], scattering, spectral)?;
        self.sent_packets += 1;
        self.sent_bytes += n as u64 * PARTICLE_BYTES;
        Ok(batch)
    }
}

fn packets(args: &SynthArgs) -> impl Stream<Item = Result<ParticleBatch, BatchError>> {
    stream::unfold(Generator::new(args), |mut generator| async move {
        if generator.exhausted() {
            return None;
        }
        if let Some(interval) = generator.interval {
            tokio::time::sleep_until(generator.next_at).await;
            generator.next_at += interval;
        }
        let packet = generator.packet();
        Some((packet, generator))
    })
}

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

pub async fn cmd_synth(dir: &Path, config: StoreConfig, args: SynthArgs) -> CliResult<()> {
    info!(
        "generating packets into {} (packets={}, max_mb={}, pps={})",
        dir.display(),
        args.packets,
        args.max_mb,
        args.pps
    );
    let t0 = Instant::now();

    // A rejected packet ends the source; the session still flushes what it has.
    let mut rejected = None;
    let source = packets(&args).scan(&mut rejected, |rejected, packet| {
        future::ready(match packet {
            Ok(batch) => Some(batch),
            Err(e) => {
                **rejected = Some(e);
                None
            }
        })
    });

    let report = ingest(StoreLocation::local(dir), config, source, ctrl_c())
        .await
        .context(IngestSnafu {
            dir: dir.display().to_string(),
        })?;
    if let Some(source) = rejected {
        return Err(source).context(InvalidPacketSnafu {
            packet: report.batches + 1,
        });
    }

    let elapsed = t0.elapsed().as_secs_f64().max(f64::EPSILON);
    eprintln!(
        "Wrote to storage {} packets ({} bytes).",
        report.batches,
        report.particles_written * PARTICLE_BYTES
    );
    eprintln!(
        "Committed {} particles in {} chunks ({} bytes on disk).",
        report.particles_written, report.chunks_written, report.bytes_written
    );
    eprintln!(
        "Write bandwidth: {:.2} kParticles/s",
        report.particles_written as f64 / 1024.0 / elapsed
    );
    Ok(())
}
