//! End-to-end tests of the write and read paths:
//! - Particles written through a session come back intact from range reads.
//! - Range reads honor closed bounds and return timestamp order even when
//!   chunks overlap in time.
//! - Readers only see committed chunks and pick up new ones on refresh.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::time::Duration;

use common::{TestResult, batch, batch_salted, rows};
use futures::TryStreamExt;
use particle_store_core::{
    ParticleBatch, ParticleReader, ParticleWriter, StoreConfig, StoreError, StoreLocation, verify,
};
use tempfile::TempDir;

fn config(max_particles: usize) -> StoreConfig {
    StoreConfig::default()
        .with_max_particles(max_particles)
        .with_max_latency(Duration::from_secs(3_600))
}

async fn write_batches(
    location: &StoreLocation,
    max_particles: usize,
    batches: &[ParticleBatch],
) -> Result<(), StoreError> {
    let mut writer = ParticleWriter::open(location.clone(), config(max_particles)).await?;
    for b in batches {
        writer.append(b).await?;
    }
    writer.close().await?;
    Ok(())
}

#[tokio::test]
async fn written_particles_read_back_bit_exact() -> TestResult {
    let tmp = TempDir::new()?;
    let location = StoreLocation::local(tmp.path());
    let input = batch(&[1_735_689_600.0, 1_735_689_600.25, 1_735_689_601.5]);

    write_batches(&location, 1_000, std::slice::from_ref(&input)).await?;

    let reader = ParticleReader::open(location).await?;
    let output = reader.read_range(0.0, 2e9).await?;
    assert_eq!(output, input);
    Ok(())
}

#[tokio::test]
async fn one_particle_chunks_answer_closed_ranges() -> TestResult {
    let tmp = TempDir::new()?;
    let location = StoreLocation::local(tmp.path());

    write_batches(
        &location,
        1,
        &[batch(&[10.0]), batch(&[10.0, 11.5]), batch(&[20.0])],
    )
    .await?;

    let reader = ParticleReader::open(location).await?;
    assert_eq!(reader.index().len(), 3);

    let hits = reader.read_range(10.0, 15.0).await?;
    assert_eq!(hits.timestamps(), &[10.0, 10.0, 11.5]);

    assert!(reader.read_range(21.0, 22.0).await?.is_empty());
    assert_eq!(reader.read_range(20.0, 20.0).await?.timestamps(), &[20.0]);
    assert_eq!(reader.read_range(11.5, 19.999).await?.timestamps(), &[11.5]);
    Ok(())
}

#[tokio::test]
async fn range_read_returns_exactly_the_particles_inside_the_window() -> TestResult {
    let tmp = TempDir::new()?;
    let location = StoreLocation::local(tmp.path());

    let all: Vec<f64> = (0..200).map(|i| 100.0 + f64::from(i) * 0.5).collect();
    let batches: Vec<ParticleBatch> = all.chunks(7).map(batch).collect();
    write_batches(&location, 25, &batches).await?;

    let reader = ParticleReader::open(location).await?;
    let stored = reader.read_range(f64::MIN, f64::MAX).await?;

    for (start, stop) in [(100.0, 199.5), (120.25, 130.75), (150.0, 150.0), (0.0, 99.9)] {
        let got = reader.read_range(start, stop).await?;
        let expected: Vec<(f64, i32, i32)> = rows(&stored)
            .into_iter()
            .filter(|(ts, _, _)| *ts >= start && *ts <= stop)
            .collect();
        assert_eq!(rows(&got), expected, "window [{start}, {stop}]");
    }
    Ok(())
}

#[tokio::test]
async fn out_of_order_arrivals_are_returned_sorted() -> TestResult {
    let tmp = TempDir::new()?;
    let location = StoreLocation::local(tmp.path());

    // Late packets make the second chunk overlap the first in time.
    let first = batch_salted(&[5.0, 1.0, 3.0], 1);
    let second = batch_salted(&[2.0, 4.0, 3.0], 2);
    let third = batch_salted(&[9.0, 8.0], 3);
    write_batches(&location, 3, &[first, second, third]).await?;

    let reader = ParticleReader::open(location).await?;
    let out = reader.read_range(0.0, 100.0).await?;
    assert_eq!(out.timestamps(), &[1.0, 2.0, 3.0, 3.0, 4.0, 5.0, 8.0, 9.0]);
    assert!(out.is_time_sorted());

    // Equal timestamps keep commit order: the first chunk's 3.0 comes first.
    let threes: Vec<i32> = rows(&out)
        .into_iter()
        .filter(|(ts, _, _)| *ts == 3.0)
        .map(|(_, scat, _)| scat)
        .collect();
    let expected: Vec<i32> = [batch_salted(&[5.0, 1.0, 3.0], 1), batch_salted(&[2.0, 4.0, 3.0], 2)]
        .iter()
        .map(|b| b.scattering_of(2)[0])
        .collect();
    assert_eq!(threes, expected);
    Ok(())
}

#[tokio::test]
async fn scan_streams_batches_in_order() -> TestResult {
    let tmp = TempDir::new()?;
    let location = StoreLocation::local(tmp.path());
    write_batches(
        &location,
        2,
        &[batch(&[1.0, 2.0]), batch(&[3.0, 4.0]), batch(&[5.0, 6.0])],
    )
    .await?;

    let reader = ParticleReader::open(location).await?;
    let batches: Vec<ParticleBatch> = reader.scan_range(2.0, 5.0)?.try_collect().await?;

    let lens: Vec<usize> = batches.iter().map(ParticleBatch::len).collect();
    assert_eq!(lens, vec![1, 2, 1]);
    let flat = ParticleBatch::concat(batches);
    assert_eq!(flat.timestamps(), &[2.0, 3.0, 4.0, 5.0]);
    Ok(())
}

#[tokio::test]
async fn reader_sees_new_chunks_only_after_refresh() -> TestResult {
    let tmp = TempDir::new()?;
    let location = StoreLocation::local(tmp.path());
    let mut writer = ParticleWriter::open(location.clone(), config(1_000)).await?;
    writer.append(&batch(&[1.0])).await?;
    writer.flush().await?;

    let mut reader = ParticleReader::open(location).await?;
    assert_eq!(reader.read_range(0.0, 10.0).await?.len(), 1);

    writer.append(&batch(&[2.0, 3.0])).await?;
    assert_eq!(reader.read_range(0.0, 10.0).await?.len(), 1, "buffered data is invisible");

    writer.flush().await?;
    assert_eq!(reader.read_range(0.0, 10.0).await?.len(), 1, "snapshot is stable");

    assert_eq!(reader.refresh().await?, 1);
    assert_eq!(reader.read_range(0.0, 10.0).await?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn reopened_store_keeps_appending() -> TestResult {
    let tmp = TempDir::new()?;
    let location = StoreLocation::local(tmp.path());

    write_batches(&location, 1_000, &[batch(&[1.0, 2.0])]).await?;
    write_batches(&location, 1_000, &[batch(&[3.0])]).await?;

    let reader = ParticleReader::open(location.clone()).await?;
    assert_eq!(reader.index().len(), 2);
    assert_eq!(reader.index().total_particles(), 3);
    let seqs: Vec<u64> = reader.index().entries().iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2]);

    let report = verify(&location).await?;
    assert!(report.is_consistent(), "{report:?}");
    assert_eq!(report.particles_checked, 3);
    Ok(())
}

#[tokio::test]
async fn index_accounts_for_every_flushed_particle() -> TestResult {
    let tmp = TempDir::new()?;
    let location = StoreLocation::local(tmp.path());
    let batches: Vec<ParticleBatch> = (0..40)
        .map(|i| batch(&[f64::from(i), f64::from(i) + 0.5, f64::from(i) + 0.25]))
        .collect();

    write_batches(&location, 10, &batches).await?;

    let reader = ParticleReader::open(location.clone()).await?;
    assert_eq!(reader.index().total_particles(), 120);
    let report = verify(&location).await?;
    assert!(report.is_consistent(), "{report:?}");
    assert_eq!(report.particles_checked, 120);
    assert!(report.orphans.is_empty());
    Ok(())
}
