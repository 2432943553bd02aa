//! CLI tool for writing, reading and checking particle stores.

mod error;
mod inspect;
mod read;
mod synth;

use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum};
use particle_store_core::{ChunkCompression, FlushPolicy, StoreConfig};
use tracing_subscriber::EnvFilter;

use crate::{
    error::CliResult,
    inspect::{cmd_inspect, cmd_verify},
    read::{ReadArgs, cmd_read},
    synth::{SynthArgs, cmd_synth},
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormatArg {
    Csv,
    Jsonl,
}

impl From<OutputFormatArg> for read::OutputFormat {
    fn from(v: OutputFormatArg) -> Self {
        match v {
            OutputFormatArg::Csv => read::OutputFormat::Csv,
            OutputFormatArg::Jsonl => read::OutputFormat::Jsonl,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CompressionArg {
    None,
    Snappy,
    Lz4,
    Zstd,
}

impl From<CompressionArg> for ChunkCompression {
    fn from(v: CompressionArg) -> Self {
        match v {
            CompressionArg::None => ChunkCompression::None,
            CompressionArg::Snappy => ChunkCompression::Snappy,
            CompressionArg::Lz4 => ChunkCompression::Lz4,
            CompressionArg::Zstd => ChunkCompression::Zstd,
        }
    }
}

/// Writer tuning shared by commands that ingest.
#[derive(Debug, Args)]
struct WriterOpts {
    /// Flush a chunk once this many particles are buffered
    #[arg(long = "flush-particles", default_value_t = FlushPolicy::DEFAULT_MAX_PARTICLES)]
    flush_particles: usize,

    /// Flush a chunk once the oldest buffered particle is this old (ms)
    #[arg(long = "flush-latency-ms", default_value_t = 5_000)]
    flush_latency_ms: u64,

    /// Chunk compression
    #[arg(long, value_enum, default_value_t = CompressionArg::Lz4)]
    compression: CompressionArg,
}

impl WriterOpts {
    fn to_config(&self) -> StoreConfig {
        StoreConfig::default()
            .with_max_particles(self.flush_particles.max(1))
            .with_max_latency(Duration::from_millis(self.flush_latency_ms))
            .with_compression(self.compression.into())
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Read back the particles recorded between two times (inclusive)
    Read {
        /// Epoch seconds or ISO 8601 (naive times are UTC)
        #[arg(long)]
        start: String,

        /// Epoch seconds or ISO 8601 (naive times are UTC)
        #[arg(long)]
        stop: String,

        /// Write the particles to this file
        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = OutputFormatArg::Csv)]
        format: OutputFormatArg,
    },

    /// List the indexed chunks and their totals
    Inspect,

    /// Check every indexed chunk against its file
    Verify,

    /// Generate random packets and ingest them
    Synth {
        /// Stop after this many packets (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        packets: u64,

        /// Stop after this many MiB of particle data (0 = unlimited)
        #[arg(long = "max-mb", default_value_t = 0.0)]
        max_mb: f64,

        /// Packets per second (0 = unlimited)
        #[arg(long, default_value_t = 0.0)]
        pps: f64,

        /// Seed for reproducible grids
        #[arg(long)]
        seed: Option<u64>,

        #[command(flatten)]
        writer: WriterOpts,
    },
}

#[derive(Debug, Parser)]
#[command(name = "pstore", version, about)]
struct Cli {
    /// Store directory
    #[arg(long, global = true, default_value = "./data")]
    dir: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();
    init_logging();

    match cli.cmd {
        Command::Read {
            start,
            stop,
            output,
            format,
        } => {
            cmd_read(
                &cli.dir,
                ReadArgs {
                    start,
                    stop,
                    output,
                    format: format.into(),
                },
            )
            .await
        }

        Command::Inspect => cmd_inspect(&cli.dir).await,

        Command::Verify => cmd_verify(&cli.dir).await,

        Command::Synth {
            packets,
            max_mb,
            pps,
            seed,
            writer,
        } => {
            let config = writer.to_config();
            cmd_synth(
                &cli.dir,
                config,
                SynthArgs {
                    packets,
                    max_mb,
                    pps,
                    seed,
                },
            )
            .await
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{e}");
        let mut source = std::error::Error::source(&e);
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
        std::process::exit(1);
    }
}
