//! Store configuration.

use std::{fmt, str::FromStr, time::Duration};

use parquet::basic::{Compression, ZstdLevel};
use snafu::prelude::*;

/// When the ingestion buffer hands its contents to the chunk writer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Flush once this many particles are buffered.
    ///
    /// One particle is ~6 KiB uncompressed, so the default keeps a chunk at
    /// roughly 50 MB.
    pub max_particles: usize,
    /// Flush once the oldest buffered particle has waited this long.
    pub max_latency: Duration,
}

impl FlushPolicy {
    /// Default particle threshold.
    pub const DEFAULT_MAX_PARTICLES: usize = 8_192;
    /// Default maximum buffering latency.
    pub const DEFAULT_MAX_LATENCY: Duration = Duration::from_secs(5);
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            max_particles: Self::DEFAULT_MAX_PARTICLES,
            max_latency: Self::DEFAULT_MAX_LATENCY,
        }
    }
}

/// Per-column compression codec used for chunk files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChunkCompression {
    /// No compression.
    None,
    /// Snappy.
    Snappy,
    /// Raw LZ4 blocks.
    #[default]
    Lz4,
    /// Zstandard at level 1.
    Zstd,
}

impl ChunkCompression {
    pub(crate) fn to_parquet(self) -> Compression {
        match self {
            ChunkCompression::None => Compression::UNCOMPRESSED,
            ChunkCompression::Snappy => Compression::SNAPPY,
            ChunkCompression::Lz4 => Compression::LZ4_RAW,
            ChunkCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
        }
    }
}

/// Error returned when parsing an unknown compression name.
#[derive(Debug, Snafu)]
#[snafu(display("Unknown compression '{name}' (expected none, snappy, lz4 or zstd)"))]
pub struct ParseCompressionError {
    name: String,
}

impl FromStr for ChunkCompression {
    type Err = ParseCompressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "uncompressed" => Ok(ChunkCompression::None),
            "snappy" => Ok(ChunkCompression::Snappy),
            "lz4" => Ok(ChunkCompression::Lz4),
            "zstd" => Ok(ChunkCompression::Zstd),
            _ => ParseCompressionSnafu { name: s }.fail(),
        }
    }
}

impl fmt::Display for ChunkCompression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChunkCompression::None => "none",
            ChunkCompression::Snappy => "snappy",
            ChunkCompression::Lz4 => "lz4",
            ChunkCompression::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

/// Configuration of a writer session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    /// Flush triggers.
    pub flush: FlushPolicy,
    /// Codec applied to every chunk column.
    pub compression: ChunkCompression,
    /// Extra attempts after a failed flush before the session gives up.
    pub flush_retries: u32,
    /// Pause between flush attempts.
    pub retry_backoff: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            flush: FlushPolicy::default(),
            compression: ChunkCompression::default(),
            flush_retries: 2,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

impl StoreConfig {
    /// Set the particle threshold.
    pub fn with_max_particles(mut self, max_particles: usize) -> Self {
        self.flush.max_particles = max_particles.max(1);
        self
    }

    /// Set the maximum buffering latency.
    pub fn with_max_latency(mut self, max_latency: Duration) -> Self {
        self.flush.max_latency = max_latency;
        self
    }

    /// Set the chunk codec.
    pub fn with_compression(mut self, compression: ChunkCompression) -> Self {
        self.compression = compression;
        self
    }

    /// Set retry behavior for failed flushes.
    pub fn with_retries(mut self, flush_retries: u32, retry_backoff: Duration) -> Self {
        self.flush_retries = flush_retries;
        self.retry_backoff = retry_backoff;
        self
    }
}
