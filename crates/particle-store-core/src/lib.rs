//! Append-only storage engine for particle measurements.
//!
//! A store is a directory of immutable Parquet chunk files plus an
//! append-only JSON-lines index describing them:
//!
//! - [`ingest::ParticleWriter`] buffers incoming batches ([`buffer`]) and
//!   flushes them as chunks when a size or latency threshold is reached.
//! - [`chunk::ChunkWriter`] publishes each chunk file atomically and only
//!   then appends its [`index::IndexEntry`], so readers never see an entry
//!   for an incomplete file.
//! - [`scan::ParticleReader`] answers closed time-range queries from an
//!   index snapshot, returning particles in timestamp order.
//! - [`verify::verify`] cross-checks the index against the files on disk.
//!
//! One writer and any number of readers may use a store concurrently.
#![deny(missing_docs)]

pub mod buffer;
pub mod chunk;
pub mod config;
pub mod error;
pub mod index;
pub mod ingest;
pub mod model;
pub mod scan;
pub mod storage;
pub mod verify;

#[cfg(test)]
mod test_util;

pub use config::{ChunkCompression, FlushPolicy, StoreConfig};
pub use error::StoreError;
pub use index::IndexEntry;
pub use ingest::{IngestReport, ParticleWriter, ingest};
pub use model::{Particle, ParticleBatch};
pub use scan::{ParticleReader, ParticleScan};
pub use storage::StoreLocation;
pub use verify::{VerifyReport, verify};
