//! Top-level error type for store sessions.

use snafu::prelude::*;

use crate::{
    chunk::{ChunkError, ChunkId, FlushError},
    index::IndexError,
    model::BatchError,
    storage::StorageError,
};

/// Errors returned by writer and reader sessions.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// Input columns do not form a valid batch; nothing was buffered.
    #[snafu(display("Rejected batch: {source}"))]
    InvalidBatch {
        /// The validation failure.
        source: BatchError,
    },

    /// A range query with `start > stop` or a NaN bound.
    #[snafu(display("Invalid time range: start {start} is after stop {stop}"))]
    InvalidRange {
        /// Requested start.
        start: f64,
        /// Requested stop.
        stop: f64,
    },

    /// Storage failure outside of a specific chunk or the index.
    #[snafu(display("Storage error: {source}"))]
    Storage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// The index could not be loaded or appended to.
    #[snafu(display("Index error: {source}"))]
    Index {
        /// Underlying index error.
        source: IndexError,
    },

    /// An indexed chunk is missing, truncated or does not decode.
    #[snafu(display("Chunk {chunk_id} at {path} is unreadable: {source}"))]
    ChunkUnreadable {
        /// Id of the chunk.
        chunk_id: ChunkId,
        /// Store-relative path of the chunk file.
        path: String,
        /// What went wrong.
        #[snafu(source(from(ChunkError, Box::new)))]
        source: Box<ChunkError>,
    },

    /// A flush kept failing after all retries; the batch is held by the
    /// writer.
    #[snafu(display("Flush of {particles} particles failed after {attempts} attempts: {source}"))]
    FlushFailed {
        /// Particles in the held batch.
        particles: usize,
        /// Attempts made, including the first.
        attempts: u32,
        /// Failure of the last attempt.
        source: FlushError,
    },

    /// A previous flush failed; the writer accepts no more data.
    #[snafu(display("Writer is unusable after an earlier flush failure"))]
    WriterPoisoned,

    /// The background flush task panicked or was cancelled.
    #[snafu(display("Flush task did not complete: {source}"))]
    FlushWorker {
        /// Join failure.
        source: tokio::task::JoinError,
    },
}
