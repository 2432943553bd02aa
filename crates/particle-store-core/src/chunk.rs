//! Immutable chunk files.
//!
//! A chunk is one flushed batch of particles serialized as a Parquet file.
//! Chunk files are published once (write-then-rename) and never modified
//! afterwards; the index entry pointing at a chunk is only written after the
//! file is durable.
//!
//! File names embed the minimum timestamp of the batch and a monotonic
//! sequence number, so a plain directory listing is roughly chronological:
//!
//! ```text
//! chunk-20250101T000000.000000000Z-000001.parquet
//! chunk-20250101T000005.250000000Z-000002.parquet
//! ```

pub mod codec;
pub mod writer;

use std::{fmt, path::Path};

use arrow::{error::ArrowError, record_batch::RecordBatch};
use bytes::Bytes;
use parquet::errors::ParquetError;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

use crate::{
    index::IndexEntry,
    model::{BatchError, timestamp_to_utc},
    storage::{self, StorageError, StoreLocation},
};

pub use codec::{chunk_schema, decode_chunk, encode_chunk};
pub use writer::{ChunkWriter, FlushError, StagedChunk};

const FILE_PREFIX: &str = "chunk-";
const FILE_SUFFIX: &str = ".parquet";

/// Identifier of a chunk: `<UTC min timestamp>-<sequence>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub String);

impl ChunkId {
    /// Minimum width of the zero-padded sequence suffix.
    pub const SEQ_DIGITS: usize = 6;

    /// Build the id for a chunk whose smallest timestamp is `min_ts`.
    ///
    /// Returns `None` when `min_ts` is not a representable UTC instant.
    pub fn new(min_ts: f64, seq: u64) -> Option<Self> {
        let stem = timestamp_to_utc(min_ts)?.format("%Y%m%dT%H%M%S%.9fZ");
        Some(ChunkId(format!(
            "{stem}-{seq:0width$}",
            width = Self::SEQ_DIGITS
        )))
    }

    /// Store-relative file name of this chunk.
    pub fn file_name(&self) -> String {
        format!("{FILE_PREFIX}{}{FILE_SUFFIX}", self.0)
    }

    /// Parse a chunk file name back into its id.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let id = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
        let id = ChunkId(id.to_string());
        id.seq().map(|_| id)
    }

    /// Sequence number embedded in the id.
    pub fn seq(&self) -> Option<u64> {
        let (_, seq) = self.0.rsplit_once('-')?;
        seq.parse().ok()
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors while encoding, decoding or accessing a single chunk file.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChunkError {
    /// The batch could not be converted into Arrow columns.
    #[snafu(display("Failed to build chunk columns: {source}"))]
    EncodeArrow {
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// The Parquet writer rejected the batch.
    #[snafu(display("Failed to encode chunk: {source}"))]
    Encode {
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// The batch minimum timestamp cannot be turned into a chunk id.
    #[snafu(display("Cannot derive a chunk id from min timestamp {min_ts}"))]
    InvalidChunkId {
        /// The offending minimum timestamp.
        min_ts: f64,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Reading or publishing the chunk file failed.
    #[snafu(display("Chunk storage error: {source}"))]
    Storage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// The file on disk does not have the size recorded in the index.
    #[snafu(display("Chunk file {path} is {found} bytes, index records {expected}"))]
    SizeMismatch {
        /// Store-relative path of the chunk file.
        path: String,
        /// Size recorded in the index entry.
        expected: u64,
        /// Actual size on disk.
        found: u64,
    },

    /// The file is not a readable Parquet file.
    #[snafu(display("Failed to decode chunk {path}: {source}"))]
    Decode {
        /// Store-relative path of the chunk file.
        path: String,
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// Arrow failed while materializing, filtering or sorting decoded rows.
    #[snafu(display("Arrow error on chunk {path}: {source}"))]
    DecodeArrow {
        /// Store-relative path of the chunk file.
        path: String,
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// The file decodes but its columns are not the chunk layout.
    #[snafu(display("Chunk {path} has an unexpected schema: {detail}"))]
    SchemaMismatch {
        /// Store-relative path of the chunk file.
        path: String,
        /// What did not match.
        detail: String,
    },

    /// Decoded values violate the particle model.
    #[snafu(display("Chunk {path} holds invalid particles: {source}"))]
    InvalidContents {
        /// Store-relative path of the chunk file.
        path: String,
        /// The model violation.
        source: BatchError,
    },
}

/// Read and decode the chunk referenced by `entry` into one record batch.
///
/// The file size is checked against the index before decoding so a truncated
/// file is reported as such rather than as a generic decode failure.
pub async fn read_chunk(
    location: &StoreLocation,
    entry: &IndexEntry,
) -> Result<RecordBatch, ChunkError> {
    let rel_path = Path::new(&entry.file_path);

    let bytes = storage::read_all_bytes(location, rel_path)
        .await
        .context(StorageSnafu)?;

    let found = bytes.len() as u64;
    ensure!(
        found == entry.file_size,
        SizeMismatchSnafu {
            path: entry.file_path.as_str(),
            expected: entry.file_size,
            found,
        }
    );

    decode_chunk(Bytes::from(bytes), &entry.file_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_embeds_utc_min_timestamp_and_sequence() {
        let id = ChunkId::new(1_735_689_600.5, 7).expect("valid timestamp");
        assert_eq!(id.0, "20250101T000000.500000000Z-000007");
        assert_eq!(id.seq(), Some(7));
        assert_eq!(id.file_name(), "chunk-20250101T000000.500000000Z-000007.parquet");
    }

    #[test]
    fn file_names_sort_by_min_timestamp() {
        let early = ChunkId::new(10.0, 2).expect("valid").file_name();
        let late = ChunkId::new(11.5, 1).expect("valid").file_name();
        assert!(early < late);
    }

    #[test]
    fn equal_min_timestamps_are_disambiguated_by_sequence() {
        let a = ChunkId::new(10.0, 1).expect("valid");
        let b = ChunkId::new(10.0, 2).expect("valid");
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn from_file_name_roundtrips_and_rejects_foreign_files() {
        let id = ChunkId::new(42.0, 3).expect("valid");
        assert_eq!(ChunkId::from_file_name(&id.file_name()), Some(id));
        assert_eq!(ChunkId::from_file_name("index.jsonl"), None);
        assert_eq!(ChunkId::from_file_name("chunk-nonsense.parquet"), None);
    }

    #[test]
    fn new_rejects_unrepresentable_timestamps() {
        assert!(ChunkId::new(f64::NAN, 1).is_none());
    }
}
