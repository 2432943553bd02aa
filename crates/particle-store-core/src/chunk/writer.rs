//! Turning buffered batches into committed chunks.
//!
//! Writing a chunk happens in two durable steps:
//!
//! 1. [`ChunkWriter::stage`] encodes the batch and publishes the chunk file
//!    with write-then-rename. After this the file is complete on disk but not
//!    yet visible to readers.
//! 2. [`ChunkWriter::commit`] appends the index entry. Once this returns the
//!    chunk is part of every subsequent range read.
//!
//! A crash between the two steps leaves an orphan chunk file that no index
//! entry references; it is harmless and reported by `verify`.

use std::{path::Path, sync::Arc};

use log::{debug, info, warn};
use snafu::prelude::*;

use super::{ChunkError, ChunkId, InvalidChunkIdSnafu, StorageSnafu, encode_chunk};
use crate::{
    config::ChunkCompression,
    index::{ChunkIndex, IndexEntry, IndexError, StorageSnafu as IndexStorageSnafu},
    model::ParticleBatch,
    storage::{self, StoreLocation, TEMP_EXTENSION},
};

/// Failure of one chunk write, by phase.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FlushError {
    /// Encoding or publishing the chunk file failed; nothing was written.
    #[snafu(display("Failed to stage chunk: {source}"))]
    Stage {
        /// Underlying chunk error.
        source: ChunkError,
    },

    /// The chunk file is durable but its index entry could not be appended.
    #[snafu(display("Failed to commit chunk {chunk_id}: {source}"))]
    Commit {
        /// The staged chunk.
        chunk_id: ChunkId,
        /// Underlying index error.
        source: IndexError,
    },

    /// The blocking encoder task did not complete.
    #[snafu(display("Chunk encoder task failed: {source}"))]
    EncoderTask {
        /// Join failure from the blocking pool.
        source: tokio::task::JoinError,
    },
}

impl FlushError {
    /// Whether trying the same flush again is safe.
    ///
    /// After a failed index rollback the file may already hold the entry, so
    /// appending it again would write it twice.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FlushError::Commit {
                source: IndexError::Rollback { .. },
                ..
            }
        )
    }
}

/// A chunk file that is durable on disk but not yet in the index.
#[derive(Debug, Clone)]
pub struct StagedChunk {
    entry: IndexEntry,
}

impl StagedChunk {
    /// The index entry that [`ChunkWriter::commit`] will append.
    pub fn entry(&self) -> &IndexEntry {
        &self.entry
    }
}

/// The single writer of a store directory.
///
/// Owns the append side of the index and allocates chunk sequence numbers.
#[derive(Debug)]
pub struct ChunkWriter {
    location: StoreLocation,
    compression: ChunkCompression,
    index: ChunkIndex,
    next_seq: u64,
}

impl ChunkWriter {
    /// Open a store for writing, creating its directory if needed.
    ///
    /// Opening also recovers from a previous crash: stale temporary files
    /// are removed and a torn index line is truncated. Sequence numbers
    /// continue past every chunk file present, indexed or not, so a new chunk
    /// never reuses an orphan's name.
    pub async fn open(
        location: StoreLocation,
        compression: ChunkCompression,
    ) -> Result<Self, IndexError> {
        storage::ensure_root(&location)
            .await
            .context(IndexStorageSnafu)?;

        let index = ChunkIndex::open_for_append(location.clone()).await?;
        let files = storage::list_files(&location)
            .await
            .context(IndexStorageSnafu)?;

        let mut max_seq = index.max_seq().unwrap_or(0);
        for name in &files {
            if Path::new(name).extension().and_then(|e| e.to_str()) == Some(TEMP_EXTENSION) {
                warn!("removing stale temporary file {name} in {location}");
                storage::remove_file(&location, Path::new(name))
                    .await
                    .context(IndexStorageSnafu)?;
                continue;
            }
            if let Some(id) = ChunkId::from_file_name(name) {
                if !index.contains(&id) {
                    warn!("chunk file {name} is not in the index; leaving it in place");
                }
                max_seq = max_seq.max(id.seq().unwrap_or(0));
            }
        }

        debug!(
            "opened {location} for writing: {} chunks, next seq {}",
            index.len(),
            max_seq + 1
        );

        Ok(Self {
            location,
            compression,
            index,
            next_seq: max_seq + 1,
        })
    }

    /// The writer's view of the index.
    pub fn index(&self) -> &ChunkIndex {
        &self.index
    }

    /// Store being written.
    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// Encode `batch` and publish it as a chunk file.
    ///
    /// Returns `None` for an empty batch; no file is created. The sequence
    /// number is only consumed once the file is in place, so a failed stage
    /// can be retried under the same name.
    pub async fn stage(
        &mut self,
        batch: Arc<ParticleBatch>,
    ) -> Result<Option<StagedChunk>, FlushError> {
        let Some((min_ts, max_ts)) = batch.time_range() else {
            return Ok(None);
        };

        let seq = self.next_seq;
        let chunk_id = ChunkId::new(min_ts, seq)
            .context(InvalidChunkIdSnafu { min_ts })
            .context(StageSnafu)?;
        let file_path = chunk_id.file_name();
        let particle_count = batch.len() as u64;

        let compression = self.compression;
        let bytes = tokio::task::spawn_blocking(move || encode_chunk(&batch, compression))
            .await
            .context(EncoderTaskSnafu)?
            .context(StageSnafu)?;

        storage::write_atomic(&self.location, Path::new(&file_path), &bytes)
            .await
            .context(StorageSnafu)
            .context(StageSnafu)?;
        self.next_seq += 1;

        debug!(
            "staged chunk {chunk_id}: {particle_count} particles, {} bytes",
            bytes.len()
        );

        Ok(Some(StagedChunk {
            entry: IndexEntry {
                chunk_id,
                file_path,
                particle_count,
                min_ts,
                max_ts,
                seq,
                file_size: bytes.len() as u64,
            },
        }))
    }

    /// Append the staged chunk's entry to the index.
    ///
    /// On failure the staged chunk is still valid and may be committed again.
    pub async fn commit(&mut self, staged: &StagedChunk) -> Result<IndexEntry, FlushError> {
        let entry = staged.entry.clone();
        self.index
            .append_entry(entry.clone())
            .await
            .context(CommitSnafu {
                chunk_id: entry.chunk_id.clone(),
            })?;

        info!(
            "committed chunk {} ({} particles, ts [{}, {}])",
            entry.chunk_id, entry.particle_count, entry.min_ts, entry.max_ts
        );
        Ok(entry)
    }

    /// Stage and commit in one step. An empty batch is a no-op.
    pub async fn write_chunk(
        &mut self,
        batch: Arc<ParticleBatch>,
    ) -> Result<Option<IndexEntry>, FlushError> {
        match self.stage(batch).await? {
            Some(staged) => self.commit(&staged).await.map(Some),
            None => Ok(None),
        }
    }
}
