//! Consistency check between the index and the chunk files.
//!
//! Every index entry must point at a readable chunk whose particle count and
//! timestamp range match what the index claims. Chunk files with no index
//! entry are orphans from an interrupted flush; they are listed but never
//! treated as corruption, and never deleted.

use std::{fmt, path::Path};

use log::info;
use snafu::prelude::*;

use crate::{
    chunk::{self, ChunkId},
    error::{IndexSnafu, StorageSnafu, StoreError},
    index::{ChunkIndex, IndexEntry},
    model::ParticleBatch,
    storage::{self, StorageError, StoreLocation, TEMP_EXTENSION},
};

/// A disagreement between an index entry and its chunk file.
#[derive(Clone, Debug, PartialEq)]
pub enum ChunkProblem {
    /// The file is missing, truncated or does not decode.
    Unreadable {
        /// Id of the chunk.
        chunk_id: ChunkId,
        /// Why it could not be read.
        reason: String,
    },
    /// The file holds a different number of particles.
    CountMismatch {
        /// Id of the chunk.
        chunk_id: ChunkId,
        /// Count recorded in the index.
        indexed: u64,
        /// Count found in the file.
        actual: u64,
    },
    /// The file's timestamps span a different range.
    RangeMismatch {
        /// Id of the chunk.
        chunk_id: ChunkId,
        /// `(min_ts, max_ts)` recorded in the index.
        indexed: (f64, f64),
        /// `(min_ts, max_ts)` found in the file.
        actual: Option<(f64, f64)>,
    },
}

impl fmt::Display for ChunkProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkProblem::Unreadable { chunk_id, reason } => {
                write!(f, "chunk {chunk_id} is unreadable: {reason}")
            }
            ChunkProblem::CountMismatch {
                chunk_id,
                indexed,
                actual,
            } => write!(
                f,
                "chunk {chunk_id} holds {actual} particles, index records {indexed}"
            ),
            ChunkProblem::RangeMismatch {
                chunk_id,
                indexed,
                actual,
            } => match actual {
                Some((lo, hi)) => write!(
                    f,
                    "chunk {chunk_id} spans [{lo}, {hi}], index records [{}, {}]",
                    indexed.0, indexed.1
                ),
                None => write!(f, "chunk {chunk_id} is empty"),
            },
        }
    }
}

/// Outcome of [`verify`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VerifyReport {
    /// Index entries checked.
    pub chunks_checked: usize,
    /// Particles decoded across all readable chunks.
    pub particles_checked: u64,
    /// Entries whose chunk does not match.
    pub problems: Vec<ChunkProblem>,
    /// Chunk files that no index entry references.
    pub orphans: Vec<String>,
    /// Leftover temporary files from an interrupted write.
    pub temp_files: Vec<String>,
}

impl VerifyReport {
    /// Whether every index entry matches its chunk.
    ///
    /// Orphans and temporary files do not count against consistency.
    pub fn is_consistent(&self) -> bool {
        self.problems.is_empty()
    }
}

async fn check_entry(location: &StoreLocation, entry: &IndexEntry) -> Result<u64, ChunkProblem> {
    let unreadable = |reason: String| ChunkProblem::Unreadable {
        chunk_id: entry.chunk_id.clone(),
        reason,
    };

    let batch = chunk::read_chunk(location, entry)
        .await
        .map_err(|e| unreadable(e.to_string()))?;
    let particles = ParticleBatch::from_record_batch(&batch, &entry.file_path)
        .map_err(|e| unreadable(e.to_string()))?;

    let actual = particles.len() as u64;
    if actual != entry.particle_count {
        return Err(ChunkProblem::CountMismatch {
            chunk_id: entry.chunk_id.clone(),
            indexed: entry.particle_count,
            actual,
        });
    }

    let range = particles.time_range();
    if range != Some((entry.min_ts, entry.max_ts)) {
        return Err(ChunkProblem::RangeMismatch {
            chunk_id: entry.chunk_id.clone(),
            indexed: (entry.min_ts, entry.max_ts),
            actual: range,
        });
    }
    Ok(actual)
}

/// Check every index entry of the store at `location` against its file.
///
/// Problems with individual chunks are collected in the report; only a
/// failure to load the index or list the directory is an error.
pub async fn verify(location: &StoreLocation) -> Result<VerifyReport, StoreError> {
    let index = ChunkIndex::load(location.clone())
        .await
        .context(IndexSnafu)?;

    let mut report = VerifyReport::default();
    for entry in index.entries() {
        report.chunks_checked += 1;
        match check_entry(location, entry).await {
            Ok(particles) => report.particles_checked += particles,
            Err(problem) => report.problems.push(problem),
        }
    }

    let files = match storage::list_files(location).await {
        Ok(files) => files,
        Err(StorageError::NotFound { .. }) => Vec::new(),
        Err(source) => return Err(source).context(StorageSnafu),
    };
    for name in files {
        if Path::new(&name).extension().and_then(|e| e.to_str()) == Some(TEMP_EXTENSION) {
            report.temp_files.push(name);
        } else if let Some(id) = ChunkId::from_file_name(&name)
            && !index.contains(&id)
        {
            report.orphans.push(name);
        }
    }

    info!(
        "verified {} chunks in {}: {} problem(s), {} orphan(s)",
        report.chunks_checked,
        location,
        report.problems.len(),
        report.orphans.len()
    );
    Ok(report)
}
