//! Append-only chunk index.
//!
//! The index is a JSON-lines file at the store root with one [`IndexEntry`]
//! per committed chunk:
//!
//! ```text
//! <root>/index.jsonl
//! {"chunk_id":"20250101T000000.000000000Z-000001","file_path":"chunk-...parquet",...}
//! {"chunk_id":"20250101T000005.250000000Z-000002","file_path":"chunk-...parquet",...}
//! ```
//!
//! Only complete, newline-terminated lines count as committed. A writer that
//! crashes mid-append leaves a torn final line behind; readers skip it, and
//! the next writer to open the store truncates it away. Lines are appended
//! with an fsync before [`ChunkIndex::append_entry`] returns, and a chunk's
//! entry is only appended after the chunk file itself is durable, so every
//! entry a reader can see points at a complete file.

use std::{cmp::Ordering, collections::HashSet, path::Path};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

use crate::{
    chunk::ChunkId,
    storage::{self, StorageError, StoreLocation},
};

/// File name of the index at the store root.
pub const INDEX_FILE_NAME: &str = "index.jsonl";

/// Metadata recorded for one committed chunk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Identifier of the chunk.
    pub chunk_id: ChunkId,
    /// Chunk file path relative to the store root.
    pub file_path: String,
    /// Number of particles in the chunk.
    pub particle_count: u64,
    /// Smallest timestamp in the chunk.
    pub min_ts: f64,
    /// Largest timestamp in the chunk.
    pub max_ts: f64,
    /// Sequence number assigned by the writer.
    pub seq: u64,
    /// Size of the chunk file in bytes.
    pub file_size: u64,
}

impl IndexEntry {
    /// Whether `[min_ts, max_ts]` intersects the closed window `[start, stop]`.
    pub fn overlaps(&self, start: f64, stop: f64) -> bool {
        self.max_ts >= start && self.min_ts <= stop
    }

    /// Whether the whole chunk lies inside the closed window `[start, stop]`.
    pub fn within(&self, start: f64, stop: f64) -> bool {
        self.min_ts >= start && self.max_ts <= stop
    }
}

/// Deterministic ordering: `min_ts`, then `max_ts`, then `chunk_id`.
pub(crate) fn cmp_entries_by_time(a: &IndexEntry, b: &IndexEntry) -> Ordering {
    a.min_ts
        .total_cmp(&b.min_ts)
        .then_with(|| a.max_ts.total_cmp(&b.max_ts))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

/// Errors from loading or appending to the index.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IndexError {
    /// The index file could not be read or written.
    #[snafu(display("Index storage error: {source}"))]
    Storage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// A complete line of the index is not a valid entry.
    #[snafu(display("Corrupt index entry on line {line}: {msg}"))]
    CorruptEntry {
        /// 1-based line number in the index file.
        line: usize,
        /// What is wrong with it.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A failed append could not be undone, so the file may end with a line
    /// that was never acknowledged.
    #[snafu(display("Failed to roll the index back to {len} bytes: {source}"))]
    Rollback {
        /// Committed length the file should have been cut back to.
        len: u64,
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// An entry with the same chunk id is already committed.
    #[snafu(display("Chunk {chunk_id} is already in the index"))]
    DuplicateEntry {
        /// The repeated id.
        chunk_id: ChunkId,
    },

    /// An entry could not be serialized.
    #[snafu(display("Failed to serialize index entry: {source}"))]
    Serialize {
        /// Underlying JSON error.
        source: serde_json::Error,
    },
}

/// In-memory view of the index file.
///
/// Entries are kept sorted by time so overlap queries can binary-search on
/// `min_ts`. The view remembers how many bytes of the file it has consumed,
/// which lets [`ChunkIndex::refresh`] pick up entries committed by a
/// concurrent writer without re-reading the whole file.
#[derive(Debug, Clone)]
pub struct ChunkIndex {
    location: StoreLocation,
    entries: Vec<IndexEntry>,
    ids: HashSet<ChunkId>,
    consumed: u64,
    lines: usize,
}

struct ParsedLines {
    // Each entry with its 1-based line number.
    entries: Vec<(usize, IndexEntry)>,
    consumed: u64,
    lines: usize,
    torn_tail: usize,
}

fn parse_line(bytes: &[u8], line: usize) -> Result<IndexEntry, IndexError> {
    let entry: IndexEntry = serde_json::from_slice(bytes).map_err(|e| IndexError::CorruptEntry {
        line,
        msg: e.to_string(),
        backtrace: Backtrace::capture(),
    })?;

    ensure!(
        entry.min_ts.is_finite() && entry.max_ts.is_finite() && entry.min_ts <= entry.max_ts,
        CorruptEntrySnafu {
            line,
            msg: format!(
                "invalid time range [{}, {}] for chunk {}",
                entry.min_ts, entry.max_ts, entry.chunk_id
            ),
        }
    );
    ensure!(
        entry.particle_count > 0,
        CorruptEntrySnafu {
            line,
            msg: format!("chunk {} has no particles", entry.chunk_id),
        }
    );
    Ok(entry)
}

// Parse every newline-terminated line in `buf`; a trailing fragment without
// a newline is left unconsumed.
fn parse_lines(buf: &[u8], lines_before: usize) -> Result<ParsedLines, IndexError> {
    let mut entries = Vec::new();
    let mut consumed = 0usize;
    let mut lines = lines_before;

    while let Some(len) = buf[consumed..].iter().position(|b| *b == b'\n') {
        let raw = &buf[consumed..consumed + len];
        consumed += len + 1;
        lines += 1;

        if raw.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        entries.push((lines, parse_line(raw, lines)?));
    }

    Ok(ParsedLines {
        entries,
        consumed: consumed as u64,
        lines,
        torn_tail: buf.len() - consumed,
    })
}

impl ChunkIndex {
    fn rel_path() -> &'static Path {
        Path::new(INDEX_FILE_NAME)
    }

    fn empty(location: StoreLocation) -> Self {
        Self {
            location,
            entries: Vec::new(),
            ids: HashSet::new(),
            consumed: 0,
            lines: 0,
        }
    }

    /// Load every committed entry. A missing index file is an empty store.
    ///
    /// A torn final line is ignored.
    pub async fn load(location: StoreLocation) -> Result<Self, IndexError> {
        let mut index = Self::empty(location);
        let torn = index.read_new_lines().await?;
        if torn > 0 {
            debug!(
                "ignoring {torn} bytes of incomplete index line in {}",
                index.location
            );
        }
        Ok(index)
    }

    /// Load the index for exclusive appending.
    ///
    /// A torn final line left by a crashed writer is truncated so the next
    /// append starts on a clean line.
    pub(crate) async fn open_for_append(location: StoreLocation) -> Result<Self, IndexError> {
        let mut index = Self::empty(location);
        let torn = index.read_new_lines().await?;
        if torn > 0 {
            warn!(
                "truncating {torn} bytes of torn index line in {}",
                index.location
            );
            storage::truncate(&index.location, Self::rel_path(), index.consumed)
                .await
                .context(StorageSnafu)?;
        }
        Ok(index)
    }

    /// Pick up entries committed since the last load or refresh.
    ///
    /// Returns how many entries were added.
    pub async fn refresh(&mut self) -> Result<usize, IndexError> {
        let before = self.entries.len();
        self.read_new_lines().await?;
        Ok(self.entries.len() - before)
    }

    // Returns the length of the unterminated tail, which stays unconsumed.
    async fn read_new_lines(&mut self) -> Result<usize, IndexError> {
        let buf = match storage::read_from_offset(&self.location, Self::rel_path(), self.consumed)
            .await
        {
            Ok(buf) => buf,
            Err(StorageError::NotFound { .. }) => return Ok(0),
            Err(source) => return Err(IndexError::Storage { source }),
        };

        // Nothing changes unless every new line is accepted.
        let parsed = parse_lines(&buf, self.lines)?;
        let fresh = self.accept_new(parsed.entries)?;
        if !fresh.is_empty() {
            self.ids.extend(fresh.iter().map(|e| e.chunk_id.clone()));
            self.entries.extend(fresh);
            self.entries.sort_by(cmp_entries_by_time);
        }
        self.consumed += parsed.consumed;
        self.lines = parsed.lines;
        Ok(parsed.torn_tail)
    }

    // An exact repeat of a known entry is left over from a retried append
    // and is skipped; a different entry under a known id is corruption.
    fn accept_new(
        &self,
        parsed: Vec<(usize, IndexEntry)>,
    ) -> Result<Vec<IndexEntry>, IndexError> {
        let mut fresh: Vec<IndexEntry> = Vec::with_capacity(parsed.len());
        let mut fresh_ids = HashSet::new();

        for (line, entry) in parsed {
            let known = self.ids.contains(&entry.chunk_id) || fresh_ids.contains(&entry.chunk_id);
            let repeat = known.then(|| {
                self.entries
                    .iter()
                    .chain(&fresh)
                    .any(|e| *e == entry)
            });
            match repeat {
                None => {
                    fresh_ids.insert(entry.chunk_id.clone());
                    fresh.push(entry);
                }
                Some(true) => warn!(
                    "index line {line} repeats chunk {} in {}; skipping it",
                    entry.chunk_id, self.location
                ),
                Some(false) => {
                    return CorruptEntrySnafu {
                        line,
                        msg: format!(
                            "chunk {} is listed twice with different contents",
                            entry.chunk_id
                        ),
                    }
                    .fail();
                }
            }
        }
        Ok(fresh)
    }

    fn insert(&mut self, entry: IndexEntry) {
        self.ids.insert(entry.chunk_id.clone());
        let pos = self
            .entries
            .partition_point(|e| cmp_entries_by_time(e, &entry) != Ordering::Greater);
        self.entries.insert(pos, entry);
    }

    // Cut the file back to the last committed length. A file that never
    // existed has nothing to undo.
    pub(crate) async fn rollback(&self) -> Result<(), StorageError> {
        match storage::truncate(&self.location, Self::rel_path(), self.consumed).await {
            Err(StorageError::NotFound { .. }) if self.consumed == 0 => Ok(()),
            other => other,
        }
    }

    /// Durably append one entry.
    ///
    /// When the append fails the file is truncated back to its last committed
    /// length, so a partial line never precedes the next attempt. If that
    /// truncation fails too, [`IndexError::Rollback`] is returned and the
    /// append must not be retried.
    pub async fn append_entry(&mut self, entry: IndexEntry) -> Result<(), IndexError> {
        ensure!(
            !self.ids.contains(&entry.chunk_id),
            DuplicateEntrySnafu {
                chunk_id: entry.chunk_id.clone(),
            }
        );

        let mut line = serde_json::to_vec(&entry).context(SerializeSnafu)?;
        line.push(b'\n');

        match storage::append_durable(&self.location, Self::rel_path(), &line).await {
            Ok(len) => {
                self.consumed = len;
                self.lines += 1;
                self.insert(entry);
                Ok(())
            }
            Err(source) => {
                warn!("index append for chunk {} failed: {source}", entry.chunk_id);
                self.rollback().await.context(RollbackSnafu {
                    len: self.consumed,
                })?;
                Err(IndexError::Storage { source })
            }
        }
    }

    /// Entries whose time range intersects `[start, stop]`, ordered by
    /// `min_ts`.
    pub fn find_overlapping(&self, start: f64, stop: f64) -> Vec<IndexEntry> {
        // Everything past `end` starts after the window.
        let end = self.entries.partition_point(|e| e.min_ts <= stop);
        self.entries[..end]
            .iter()
            .filter(|e| e.max_ts >= start)
            .cloned()
            .collect()
    }

    /// All committed entries, ordered by time.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Whether `chunk_id` is committed.
    pub fn contains(&self, chunk_id: &ChunkId) -> bool {
        self.ids.contains(chunk_id)
    }

    /// Number of committed chunks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no chunk is committed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest sequence number in the index.
    pub fn max_seq(&self) -> Option<u64> {
        self.entries.iter().map(|e| e.seq).max()
    }

    /// Total particles across all committed chunks.
    pub fn total_particles(&self) -> u64 {
        self.entries.iter().map(|e| e.particle_count).sum()
    }

    /// Smallest `min_ts` and largest `max_ts` over all chunks.
    pub fn time_range(&self) -> Option<(f64, f64)> {
        let first = self.entries.first()?;
        let max = self
            .entries
            .iter()
            .map(|e| e.max_ts)
            .fold(first.max_ts, f64::max);
        Some((first.min_ts, max))
    }

    /// Store this index belongs to.
    pub fn location(&self) -> &StoreLocation {
        &self.location
    }
}
