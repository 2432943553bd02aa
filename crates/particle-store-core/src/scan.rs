//! Range reads over committed chunks.
//!
//! A read session works from its own snapshot of the index:
//! - Pick the chunks whose `[min_ts, max_ts]` intersects the closed query
//!   window `[start, stop]`.
//! - Group chunks whose time ranges overlap each other. Groups are disjoint
//!   in time, so emitting them in `min_ts` order keeps the output ordered.
//! - Decode each chunk, drop rows outside the window (skipped when the chunk
//!   lies wholly inside it), and stably sort each group by timestamp.
//!
//! Chunks committed after the snapshot was taken only become visible after
//! [`ParticleReader::refresh`].

use std::pin::Pin;

use arrow::{
    array::{Float64Array, RecordBatch},
    compute::{
        filter_record_batch,
        kernels::{boolean as boolean_kernels, cmp as cmp_kernels},
    },
    error::ArrowError,
};
use futures::{Stream, StreamExt, TryStreamExt};
use log::debug;
use snafu::prelude::*;

use crate::{
    chunk::{self, ChunkError, DecodeArrowSnafu},
    error::{ChunkUnreadableSnafu, IndexSnafu, InvalidRangeSnafu, StoreError},
    index::{ChunkIndex, IndexEntry},
    model::ParticleBatch,
    storage::StoreLocation,
};

/// Stream of time-ordered particle batches produced by a range scan.
pub type ParticleScan = Pin<Box<dyn Stream<Item = Result<ParticleBatch, StoreError>> + Send>>;

/// Read-only session over a store.
#[derive(Debug, Clone)]
pub struct ParticleReader {
    index: ChunkIndex,
}

impl ParticleReader {
    /// Snapshot the index of the store at `location`.
    ///
    /// A store without an index yet reads as empty.
    pub async fn open(location: StoreLocation) -> Result<Self, StoreError> {
        let index = ChunkIndex::load(location).await.context(IndexSnafu)?;
        Ok(Self { index })
    }

    /// Pick up chunks committed since the snapshot was taken.
    ///
    /// Returns how many chunks became visible.
    pub async fn refresh(&mut self) -> Result<usize, StoreError> {
        self.index.refresh().await.context(IndexSnafu)
    }

    /// The index snapshot this session reads from.
    pub fn index(&self) -> &ChunkIndex {
        &self.index
    }

    /// Stream every particle with `start <= ts <= stop`, in non-decreasing
    /// timestamp order.
    ///
    /// Fails up front when `start > stop` or either bound is NaN. A chunk that
    /// cannot be read ends the stream with [`StoreError::ChunkUnreadable`].
    pub fn scan_range(&self, start: f64, stop: f64) -> Result<ParticleScan, StoreError> {
        if start.is_nan() || stop.is_nan() || start > stop {
            return InvalidRangeSnafu { start, stop }.fail();
        }

        let candidates = self.index.find_overlapping(start, stop);
        let groups = group_overlapping(candidates);
        debug!(
            "scan [{start}, {stop}] over {} chunk group(s) in {}",
            groups.len(),
            self.index.location()
        );

        let location = self.index.location().clone();
        let stream = futures::stream::iter(groups)
            .then(move |group| {
                let location = location.clone();
                async move { read_group(&location, &group, start, stop).await }
            })
            .try_filter(|batch| futures::future::ready(!batch.is_empty()));

        Ok(Box::pin(stream))
    }

    /// Collect [`ParticleReader::scan_range`] into a single batch.
    pub async fn read_range(&self, start: f64, stop: f64) -> Result<ParticleBatch, StoreError> {
        let batches: Vec<ParticleBatch> = self.scan_range(start, stop)?.try_collect().await?;
        Ok(ParticleBatch::concat(batches))
    }
}

/// Split time-ordered candidates into runs of mutually overlapping chunks.
///
/// Consecutive groups never overlap, so their contents can be emitted one
/// after the other without a global merge.
fn group_overlapping(candidates: Vec<IndexEntry>) -> Vec<Vec<IndexEntry>> {
    let mut groups: Vec<Vec<IndexEntry>> = Vec::new();
    let mut group_max = f64::NEG_INFINITY;

    for entry in candidates {
        match groups.last_mut() {
            Some(group) if entry.min_ts < group_max => {
                group_max = group_max.max(entry.max_ts);
                group.push(entry);
            }
            _ => {
                group_max = entry.max_ts;
                groups.push(vec![entry]);
            }
        }
    }
    groups
}

async fn read_group(
    location: &StoreLocation,
    group: &[IndexEntry],
    start: f64,
    stop: f64,
) -> Result<ParticleBatch, StoreError> {
    let mut parts = Vec::with_capacity(group.len());
    for entry in group {
        let part = read_chunk_window(location, entry, start, stop)
            .await
            .context(ChunkUnreadableSnafu {
                chunk_id: entry.chunk_id.clone(),
                path: entry.file_path.clone(),
            })?;
        parts.push(part);
    }
    Ok(ParticleBatch::concat(parts).sort_by_time())
}

async fn read_chunk_window(
    location: &StoreLocation,
    entry: &IndexEntry,
    start: f64,
    stop: f64,
) -> Result<ParticleBatch, ChunkError> {
    let batch = chunk::read_chunk(location, entry).await?;

    let batch = if entry.within(start, stop) {
        batch
    } else {
        filter_window(&batch, start, stop).context(DecodeArrowSnafu {
            path: entry.file_path.as_str(),
        })?
    };

    ParticleBatch::from_record_batch(&batch, &entry.file_path)
}

/// Keep rows with `start <= ts <= stop`.
fn filter_window(batch: &RecordBatch, start: f64, stop: f64) -> Result<RecordBatch, ArrowError> {
    let ts = batch.column(batch.schema().index_of(chunk::codec::TS_COLUMN)?);

    // Scalar bounds broadcast over the column without materializing them.
    let lower = cmp_kernels::gt_eq(ts, &Float64Array::new_scalar(start))?;
    let upper = cmp_kernels::lt_eq(ts, &Float64Array::new_scalar(stop))?;
    let mask = boolean_kernels::and(&lower, &upper)?;

    filter_record_batch(batch, &mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chunk::ChunkId,
        test_util::{TestResult, batch_with_timestamps},
    };

    fn entry(seq: u64, min_ts: f64, max_ts: f64) -> IndexEntry {
        let chunk_id = ChunkId::new(min_ts, seq).expect("valid timestamp");
        IndexEntry {
            file_path: chunk_id.file_name(),
            chunk_id,
            particle_count: 1,
            min_ts,
            max_ts,
            seq,
            file_size: 0,
        }
    }

    fn seqs(groups: &[Vec<IndexEntry>]) -> Vec<Vec<u64>> {
        groups
            .iter()
            .map(|g| g.iter().map(|e| e.seq).collect())
            .collect()
    }

    #[test]
    fn disjoint_chunks_form_singleton_groups() {
        let groups = group_overlapping(vec![entry(1, 0.0, 1.0), entry(2, 2.0, 3.0)]);
        assert_eq!(seqs(&groups), vec![vec![1], vec![2]]);
    }

    #[test]
    fn chunks_touching_at_a_boundary_need_no_merge() {
        let groups = group_overlapping(vec![entry(1, 0.0, 1.0), entry(2, 1.0, 3.0)]);
        assert_eq!(seqs(&groups), vec![vec![1], vec![2]]);
    }

    #[test]
    fn overlap_chains_through_a_long_chunk() {
        let groups = group_overlapping(vec![
            entry(1, 0.0, 10.0),
            entry(2, 2.0, 3.0),
            entry(3, 9.0, 12.0),
            entry(4, 12.5, 13.0),
        ]);
        assert_eq!(seqs(&groups), vec![vec![1, 2, 3], vec![4]]);
    }

    #[test]
    fn filter_window_keeps_closed_interval() -> TestResult {
        let batch = batch_with_timestamps(&[9.0, 10.0, 12.5, 15.0, 15.5]).to_record_batch()?;
        let kept = filter_window(&batch, 10.0, 15.0)?;
        let kept = ParticleBatch::from_record_batch(&kept, "mem")?;
        assert_eq!(kept.timestamps(), &[10.0, 12.5, 15.0]);
        Ok(())
    }

    #[tokio::test]
    async fn inverted_or_nan_ranges_are_rejected() -> TestResult {
        let tmp = tempfile::TempDir::new()?;
        let reader = ParticleReader::open(StoreLocation::local(tmp.path())).await?;

        for (start, stop) in [(2.0, 1.0), (f64::NAN, 1.0), (0.0, f64::NAN)] {
            let err = reader
                .scan_range(start, stop)
                .err()
                .expect("range must be rejected");
            assert!(matches!(err, StoreError::InvalidRange { .. }), "{err:?}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn empty_store_reads_nothing() -> TestResult {
        let tmp = tempfile::TempDir::new()?;
        let reader = ParticleReader::open(StoreLocation::local(tmp.path())).await?;
        let batch = reader.read_range(0.0, f64::MAX).await?;
        assert!(batch.is_empty());
        Ok(())
    }
}
