//! Writer sessions: buffering, flushing and the ingestion loop.
//!
//! A [`ParticleWriter`] owns the ingestion buffer and the store's
//! [`ChunkWriter`]. When a flush is due the buffered batch is handed to a
//! background task together with the chunk writer, and appends keep filling
//! a fresh buffer in the meantime. At most one flush is in flight: the next
//! flush first waits for the previous one, which keeps chunks committed in
//! flush order and throttles producers that outpace the disk.
//!
//! A failed flush is retried with a fixed backoff. When every attempt fails
//! the batch is kept in memory, the error is reported, and the session
//! refuses further appends; [`ParticleWriter::into_unflushed`] hands the
//! particles back.

use std::{future::Future, sync::Arc, time::Duration};

use futures::{Stream, StreamExt};
use log::{debug, error, info, warn};
use snafu::{IntoError, prelude::*};
use tokio::{task::JoinHandle, time::Instant};

use crate::{
    buffer::{FlushReason, IngestBuffer},
    chunk::{ChunkWriter, FlushError, StagedChunk},
    config::StoreConfig,
    error::{
        FlushFailedSnafu, FlushWorkerSnafu, IndexSnafu, InvalidBatchSnafu, StoreError,
        WriterPoisonedSnafu,
    },
    index::IndexEntry,
    model::ParticleBatch,
    storage::StoreLocation,
};

/// Counters for one writer session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Non-empty batches accepted.
    pub batches: u64,
    /// Particles accepted into the buffer.
    pub particles_received: u64,
    /// Particles committed to chunks.
    pub particles_written: u64,
    /// Chunks committed.
    pub chunks_written: u64,
    /// Bytes of chunk files committed.
    pub bytes_written: u64,
}

impl IngestReport {
    fn record_commit(&mut self, entry: &IndexEntry) {
        self.chunks_written += 1;
        self.particles_written += entry.particle_count;
        self.bytes_written += entry.file_size;
    }
}

#[derive(Debug)]
struct FlushFailure {
    batch: ParticleBatch,
    error: StoreError,
}

type FlushOutcome = (ChunkWriter, Result<Option<IndexEntry>, FlushFailure>);

#[derive(Debug)]
enum WriterSlot {
    Idle(ChunkWriter),
    InFlight(JoinHandle<FlushOutcome>),
    Poisoned,
}

/// The write side of a store.
///
/// Only one writer session may be open per store directory.
#[derive(Debug)]
pub struct ParticleWriter {
    config: StoreConfig,
    buffer: IngestBuffer,
    slot: WriterSlot,
    held: Option<ParticleBatch>,
    last_committed: Option<IndexEntry>,
    report: IngestReport,
}

impl ParticleWriter {
    /// Open `location` for writing, recovering from any previous crash.
    pub async fn open(location: StoreLocation, config: StoreConfig) -> Result<Self, StoreError> {
        let writer = ChunkWriter::open(location, config.compression)
            .await
            .context(IndexSnafu)?;
        info!(
            "writer open on {} (flush at {} particles or {:?})",
            writer.location(),
            config.flush.max_particles,
            config.flush.max_latency
        );
        Ok(Self {
            buffer: IngestBuffer::new(config.flush.clone()),
            config,
            slot: WriterSlot::Idle(writer),
            held: None,
            last_committed: None,
            report: IngestReport::default(),
        })
    }

    /// Buffer `batch`, starting a flush if the particle threshold or the
    /// latency limit is reached.
    ///
    /// May wait for a previous flush to finish.
    pub async fn append(&mut self, batch: &ParticleBatch) -> Result<(), StoreError> {
        ensure!(
            !matches!(self.slot, WriterSlot::Poisoned),
            WriterPoisonedSnafu
        );
        if batch.is_empty() {
            return Ok(());
        }

        self.report.batches += 1;
        self.report.particles_received += batch.len() as u64;
        self.buffer.append(batch);

        self.flush_if_due().await?;
        Ok(())
    }

    /// Validate raw columns and buffer them.
    ///
    /// Malformed input is rejected with [`StoreError::InvalidBatch`] and
    /// nothing is buffered.
    pub async fn append_parts(
        &mut self,
        timestamps: Vec<f64>,
        scattering: Vec<i32>,
        spectral: Vec<i32>,
    ) -> Result<(), StoreError> {
        let batch =
            ParticleBatch::new(timestamps, scattering, spectral).context(InvalidBatchSnafu)?;
        self.append(&batch).await
    }

    /// Start a flush if one is due now. Returns whether a flush started.
    pub async fn flush_if_due(&mut self) -> Result<bool, StoreError> {
        match self.buffer.flush_reason(Instant::now()) {
            Some(reason) => self.begin_flush(reason).await,
            None => Ok(false),
        }
    }

    /// Flush everything buffered and wait until it is durable.
    ///
    /// Returns the committed entry, or `None` when nothing was buffered.
    pub async fn flush(&mut self) -> Result<Option<IndexEntry>, StoreError> {
        let started = self.begin_flush(FlushReason::Requested).await?;
        let writer = self.settle().await?;
        self.slot = WriterSlot::Idle(writer);
        Ok(if started {
            self.last_committed.clone()
        } else {
            None
        })
    }

    /// Flush what is left and wait for all pending writes.
    ///
    /// On error the unflushed particles stay available through
    /// [`ParticleWriter::into_unflushed`].
    pub async fn close(&mut self) -> Result<IngestReport, StoreError> {
        self.begin_flush(FlushReason::Shutdown).await?;
        let writer = self.settle().await?;
        info!(
            "writer on {} closed: {} particles in {} chunks",
            writer.location(),
            self.report.particles_written,
            self.report.chunks_written
        );
        self.slot = WriterSlot::Idle(writer);
        Ok(self.report.clone())
    }

    /// When the buffered particles must be flushed by the latency limit.
    pub fn deadline(&self) -> Option<Instant> {
        self.buffer.deadline()
    }

    /// Particles waiting in the buffer.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Counters so far. Flushes still in flight are not included.
    pub fn report(&self) -> &IngestReport {
        &self.report
    }

    /// Give up on the session and take back every particle not yet
    /// committed: a batch held after a failed flush, followed by the buffer.
    pub fn into_unflushed(mut self) -> Option<ParticleBatch> {
        let pending = self.buffer.take();
        let batch = ParticleBatch::concat(self.held.take().into_iter().chain(pending));
        (!batch.is_empty()).then_some(batch)
    }

    async fn begin_flush(&mut self, reason: FlushReason) -> Result<bool, StoreError> {
        let mut writer = self.settle().await?;
        let Some(batch) = self.buffer.take() else {
            self.slot = WriterSlot::Idle(writer);
            return Ok(false);
        };

        debug!("flushing {} particles ({reason:?})", batch.len());
        let retries = self.config.flush_retries;
        let backoff = self.config.retry_backoff;
        self.slot = WriterSlot::InFlight(tokio::spawn(async move {
            let outcome = flush_with_retries(&mut writer, batch, retries, backoff).await;
            (writer, outcome)
        }));
        Ok(true)
    }

    // Wait for the in-flight flush, if any, and take the chunk writer back.
    // Leaves the slot poisoned on error.
    async fn settle(&mut self) -> Result<ChunkWriter, StoreError> {
        match std::mem::replace(&mut self.slot, WriterSlot::Poisoned) {
            WriterSlot::Idle(writer) => Ok(writer),
            WriterSlot::Poisoned => WriterPoisonedSnafu.fail(),
            WriterSlot::InFlight(handle) => {
                let (writer, outcome) = handle.await.context(FlushWorkerSnafu)?;
                match outcome {
                    Ok(entry) => {
                        if let Some(entry) = &entry {
                            self.report.record_commit(entry);
                        }
                        self.last_committed = entry;
                        Ok(writer)
                    }
                    Err(FlushFailure { batch, error }) => {
                        self.held = Some(batch);
                        Err(error)
                    }
                }
            }
        }
    }
}

async fn attempt_flush(
    writer: &mut ChunkWriter,
    batch: &Arc<ParticleBatch>,
    staged: &mut Option<StagedChunk>,
) -> Result<Option<IndexEntry>, FlushError> {
    // A chunk that already reached disk is only re-committed, never rewritten.
    if staged.is_none() {
        *staged = writer.stage(Arc::clone(batch)).await?;
    }
    match staged.as_ref() {
        Some(staged) => writer.commit(staged).await.map(Some),
        None => Ok(None),
    }
}

async fn flush_with_retries(
    writer: &mut ChunkWriter,
    batch: ParticleBatch,
    retries: u32,
    backoff: Duration,
) -> Result<Option<IndexEntry>, FlushFailure> {
    let particles = batch.len();
    let batch = Arc::new(batch);
    let mut staged = None;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match attempt_flush(writer, &batch, &mut staged).await {
            Ok(entry) => return Ok(entry),
            Err(source) if attempts <= retries && source.is_retryable() => {
                warn!(
                    "flush of {particles} particles failed (attempt {attempts}): {source}; \
                     retrying in {backoff:?}"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(source) => {
                error!("giving up on flush of {particles} particles after {attempts} attempts");
                let batch = Arc::try_unwrap(batch).unwrap_or_else(|shared| (*shared).clone());
                let error = FlushFailedSnafu {
                    particles,
                    attempts,
                }
                .into_error(source);
                return Err(FlushFailure { batch, error });
            }
        }
    }
}

async fn latency_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Run a writer session over `source` until it ends or `shutdown` resolves.
///
/// Batches are buffered as they arrive; chunks are flushed by size, by
/// latency while the source is idle, and once more on the way out.
///
/// If the session fails, particles that were never committed are logged and
/// discarded along with the writer. Callers that must keep them should drive
/// a [`ParticleWriter`] directly and use [`ParticleWriter::into_unflushed`].
pub async fn ingest<S, F>(
    location: StoreLocation,
    config: StoreConfig,
    source: S,
    shutdown: F,
) -> Result<IngestReport, StoreError>
where
    S: Stream<Item = ParticleBatch>,
    F: Future<Output = ()>,
{
    let mut writer = ParticleWriter::open(location, config).await?;
    let mut source = std::pin::pin!(source);
    let mut shutdown = std::pin::pin!(shutdown);

    let result = async {
        loop {
            let deadline = writer.deadline();
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("shutdown requested; flushing {} buffered particles", writer.buffered());
                    break;
                }
                _ = latency_timer(deadline) => {
                    writer.flush_if_due().await?;
                }
                next = source.next() => match next {
                    Some(batch) => writer.append(&batch).await?,
                    None => {
                        debug!("source exhausted");
                        break;
                    }
                },
            }
        }
        writer.close().await
    }
    .await;

    if result.is_err()
        && let Some(lost) = writer.into_unflushed()
    {
        error!(
            "ingestion stopped; discarding {} particles that were not written",
            lost.len()
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chunk::ChunkId,
        config::ChunkCompression,
        index::INDEX_FILE_NAME,
        scan::ParticleReader,
        storage,
        test_util::{TestResult, batch_with_timestamps},
        verify::verify,
    };
    use tempfile::TempDir;

    fn config(max_particles: usize) -> StoreConfig {
        StoreConfig::default()
            .with_max_particles(max_particles)
            .with_max_latency(Duration::from_secs(3_600))
            .with_compression(ChunkCompression::Lz4)
            .with_retries(1, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn threshold_flush_commits_in_background() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let mut writer = ParticleWriter::open(location.clone(), config(2)).await?;

        writer.append(&batch_with_timestamps(&[1.0])).await?;
        assert_eq!(writer.buffered(), 1);
        writer.append(&batch_with_timestamps(&[2.0])).await?;
        assert_eq!(writer.buffered(), 0);

        let report = writer.close().await?;
        assert_eq!(report.chunks_written, 1);
        assert_eq!(report.particles_written, 2);
        assert_eq!(report.particles_received, 2);

        let reader = ParticleReader::open(location).await?;
        assert_eq!(reader.index().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn flush_returns_entry_and_empty_flush_is_a_noop() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let mut writer = ParticleWriter::open(location.clone(), config(100)).await?;

        assert!(writer.flush().await?.is_none());

        writer.append(&batch_with_timestamps(&[5.0, 4.0])).await?;
        let entry = writer.flush().await?.expect("two particles buffered");
        assert_eq!(entry.particle_count, 2);
        assert_eq!((entry.min_ts, entry.max_ts), (4.0, 5.0));

        assert!(writer.flush().await?.is_none());
        assert_eq!(ParticleReader::open(location).await?.index().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn append_parts_rejects_malformed_input() -> TestResult {
        let tmp = TempDir::new()?;
        let mut writer =
            ParticleWriter::open(StoreLocation::local(tmp.path()), config(100)).await?;

        let err = writer
            .append_parts(vec![1.0], vec![0; 3], vec![0; 3])
            .await
            .expect_err("short grids");
        assert!(matches!(err, StoreError::InvalidBatch { .. }), "{err:?}");
        assert_eq!(writer.buffered(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_flush_poisons_writer_and_keeps_particles() -> TestResult {
        let tmp = TempDir::new()?;
        let root = tmp.path().join("store");
        let mut writer = ParticleWriter::open(StoreLocation::local(&root), config(100)).await?;
        writer.append(&batch_with_timestamps(&[1.0, 2.0])).await?;

        // Replace the store directory with a plain file so every write fails.
        tokio::fs::remove_dir_all(&root).await?;
        tokio::fs::write(&root, b"not a directory").await?;

        let err = writer.flush().await.expect_err("store is gone");
        assert!(
            matches!(err, StoreError::FlushFailed { particles: 2, attempts: 2, .. }),
            "{err:?}"
        );

        let err = writer
            .append(&batch_with_timestamps(&[3.0]))
            .await
            .expect_err("writer is poisoned");
        assert!(matches!(err, StoreError::WriterPoisoned), "{err:?}");

        let unflushed = writer.into_unflushed().expect("batch was held");
        assert_eq!(unflushed.timestamps(), &[1.0, 2.0]);
        Ok(())
    }

    #[tokio::test]
    async fn ingest_flushes_by_latency_while_source_is_idle() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let config = config(1_000).with_max_latency(Duration::from_millis(50));

        let source = futures::stream::iter([
            batch_with_timestamps(&[1.0]),
            batch_with_timestamps(&[2.0]),
        ])
        .then(|batch| async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            batch
        });

        let report = ingest(location.clone(), config, source, std::future::pending()).await?;
        assert_eq!(report.chunks_written, 2);
        assert_eq!(report.particles_written, 2);

        let reader = ParticleReader::open(location).await?;
        assert_eq!(reader.read_range(0.0, 10.0).await?.timestamps(), &[1.0, 2.0]);
        Ok(())
    }

    #[tokio::test]
    async fn ingest_flushes_remaining_particles_on_shutdown() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());

        let source = futures::stream::iter([
            batch_with_timestamps(&[1.0, 1.0]),
            batch_with_timestamps(&[2.0]),
        ])
        .chain(futures::stream::pending());
        let shutdown = tokio::time::sleep(Duration::from_millis(100));

        let report = ingest(location.clone(), config(1_000), source, shutdown).await?;
        assert_eq!(report.batches, 2);
        assert_eq!(report.chunks_written, 1);
        assert_eq!(report.particles_written, 3);
        Ok(())
    }

    fn chunk_count(names: &[String]) -> usize {
        names
            .iter()
            .filter(|n| ChunkId::from_file_name(n).is_some())
            .count()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn retried_flush_commits_the_staged_chunk_once() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let config = config(100).with_retries(20, Duration::from_millis(50));
        let mut writer = ParticleWriter::open(location.clone(), config).await?;
        writer.append(&batch_with_timestamps(&[1.0, 2.0])).await?;

        // Index appends fail until `later` shows up.
        let later = tmp.path().join("later");
        std::os::unix::fs::symlink(later.join(INDEX_FILE_NAME), tmp.path().join(INDEX_FILE_NAME))?;

        let (flushed, created) = tokio::join!(writer.flush(), async {
            tokio::time::sleep(Duration::from_millis(120)).await;
            tokio::fs::create_dir(&later).await
        });
        created?;
        let entry = flushed?.expect("two particles buffered");
        assert_eq!(entry.particle_count, 2);

        assert_eq!(chunk_count(&storage::list_files(&location).await?), 1);
        let reader = ParticleReader::open(location.clone()).await?;
        assert_eq!(reader.index().entries(), &[entry]);

        let report = verify(&location).await?;
        assert!(report.is_consistent(), "{report:?}");
        assert!(report.orphans.is_empty(), "{report:?}");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_rollback_stops_retries() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let config = config(100).with_retries(5, Duration::from_millis(1));
        let mut writer = ParticleWriter::open(location, config).await?;
        writer.append(&batch_with_timestamps(&[1.0])).await?;
        writer.flush().await?;

        let index_path = tmp.path().join(INDEX_FILE_NAME);
        tokio::fs::rename(&index_path, tmp.path().join("moved.jsonl")).await?;
        std::os::unix::fs::symlink(tmp.path().join("gone").join(INDEX_FILE_NAME), &index_path)?;

        writer.append(&batch_with_timestamps(&[2.0, 3.0])).await?;
        let err = writer.flush().await.expect_err("index path dangles");
        assert!(
            matches!(err, StoreError::FlushFailed { particles: 2, attempts: 1, .. }),
            "{err:?}"
        );
        assert_eq!(
            writer.into_unflushed().map(|b| b.timestamps().to_vec()),
            Some(vec![2.0, 3.0])
        );
        Ok(())
    }

    #[tokio::test]
    async fn ingest_reports_failure_when_the_store_breaks() -> TestResult {
        let tmp = TempDir::new()?;
        let root = tmp.path().join("store");
        let broken = root.clone();

        let source = futures::stream::iter([batch_with_timestamps(&[1.0])]).then(move |batch| {
            let root = broken.clone();
            async move {
                // Swap the store directory for a plain file before the first flush.
                tokio::fs::remove_dir_all(&root).await.expect("remove store");
                tokio::fs::write(&root, b"not a directory").await.expect("replace store");
                batch
            }
        });

        let err = ingest(StoreLocation::local(&root), config(1), source, std::future::pending())
            .await
            .expect_err("store is gone");
        assert!(matches!(err, StoreError::FlushFailed { particles: 1, .. }), "{err:?}");
        Ok(())
    }
}
