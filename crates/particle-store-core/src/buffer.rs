//! In-memory ingestion buffer.
//!
//! The buffer accumulates validated batches into growable per-field arrays
//! and decides when they should become a chunk. It is owned exclusively by
//! the writer session; nothing in it is visible to readers.

use tokio::time::Instant;

use crate::{config::FlushPolicy, model::ParticleBatch};

// Cap on rows reserved up front; a huge threshold should not allocate eagerly.
const PREALLOC_PARTICLES: usize = 1_024;

/// Why the buffer is being flushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushReason {
    /// The particle threshold was reached.
    ParticleThreshold,
    /// The oldest buffered particle exceeded the latency budget.
    Latency,
    /// The caller asked for a flush.
    Requested,
    /// The session is shutting down.
    Shutdown,
}

/// Accumulates particles until a flush is due.
#[derive(Debug)]
pub struct IngestBuffer {
    policy: FlushPolicy,
    pending: ParticleBatch,
    first_arrival: Option<Instant>,
}

impl IngestBuffer {
    /// Create an empty buffer governed by `policy`.
    pub fn new(policy: FlushPolicy) -> Self {
        Self {
            pending: ParticleBatch::with_capacity(policy.max_particles.min(PREALLOC_PARTICLES)),
            policy,
            first_arrival: None,
        }
    }

    /// Add a batch. Empty batches are ignored and do not start the latency
    /// clock.
    pub fn append(&mut self, batch: &ParticleBatch) {
        if batch.is_empty() {
            return;
        }
        if self.first_arrival.is_none() {
            self.first_arrival = Some(Instant::now());
        }
        self.pending.append(batch);
    }

    /// Number of buffered particles.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// When the latency limit will force a flush, if anything is buffered.
    pub fn deadline(&self) -> Option<Instant> {
        self.first_arrival
            .and_then(|t| t.checked_add(self.policy.max_latency))
    }

    /// The flush trigger that applies at `now`, if any.
    ///
    /// The particle threshold wins over latency when both apply.
    pub fn flush_reason(&self, now: Instant) -> Option<FlushReason> {
        if self.pending.len() >= self.policy.max_particles {
            return Some(FlushReason::ParticleThreshold);
        }
        match self.deadline() {
            Some(deadline) if now >= deadline => Some(FlushReason::Latency),
            _ => None,
        }
    }

    /// Whether a size or latency flush is due now.
    pub fn should_flush(&self) -> bool {
        self.flush_reason(Instant::now()).is_some()
    }

    /// Hand over everything buffered and reset, or `None` when empty.
    pub fn take(&mut self) -> Option<ParticleBatch> {
        if self.pending.is_empty() {
            return None;
        }
        self.first_arrival = None;
        let next = ParticleBatch::with_capacity(self.policy.max_particles.min(PREALLOC_PARTICLES));
        Some(std::mem::replace(&mut self.pending, next))
    }
}
