//! Record model: particles and validated particle batches.
//!
//! A [`Particle`] is one measurement row: an epoch-seconds timestamp plus two
//! fixed-shape `i32` grids (scattering 64×16, spectral 32×16). The write path
//! never handles particles one by one; producers hand over [`ParticleBatch`]
//! values, which store the three fields as parallel, row-major arrays:
//!
//! ```text
//! timestamps: [t0, t1, ...]                      (N values)
//! scattering: [p0[0][0] .. p0[63][15], p1 ...]   (N * 1024 values)
//! spectral:   [p0[0][0] .. p0[31][15], p1 ...]   (N * 512 values)
//! ```
//!
//! Batches are validated once at construction, so everything downstream of
//! the buffer can rely on consistent shapes and representable timestamps.

use chrono::{DateTime, Utc};
use snafu::prelude::*;

/// Rows of the scattering grid.
pub const SCATTERING_ROWS: usize = 64;
/// Columns of the scattering grid.
pub const SCATTERING_COLS: usize = 16;
/// Number of `i32` values in one scattering grid.
pub const SCATTERING_LEN: usize = SCATTERING_ROWS * SCATTERING_COLS;

/// Rows of the spectral grid.
pub const SPECTRAL_ROWS: usize = 32;
/// Columns of the spectral grid.
pub const SPECTRAL_COLS: usize = 16;
/// Number of `i32` values in one spectral grid.
pub const SPECTRAL_LEN: usize = SPECTRAL_ROWS * SPECTRAL_COLS;

/// Fixed-shape scattering measurement of one particle.
pub type ScatteringGrid = [[i32; SCATTERING_COLS]; SCATTERING_ROWS];
/// Fixed-shape spectral measurement of one particle.
pub type SpectralGrid = [[i32; SPECTRAL_COLS]; SPECTRAL_ROWS];

/// Input errors: malformed batches rejected before they reach the buffer.
#[derive(Debug, Snafu)]
pub enum BatchError {
    /// A field does not have the length implied by the number of timestamps.
    #[snafu(display("Field {field} has {found} values, expected {expected}"))]
    LengthMismatch {
        /// Name of the offending field.
        field: &'static str,
        /// Length implied by the timestamp count and the fixed grid shape.
        expected: usize,
        /// Length actually supplied.
        found: usize,
    },

    /// A timestamp is NaN, infinite, or outside the representable UTC range.
    #[snafu(display("Invalid timestamp {value} at row {index}"))]
    InvalidTimestamp {
        /// Row of the offending timestamp.
        index: usize,
        /// The rejected value.
        value: f64,
    },
}

/// Convert epoch seconds into a UTC datetime with nanosecond precision.
///
/// Returns `None` for non-finite values and values chrono cannot represent.
pub fn timestamp_to_utc(ts: f64) -> Option<DateTime<Utc>> {
    if !ts.is_finite() {
        return None;
    }
    let secs = ts.floor();
    let nanos = ((ts - secs) * 1e9).round().min(999_999_999.0) as u32;
    // `as` saturates; out-of-range seconds are rejected by chrono below.
    DateTime::from_timestamp(secs as i64, nanos)
}

fn check_timestamps(timestamps: &[f64]) -> Result<(), BatchError> {
    match timestamps
        .iter()
        .position(|ts| timestamp_to_utc(*ts).is_none())
    {
        Some(index) => InvalidTimestampSnafu {
            index,
            value: timestamps[index],
        }
        .fail(),
        None => Ok(()),
    }
}

/// One measurement record.
#[derive(Clone, Debug, PartialEq)]
pub struct Particle {
    timestamp: f64,
    scattering: Box<ScatteringGrid>,
    spectral: Box<SpectralGrid>,
}

impl Particle {
    /// Build a particle from its grids.
    pub fn new(
        timestamp: f64,
        scattering: Box<ScatteringGrid>,
        spectral: Box<SpectralGrid>,
    ) -> Result<Self, BatchError> {
        check_timestamps(&[timestamp])?;
        Ok(Self {
            timestamp,
            scattering,
            spectral,
        })
    }

    /// Build a particle from flattened, row-major grid values.
    pub fn from_flat(
        timestamp: f64,
        scattering: &[i32],
        spectral: &[i32],
    ) -> Result<Self, BatchError> {
        ensure!(
            scattering.len() == SCATTERING_LEN,
            LengthMismatchSnafu {
                field: "scattering",
                expected: SCATTERING_LEN,
                found: scattering.len(),
            }
        );
        ensure!(
            spectral.len() == SPECTRAL_LEN,
            LengthMismatchSnafu {
                field: "spectral",
                expected: SPECTRAL_LEN,
                found: spectral.len(),
            }
        );

        let mut scat = Box::new([[0i32; SCATTERING_COLS]; SCATTERING_ROWS]);
        for (row, values) in scat.iter_mut().zip(scattering.chunks_exact(SCATTERING_COLS)) {
            row.copy_from_slice(values);
        }
        let mut spec = Box::new([[0i32; SPECTRAL_COLS]; SPECTRAL_ROWS]);
        for (row, values) in spec.iter_mut().zip(spectral.chunks_exact(SPECTRAL_COLS)) {
            row.copy_from_slice(values);
        }

        Self::new(timestamp, scat, spec)
    }

    /// Epoch seconds.
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// The 64×16 scattering grid.
    pub fn scattering(&self) -> &ScatteringGrid {
        &self.scattering
    }

    /// The 32×16 spectral grid.
    pub fn spectral(&self) -> &SpectralGrid {
        &self.spectral
    }
}

/// A batch of particles stored as parallel arrays.
///
/// Invariant: `scattering.len() == len() * SCATTERING_LEN`,
/// `spectral.len() == len() * SPECTRAL_LEN`, and every timestamp converts
/// via [`timestamp_to_utc`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParticleBatch {
    timestamps: Vec<f64>,
    scattering: Vec<i32>,
    spectral: Vec<i32>,
}

impl ParticleBatch {
    /// Validate and wrap parallel arrays.
    pub fn new(
        timestamps: Vec<f64>,
        scattering: Vec<i32>,
        spectral: Vec<i32>,
    ) -> Result<Self, BatchError> {
        let n = timestamps.len();
        ensure!(
            scattering.len() == n * SCATTERING_LEN,
            LengthMismatchSnafu {
                field: "scattering",
                expected: n * SCATTERING_LEN,
                found: scattering.len(),
            }
        );
        ensure!(
            spectral.len() == n * SPECTRAL_LEN,
            LengthMismatchSnafu {
                field: "spectral",
                expected: n * SPECTRAL_LEN,
                found: spectral.len(),
            }
        );
        check_timestamps(&timestamps)?;

        Ok(Self {
            timestamps,
            scattering,
            spectral,
        })
    }

    /// A batch with no particles.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Pre-allocate room for `particles` rows.
    pub(crate) fn with_capacity(particles: usize) -> Self {
        Self {
            timestamps: Vec::with_capacity(particles),
            scattering: Vec::with_capacity(particles * SCATTERING_LEN),
            spectral: Vec::with_capacity(particles * SPECTRAL_LEN),
        }
    }

    /// Collect particles into a batch.
    pub fn from_particles<'a>(particles: impl IntoIterator<Item = &'a Particle>) -> Self {
        let mut batch = Self::empty();
        for p in particles {
            batch.timestamps.push(p.timestamp);
            batch
                .scattering
                .extend_from_slice(p.scattering.as_flattened());
            batch.spectral.extend_from_slice(p.spectral.as_flattened());
        }
        batch
    }

    /// Concatenate batches in order.
    pub fn concat(batches: impl IntoIterator<Item = ParticleBatch>) -> Self {
        let mut out = Self::empty();
        for batch in batches {
            out.append(&batch);
        }
        out
    }

    /// Append all rows of `other` to this batch.
    pub(crate) fn append(&mut self, other: &ParticleBatch) {
        self.timestamps.extend_from_slice(&other.timestamps);
        self.scattering.extend_from_slice(&other.scattering);
        self.spectral.extend_from_slice(&other.spectral);
    }

    /// Number of particles.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether the batch holds no particles.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// All timestamps, in row order.
    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }

    /// All scattering values, row-major, `len() * SCATTERING_LEN` long.
    pub fn scattering(&self) -> &[i32] {
        &self.scattering
    }

    /// All spectral values, row-major, `len() * SPECTRAL_LEN` long.
    pub fn spectral(&self) -> &[i32] {
        &self.spectral
    }

    /// Flattened scattering grid of row `i`.
    pub fn scattering_of(&self, i: usize) -> &[i32] {
        &self.scattering[i * SCATTERING_LEN..(i + 1) * SCATTERING_LEN]
    }

    /// Flattened spectral grid of row `i`.
    pub fn spectral_of(&self, i: usize) -> &[i32] {
        &self.spectral[i * SPECTRAL_LEN..(i + 1) * SPECTRAL_LEN]
    }

    /// Materialize row `i` as a standalone particle.
    pub fn particle(&self, i: usize) -> Option<Particle> {
        let ts = *self.timestamps.get(i)?;
        Particle::from_flat(ts, self.scattering_of(i), self.spectral_of(i)).ok()
    }

    /// Iterate over rows as standalone particles.
    pub fn iter(&self) -> impl Iterator<Item = Particle> + '_ {
        (0..self.len()).filter_map(|i| self.particle(i))
    }

    /// True minimum and maximum timestamp, or `None` for an empty batch.
    pub fn time_range(&self) -> Option<(f64, f64)> {
        self.timestamps.iter().fold(None, |acc, &ts| match acc {
            None => Some((ts, ts)),
            Some((lo, hi)) => Some((lo.min(ts), hi.max(ts))),
        })
    }

    /// Whether timestamps are in non-decreasing order.
    pub fn is_time_sorted(&self) -> bool {
        self.timestamps.windows(2).all(|w| w[0] <= w[1])
    }

    /// Reorder rows by timestamp. Rows with equal timestamps keep their
    /// relative order.
    pub fn sort_by_time(self) -> Self {
        if self.is_time_sorted() {
            return self;
        }
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|a, b| self.timestamps[*a].total_cmp(&self.timestamps[*b]));

        let mut out = Self::with_capacity(self.len());
        for i in order {
            out.timestamps.push(self.timestamps[i]);
            out.scattering.extend_from_slice(self.scattering_of(i));
            out.spectral.extend_from_slice(self.spectral_of(i));
        }
        out
    }

    /// Split into the three parallel arrays.
    pub fn into_parts(self) -> (Vec<f64>, Vec<i32>, Vec<i32>) {
        (self.timestamps, self.scattering, self.spectral)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_of(timestamps: &[f64]) -> ParticleBatch {
        let n = timestamps.len();
        let scattering = (0..n * SCATTERING_LEN).map(|v| v as i32).collect();
        let spectral = (0..n * SPECTRAL_LEN).map(|v| -(v as i32)).collect();
        ParticleBatch::new(timestamps.to_vec(), scattering, spectral).expect("valid batch")
    }

    #[test]
    fn new_rejects_short_scattering() {
        let err = ParticleBatch::new(vec![1.0], vec![0; SCATTERING_LEN - 1], vec![0; SPECTRAL_LEN])
            .expect_err("short scattering must be rejected");
        assert!(matches!(
            err,
            BatchError::LengthMismatch {
                field: "scattering",
                expected: SCATTERING_LEN,
                ..
            }
        ));
    }

    #[test]
    fn new_rejects_long_spectral() {
        let err = ParticleBatch::new(
            vec![1.0, 2.0],
            vec![0; 2 * SCATTERING_LEN],
            vec![0; 3 * SPECTRAL_LEN],
        )
        .expect_err("long spectral must be rejected");
        assert!(matches!(err, BatchError::LengthMismatch { field: "spectral", .. }));
    }

    #[test]
    fn new_rejects_non_finite_timestamps() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 1e300] {
            let err = ParticleBatch::new(
                vec![1.0, bad],
                vec![0; 2 * SCATTERING_LEN],
                vec![0; 2 * SPECTRAL_LEN],
            )
            .expect_err("invalid timestamp must be rejected");
            assert!(matches!(err, BatchError::InvalidTimestamp { index: 1, .. }));
        }
    }

    #[test]
    fn empty_batch_is_valid() {
        let batch = ParticleBatch::new(vec![], vec![], vec![]).expect("empty is valid");
        assert!(batch.is_empty());
        assert_eq!(batch.time_range(), None);
    }

    #[test]
    fn particle_reshapes_flat_rows() {
        let batch = batch_of(&[5.0, 6.0]);
        let p = batch.particle(1).expect("row 1 exists");

        assert_eq!(p.timestamp(), 6.0);
        assert_eq!(p.scattering()[0][0], SCATTERING_LEN as i32);
        assert_eq!(p.scattering()[63][15], (2 * SCATTERING_LEN - 1) as i32);
        assert_eq!(p.spectral()[1][0], -((SPECTRAL_LEN + SPECTRAL_COLS) as i32));
        assert!(batch.particle(2).is_none());
    }

    #[test]
    fn from_particles_roundtrips_rows() {
        let batch = batch_of(&[3.0, 1.0, 2.0]);
        let particles: Vec<Particle> = batch.iter().collect();

        let rebuilt = ParticleBatch::from_particles(&particles);
        assert_eq!(rebuilt, batch);
    }

    #[test]
    fn time_range_uses_true_extremes_not_arrival_order() {
        let batch = batch_of(&[12.0, 10.5, 15.25, 11.0]);
        assert_eq!(batch.time_range(), Some((10.5, 15.25)));
        assert!(!batch.is_time_sorted());
    }

    #[test]
    fn concat_preserves_order() {
        let joined = ParticleBatch::concat([batch_of(&[1.0]), batch_of(&[2.0, 3.0])]);
        assert_eq!(joined.timestamps(), &[1.0, 2.0, 3.0]);
        assert_eq!(joined.scattering().len(), 3 * SCATTERING_LEN);
        assert_eq!(joined.scattering_of(1)[0], 0);
    }

    #[test]
    fn sort_by_time_is_stable_and_moves_grids_with_rows() {
        let batch = batch_of(&[3.0, 1.0, 3.0, 2.0]);
        let row0 = batch.scattering_of(0).to_vec();
        let row2 = batch.scattering_of(2).to_vec();
        let row1_spec = batch.spectral_of(1).to_vec();

        let sorted = batch.sort_by_time();
        assert_eq!(sorted.timestamps(), &[1.0, 2.0, 3.0, 3.0]);
        assert_eq!(sorted.spectral_of(0), row1_spec.as_slice());
        assert_eq!(sorted.scattering_of(2), row0.as_slice());
        assert_eq!(sorted.scattering_of(3), row2.as_slice());
    }

    #[test]
    fn timestamp_to_utc_keeps_subsecond_precision() {
        let dt = timestamp_to_utc(1_700_000_000.25).expect("in range");
        assert_eq!(dt.timestamp(), 1_700_000_000);
        assert_eq!(dt.timestamp_subsec_millis(), 250);
    }
}
