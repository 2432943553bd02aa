use crate::model::{ParticleBatch, SCATTERING_LEN, SPECTRAL_LEN};

pub(crate) type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Deterministic grid contents derived from the timestamp and a per-row salt,
/// so rows with equal timestamps still carry distinguishable payloads.
pub(crate) fn batch_with_timestamps(timestamps: &[f64]) -> ParticleBatch {
    let mut scattering = Vec::with_capacity(timestamps.len() * SCATTERING_LEN);
    let mut spectral = Vec::with_capacity(timestamps.len() * SPECTRAL_LEN);

    for (row, ts) in timestamps.iter().enumerate() {
        let base = (ts * 1_000.0) as i32 ^ ((row as i32) << 20);
        scattering.extend((0..SCATTERING_LEN as i32).map(|j| base.wrapping_mul(31).wrapping_add(j)));
        spectral.extend((0..SPECTRAL_LEN as i32).map(|j| base.wrapping_sub(j * 7)));
    }

    ParticleBatch::new(timestamps.to_vec(), scattering, spectral).expect("valid test batch")
}
