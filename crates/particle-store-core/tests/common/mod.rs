#![allow(dead_code)]

use particle_store_core::model::{ParticleBatch, SCATTERING_LEN, SPECTRAL_LEN};

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Batch with grids derived from each row's timestamp and position, so rows
/// can be told apart after a read even when timestamps repeat.
pub fn batch(timestamps: &[f64]) -> ParticleBatch {
    batch_salted(timestamps, 0)
}

/// Like [`batch`], with an extra salt mixed into every grid value.
pub fn batch_salted(timestamps: &[f64], salt: i32) -> ParticleBatch {
    let mut scattering = Vec::with_capacity(timestamps.len() * SCATTERING_LEN);
    let mut spectral = Vec::with_capacity(timestamps.len() * SPECTRAL_LEN);
    for (row, ts) in timestamps.iter().enumerate() {
        let base = ((ts * 1_000.0) as i32).wrapping_add(salt.wrapping_mul(7_919)) ^ (row as i32);
        scattering.extend((0..SCATTERING_LEN as i32).map(|j| base.wrapping_add(j)));
        spectral.extend((0..SPECTRAL_LEN as i32).map(|j| base.wrapping_mul(3).wrapping_sub(j)));
    }
    ParticleBatch::new(timestamps.to_vec(), scattering, spectral).expect("valid test batch")
}

/// Row fingerprints `(timestamp, first scattering value, last spectral value)`.
pub fn rows(batch: &ParticleBatch) -> Vec<(f64, i32, i32)> {
    (0..batch.len())
        .map(|i| {
            (
                batch.timestamps()[i],
                batch.scattering_of(i)[0],
                batch.spectral_of(i)[SPECTRAL_LEN - 1],
            )
        })
        .collect()
}
