use std::path::Path;

use particle_store_core::{ParticleReader, StoreLocation, model::timestamp_to_utc, verify};
use snafu::ResultExt;

use crate::error::{CliResult, InconsistentSnafu, OpenStoreSnafu, VerifySnafu};

fn fmt_ts(ts: f64) -> String {
    timestamp_to_utc(ts)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

pub async fn cmd_inspect(dir: &Path) -> CliResult<()> {
    let reader = ParticleReader::open(StoreLocation::local(dir))
        .await
        .context(OpenStoreSnafu {
            dir: dir.display().to_string(),
        })?;
    let index = reader.index();

    if index.is_empty() {
        println!("No chunks in {}", dir.display());
        return Ok(());
    }

    println!(
        "{:>6}  {:<44}  {:>9}  {:>12}  {:<35}  {:<35}",
        "seq", "file", "particles", "bytes", "min_ts", "max_ts"
    );
    for entry in index.entries() {
        println!(
            "{:>6}  {:<44}  {:>9}  {:>12}  {:<35}  {:<35}",
            entry.seq,
            entry.file_path,
            entry.particle_count,
            entry.file_size,
            fmt_ts(entry.min_ts),
            fmt_ts(entry.max_ts)
        );
    }

    let bytes: u64 = index.entries().iter().map(|e| e.file_size).sum();
    println!(
        "Chunks: {}  Particles: {}  Bytes: {}",
        index.len(),
        index.total_particles(),
        bytes
    );
    if let Some((lo, hi)) = index.time_range() {
        println!("Time range: {} .. {}", fmt_ts(lo), fmt_ts(hi));
    }
    Ok(())
}

pub async fn cmd_verify(dir: &Path) -> CliResult<()> {
    let dir_str = dir.display().to_string();
    let report = verify(&StoreLocation::local(dir))
        .await
        .context(VerifySnafu { dir: &dir_str })?;

    for problem in &report.problems {
        println!("PROBLEM  {problem}");
    }
    for orphan in &report.orphans {
        println!("orphan   {orphan} (not indexed; left in place)");
    }
    for tmp in &report.temp_files {
        println!("temp     {tmp} (removed by the next writer)");
    }
    println!(
        "Checked {} chunks, {} particles: {} problem(s), {} orphan(s), {} temp file(s)",
        report.chunks_checked,
        report.particles_checked,
        report.problems.len(),
        report.orphans.len(),
        report.temp_files.len()
    );

    if !report.is_consistent() {
        return InconsistentSnafu {
            dir: dir_str,
            problems: report.problems.len(),
        }
        .fail();
    }
    println!("OK");
    Ok(())
}
