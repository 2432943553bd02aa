use std::path::PathBuf;

use arrow::error::ArrowError;
use particle_store_core::{StoreError, model::BatchError};
use snafu::Snafu;

pub type CliResult<T> = std::result::Result<T, CliError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display(
        "Invalid time '{input}': expected epoch seconds or an ISO 8601 timestamp"
    ))]
    InvalidTime { input: String },

    #[snafu(display("Failed to open store at {dir}"))]
    OpenStore {
        dir: String,
        #[snafu(source(from(StoreError, Box::new)))]
        source: Box<StoreError>,
    },

    #[snafu(display("Read of [{start}, {stop}] failed"))]
    ReadRange {
        start: f64,
        stop: f64,
        #[snafu(source(from(StoreError, Box::new)))]
        source: Box<StoreError>,
    },

    #[snafu(display("Writing to store at {dir} failed"))]
    Ingest {
        dir: String,
        #[snafu(source(from(StoreError, Box::new)))]
        source: Box<StoreError>,
    },

    #[snafu(display("Synthetic packet {packet} was rejected"))]
    InvalidPacket { packet: u64, source: BatchError },

    #[snafu(display("Verification of {dir} could not run"))]
    Verify {
        dir: String,
        #[snafu(source(from(StoreError, Box::new)))]
        source: Box<StoreError>,
    },

    #[snafu(display("Store at {dir} is inconsistent: {problems} problem(s) found"))]
    Inconsistent { dir: String, problems: usize },

    #[snafu(display("Failed to create output file: {}", path.display()))]
    CreateOutput {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to flush output file: {}", path.display()))]
    FlushOutput {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to write output: {source}"))]
    WriteOutput { source: ArrowError },
}
