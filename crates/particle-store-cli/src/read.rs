use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use arrow::{csv, json, record_batch::RecordBatch};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use futures::TryStreamExt;
use particle_store_core::{ParticleReader, StoreLocation, model::timestamp_to_utc};
use snafu::{OptionExt, ResultExt};

use crate::error::{
    CliResult, CreateOutputSnafu, FlushOutputSnafu, InvalidTimeSnafu, OpenStoreSnafu, ReadRangeSnafu,
    WriteOutputSnafu,
};

#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    Csv,
    Jsonl,
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse a command-line time as epoch seconds.
///
/// Accepts plain epoch seconds, RFC 3339 timestamps with an offset, and
/// naive ISO 8601 dates or datetimes, which are taken to be UTC.
pub fn parse_time(input: &str) -> CliResult<f64> {
    let s = input.trim();

    if let Ok(secs) = s.parse::<f64>() {
        return timestamp_to_utc(secs)
            .map(|_| secs)
            .context(InvalidTimeSnafu { input });
    }

    let utc = if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        Some(dt.to_utc())
    } else if let Some(naive) = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
    {
        Some(naive.and_utc())
    } else {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
    };

    let utc = utc.context(InvalidTimeSnafu { input })?;
    Ok(utc.timestamp() as f64 + f64::from(utc.timestamp_subsec_nanos()) / 1e9)
}

fn display_time(ts: f64) -> String {
    match timestamp_to_utc(ts) {
        Some(dt) => dt.to_string(),
        None => ts.to_string(),
    }
}

enum OutputWriter {
    Csv(Box<csv::Writer<BufWriter<File>>>),
    Jsonl(Box<json::LineDelimitedWriter<BufWriter<File>>>),
}

impl OutputWriter {
    fn create(path: &Path, format: OutputFormat) -> CliResult<Self> {
        let file = File::create(path).context(CreateOutputSnafu { path })?;
        let sink = BufWriter::new(file);
        Ok(match format {
            OutputFormat::Csv => OutputWriter::Csv(Box::new(csv::WriterBuilder::new().build(sink))),
            OutputFormat::Jsonl => {
                OutputWriter::Jsonl(Box::new(json::LineDelimitedWriter::new(sink)))
            }
        })
    }

    fn write_batch(&mut self, batch: &RecordBatch) -> CliResult<()> {
        match self {
            OutputWriter::Csv(w) => w.write(batch).context(WriteOutputSnafu),
            OutputWriter::Jsonl(w) => w.write_batches(&[batch]).context(WriteOutputSnafu),
        }
    }

    fn finish(self, path: &Path) -> CliResult<()> {
        let mut sink = match self {
            OutputWriter::Csv(w) => w.into_inner(),
            OutputWriter::Jsonl(mut w) => {
                w.finish().context(WriteOutputSnafu)?;
                w.into_inner()
            }
        };
        sink.flush().context(FlushOutputSnafu { path })
    }
}

pub struct ReadArgs {
    pub start: String,
    pub stop: String,
    pub output: Option<PathBuf>,
    pub format: OutputFormat,
}

pub async fn cmd_read(dir: &Path, args: ReadArgs) -> CliResult<()> {
    let start = parse_time(&args.start)?;
    let stop = parse_time(&args.stop)?;
    println!(
        "Reading data between {} and {}",
        display_time(start),
        display_time(stop)
    );
    let t0 = Instant::now();

    let reader = ParticleReader::open(StoreLocation::local(dir))
        .await
        .context(OpenStoreSnafu {
            dir: dir.display().to_string(),
        })?;
    let mut scan = reader
        .scan_range(start, stop)
        .context(ReadRangeSnafu { start, stop })?;

    let mut out = match &args.output {
        Some(path) => Some(OutputWriter::create(path, args.format)?),
        None => None,
    };

    let mut found = 0usize;
    while let Some(batch) = scan
        .try_next()
        .await
        .context(ReadRangeSnafu { start, stop })?
    {
        found += batch.len();
        if let Some(out) = out.as_mut() {
            let record = batch.to_record_batch().context(WriteOutputSnafu)?;
            out.write_batch(&record)?;
        }
    }
    if let (Some(out), Some(path)) = (out, &args.output) {
        out.finish(path)?;
    }

    if found == 0 {
        println!("Found nothing in that timestamp");
        return Ok(());
    }

    let elapsed = t0.elapsed().as_secs_f64().max(f64::EPSILON);
    println!("Found {found} particles.");
    println!(
        "Read bandwidth {:.2} kParticles/s.",
        found as f64 / 1024.0 / elapsed
    );
    if let Some(path) = &args.output {
        println!("Wrote {found} particles to {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_seconds_pass_through() {
        assert_eq!(parse_time("1735689600.25").ok(), Some(1_735_689_600.25));
        assert_eq!(parse_time(" 0 ").ok(), Some(0.0));
    }

    #[test]
    fn naive_iso_times_are_utc() {
        assert_eq!(parse_time("2025-01-01T00:00:00").ok(), Some(1_735_689_600.0));
        assert_eq!(parse_time("2025-01-01 00:00:01.5").ok(), Some(1_735_689_601.5));
        assert_eq!(parse_time("2025-01-01").ok(), Some(1_735_689_600.0));
        assert_eq!(parse_time("2025-01-01T00:01").ok(), Some(1_735_689_660.0));
    }

    #[test]
    fn offsets_are_honored() {
        assert_eq!(
            parse_time("2025-01-01T01:00:00+01:00").ok(),
            Some(1_735_689_600.0)
        );
        assert_eq!(parse_time("2025-01-01T00:00:00Z").ok(), Some(1_735_689_600.0));
    }

    #[test]
    fn garbage_and_non_finite_times_are_rejected() {
        for input in ["yesterday", "NaN", "inf", "2025-13-01", ""] {
            assert!(parse_time(input).is_err(), "{input}");
        }
    }
}
