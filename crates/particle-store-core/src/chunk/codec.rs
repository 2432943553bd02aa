//! Parquet layout of a chunk.
//!
//! One row per particle. The timestamp lives in a `ts` Float64 column; each
//! element of the flattened grids gets its own Int32 column (`scat_0` ..
//! `scat_1023`, `spec_0` .. `spec_511`) so every grid position compresses
//! independently.

use std::sync::{Arc, LazyLock};

use arrow::{
    array::{Array, ArrayRef, AsArray, Float64Array, Int32Array},
    compute::concat_batches,
    datatypes::{DataType, Field, Float64Type, Int32Type, Schema, SchemaRef},
    error::ArrowError,
    record_batch::RecordBatch,
};
use bytes::Bytes;
use parquet::{
    arrow::{ArrowWriter, arrow_reader::ParquetRecordBatchReaderBuilder},
    basic::Encoding,
    file::properties::WriterProperties,
    schema::types::ColumnPath,
};
use snafu::prelude::*;

use super::{
    ChunkError, DecodeArrowSnafu, DecodeSnafu, EncodeArrowSnafu, EncodeSnafu,
    InvalidContentsSnafu, SchemaMismatchSnafu,
};
use crate::{
    config::ChunkCompression,
    model::{ParticleBatch, SCATTERING_LEN, SPECTRAL_LEN},
};

/// Name of the timestamp column.
pub const TS_COLUMN: &str = "ts";

const TS_INDEX: usize = 0;
const SCATTERING_OFFSET: usize = 1;
const SPECTRAL_OFFSET: usize = SCATTERING_OFFSET + SCATTERING_LEN;
const COLUMN_COUNT: usize = SPECTRAL_OFFSET + SPECTRAL_LEN;

static CHUNK_SCHEMA: LazyLock<SchemaRef> = LazyLock::new(|| {
    let mut fields = Vec::with_capacity(COLUMN_COUNT);
    fields.push(Field::new(TS_COLUMN, DataType::Float64, false));
    fields.extend(
        (0..SCATTERING_LEN).map(|j| Field::new(format!("scat_{j}"), DataType::Int32, false)),
    );
    fields.extend(
        (0..SPECTRAL_LEN).map(|j| Field::new(format!("spec_{j}"), DataType::Int32, false)),
    );
    Arc::new(Schema::new(fields))
});

/// Arrow schema shared by every chunk file.
pub fn chunk_schema() -> SchemaRef {
    Arc::clone(&CHUNK_SCHEMA)
}

fn writer_properties(compression: ChunkCompression) -> WriterProperties {
    let ts = ColumnPath::from(TS_COLUMN);
    // Grid values are close to random; dictionaries only pay off for `ts`,
    // where a packet shares one timestamp across many rows.
    WriterProperties::builder()
        .set_compression(compression.to_parquet())
        .set_dictionary_enabled(false)
        .set_column_dictionary_enabled(ts.clone(), true)
        .set_column_encoding(ts, Encoding::BYTE_STREAM_SPLIT)
        .build()
}

impl ParticleBatch {
    /// Lay the batch out as a record batch with the chunk schema.
    pub fn to_record_batch(&self) -> Result<RecordBatch, ArrowError> {
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(COLUMN_COUNT);
        columns.push(Arc::new(Float64Array::from(self.timestamps().to_vec())));

        for j in 0..SCATTERING_LEN {
            let values = self.scattering().iter().skip(j).step_by(SCATTERING_LEN).copied();
            columns.push(Arc::new(Int32Array::from_iter_values(values)));
        }
        for j in 0..SPECTRAL_LEN {
            let values = self.spectral().iter().skip(j).step_by(SPECTRAL_LEN).copied();
            columns.push(Arc::new(Int32Array::from_iter_values(values)));
        }

        RecordBatch::try_new(chunk_schema(), columns)
    }

    /// Rebuild particles from a record batch with the chunk schema.
    ///
    /// `path` only labels errors.
    pub fn from_record_batch(batch: &RecordBatch, path: &str) -> Result<Self, ChunkError> {
        check_schema(batch.schema().as_ref(), path)?;

        let rows = batch.num_rows();
        let ts = batch
            .column(TS_INDEX)
            .as_primitive_opt::<Float64Type>()
            .filter(|col| col.null_count() == 0)
            .with_context(|| SchemaMismatchSnafu {
                path,
                detail: "ts column is not a non-null Float64 array",
            })?;
        let timestamps = ts.values().to_vec();

        let scattering = transpose_grid(batch, SCATTERING_OFFSET, SCATTERING_LEN, rows, path)?;
        let spectral = transpose_grid(batch, SPECTRAL_OFFSET, SPECTRAL_LEN, rows, path)?;

        ParticleBatch::new(timestamps, scattering, spectral).context(InvalidContentsSnafu { path })
    }
}

// Column-per-element back to row-major grids.
fn transpose_grid(
    batch: &RecordBatch,
    offset: usize,
    width: usize,
    rows: usize,
    path: &str,
) -> Result<Vec<i32>, ChunkError> {
    let mut out = vec![0i32; rows * width];
    for j in 0..width {
        let column = batch
            .column(offset + j)
            .as_primitive_opt::<Int32Type>()
            .filter(|col| col.null_count() == 0)
            .with_context(|| SchemaMismatchSnafu {
                path,
                detail: format!("column {} is not a non-null Int32 array", offset + j),
            })?;
        for (i, v) in column.values().iter().enumerate() {
            out[i * width + j] = *v;
        }
    }
    Ok(out)
}

fn check_schema(schema: &Schema, path: &str) -> Result<(), ChunkError> {
    let expected = chunk_schema();
    ensure!(
        schema.fields().len() == expected.fields().len(),
        SchemaMismatchSnafu {
            path,
            detail: format!(
                "expected {} columns, found {}",
                expected.fields().len(),
                schema.fields().len()
            ),
        }
    );
    for (want, got) in expected.fields().iter().zip(schema.fields().iter()) {
        ensure!(
            want.name() == got.name() && want.data_type() == got.data_type(),
            SchemaMismatchSnafu {
                path,
                detail: format!(
                    "expected column {} ({}), found {} ({})",
                    want.name(),
                    want.data_type(),
                    got.name(),
                    got.data_type()
                ),
            }
        );
    }
    Ok(())
}

/// Serialize a batch into the bytes of a chunk file.
pub fn encode_chunk(
    batch: &ParticleBatch,
    compression: ChunkCompression,
) -> Result<Vec<u8>, ChunkError> {
    let record_batch = batch.to_record_batch().context(EncodeArrowSnafu)?;

    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(
        &mut buf,
        record_batch.schema(),
        Some(writer_properties(compression)),
    )
    .context(EncodeSnafu)?;
    writer.write(&record_batch).context(EncodeSnafu)?;
    writer.close().context(EncodeSnafu)?;

    Ok(buf)
}

/// Decode a whole chunk file into a single record batch.
///
/// The schema is checked before any row is materialized.
pub fn decode_chunk(bytes: Bytes, path: &str) -> Result<RecordBatch, ChunkError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes).context(DecodeSnafu { path })?;
    check_schema(builder.schema().as_ref(), path)?;

    let schema = Arc::clone(builder.schema());
    let rows = builder.metadata().file_metadata().num_rows();
    let batch_size = usize::try_from(rows).unwrap_or(0).max(1);

    let reader = builder
        .with_batch_size(batch_size)
        .build()
        .context(DecodeSnafu { path })?;

    let batches = reader
        .collect::<Result<Vec<_>, ArrowError>>()
        .context(DecodeArrowSnafu { path })?;

    concat_batches(&schema, &batches).context(DecodeArrowSnafu { path })
}
