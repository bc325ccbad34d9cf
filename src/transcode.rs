//! Decoding of downloaded resources into Arrow, text coercion and Parquet encoding.
//!
//! Every source format ends up as a single [`RecordBatch`] whose columns are all
//! nullable `Utf8`. Downstream loaders expect uniform string typing, so the
//! coercion is lossy on purpose.

use std::io::Cursor;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, StringArray};
use arrow::compute::{concat_batches, max_string};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::error::ArrowError;
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow::util::display::{ArrayFormatter, FormatOptions};
use bytes::Bytes;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::{Datelike, NaiveDate, NaiveTime};
use log::debug;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use thiserror::Error;

use crate::error::TaskFailure;
use crate::types::FileFormat;

pub const CSV_DELIMITER: u8 = b';';
pub const OUTPUT_EXTENSION: &str = "parquet";

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("{format}: {message}")]
    Decode { format: FileFormat, message: String },

    #[error("{0}")]
    Encode(String),
}

impl From<TranscodeError> for TaskFailure {
    fn from(err: TranscodeError) -> Self {
        match err {
            TranscodeError::Decode { .. } => TaskFailure::Read(err.to_string()),
            TranscodeError::Encode(message) => TaskFailure::Encode(message),
        }
    }
}

/// Output of [`transcode`]: Parquet bytes plus what the pipeline needs for dedup.
#[derive(Debug, Clone)]
pub struct Transcoded {
    pub parquet: Bytes,
    pub rows: usize,
    pub columns: Vec<String>,
    pub date_column: Option<String>,
    pub max_date: Option<String>,
}

pub fn transcode(raw: Bytes, format: FileFormat) -> Result<Transcoded, TranscodeError> {
    let decoded = decode(raw, format)?;
    let text = coerce_to_text(&decoded).map_err(|e| TranscodeError::Encode(e.to_string()))?;
    let parquet = encode_parquet(&text)?;

    let date_column = find_date_column(&text.schema());
    let max_date = date_column
        .as_deref()
        .and_then(|column| max_text_value(&text, column));

    debug!(
        "Transcoded {} rows x {} columns from {} into {} parquet bytes",
        text.num_rows(),
        text.num_columns(),
        format,
        parquet.len()
    );

    Ok(Transcoded {
        parquet,
        rows: text.num_rows(),
        columns: column_names(&text),
        date_column,
        max_date,
    })
}

pub fn decode(raw: Bytes, format: FileFormat) -> Result<RecordBatch, TranscodeError> {
    let result = match format {
        FileFormat::Parquet => decode_parquet(raw),
        FileFormat::Csv => decode_csv(&raw),
        FileFormat::Xlsx => decode_xlsx(raw),
    };
    result.map_err(|message| TranscodeError::Decode { format, message })
}

fn decode_parquet(raw: Bytes) -> Result<RecordBatch, String> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(raw).map_err(|e| e.to_string())?;
    let schema = builder.schema().clone();
    let reader = builder.build().map_err(|e| e.to_string())?;
    let batches = reader
        .collect::<Result<Vec<_>, ArrowError>>()
        .map_err(|e| e.to_string())?;
    concat_batches(&schema, &batches).map_err(|e| e.to_string())
}

/// Semicolon separated, ISO-8859-1 encoded, header on the first line.
///
/// Every byte maps to the code point of the same value, so 0x80..=0x9F become C1
/// controls rather than the windows-1252 punctuation a WHATWG "latin1" label gives.
fn decode_csv(raw: &[u8]) -> Result<RecordBatch, String> {
    let text = encoding_rs::mem::decode_latin1(raw);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(CSV_DELIMITER)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| e.to_string())?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut columns: Vec<Vec<Option<String>>> = vec![Vec::new(); headers.len()];
    for record in reader.records() {
        let record = record.map_err(|e| e.to_string())?;
        for (idx, column) in columns.iter_mut().enumerate() {
            column.push(record.get(idx).filter(|v| !v.is_empty()).map(str::to_string));
        }
    }

    text_batch(&headers, columns).map_err(|e| e.to_string())
}

/// First worksheet, first row as header.
fn decode_xlsx(raw: Bytes) -> Result<RecordBatch, String> {
    let mut workbook =
        open_workbook_auto_from_rs(Cursor::new(raw.to_vec())).map_err(|e| e.to_string())?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| "workbook has no sheets".to_string())?
        .map_err(|e| e.to_string())?;

    let mut rows = range.rows();
    let headers: Vec<String> = rows
        .next()
        .map(|row| {
            row.iter()
                .map(|cell| cell_text(cell).unwrap_or_default().trim().to_string())
                .collect()
        })
        .unwrap_or_default();

    let mut columns: Vec<Vec<Option<String>>> = vec![Vec::new(); headers.len()];
    for row in rows {
        for (idx, column) in columns.iter_mut().enumerate() {
            column.push(row.get(idx).and_then(cell_text));
        }
    }

    text_batch(&headers, columns).map_err(|e| e.to_string())
}

/// Text of a worksheet cell. Date cells are stored as serial numbers and are
/// rendered as ISO dates, with a time part only when it is not midnight.
fn cell_text(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty => None,
        Data::DateTime(d) if d.is_datetime() => Some(match d.as_datetime() {
            Some(dt) if dt.time() == NaiveTime::MIN => dt.format("%Y-%m-%d").to_string(),
            Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => cell.to_string(),
        }),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Some(s.clone()),
        _ => Some(cell.to_string()),
    }
}

fn text_batch(
    headers: &[String],
    columns: Vec<Vec<Option<String>>>,
) -> Result<RecordBatch, ArrowError> {
    let fields: Vec<Field> = headers
        .iter()
        .map(|name| Field::new(name, DataType::Utf8, true))
        .collect();
    let arrays: Vec<ArrayRef> = columns
        .into_iter()
        .map(|values| Arc::new(StringArray::from(values)) as ArrayRef)
        .collect();
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
}

/// Renders every column as nullable `Utf8` using Arrow's display formatting.
pub fn coerce_to_text(batch: &RecordBatch) -> Result<RecordBatch, ArrowError> {
    let options = FormatOptions::default();
    let schema = batch.schema();
    let mut fields = Vec::with_capacity(batch.num_columns());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(batch.num_columns());

    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        fields.push(Field::new(field.name(), DataType::Utf8, true));
        if column.data_type() == &DataType::Utf8 {
            arrays.push(Arc::clone(column));
            continue;
        }
        let formatter = ArrayFormatter::try_new(column.as_ref(), &options)?;
        let values: StringArray = (0..column.len())
            .map(|i| column.is_valid(i).then(|| formatter.value(i).to_string()))
            .collect();
        arrays.push(Arc::new(values));
    }

    RecordBatch::try_new_with_options(
        Arc::new(Schema::new(fields)),
        arrays,
        &RecordBatchOptions::new().with_row_count(Some(batch.num_rows())),
    )
}

pub fn encode_parquet(batch: &RecordBatch) -> Result<Bytes, TranscodeError> {
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), Some(props))
        .map_err(|e| TranscodeError::Encode(format!("parquet writer init failed: {e}")))?;
    writer
        .write(batch)
        .map_err(|e| TranscodeError::Encode(format!("parquet write failed: {e}")))?;
    writer
        .close()
        .map_err(|e| TranscodeError::Encode(format!("parquet close failed: {e}")))?;

    Ok(Bytes::from(buf))
}

/// First column whose name contains "dat", case-insensitively.
pub fn find_date_column(schema: &Schema) -> Option<String> {
    schema
        .fields()
        .iter()
        .map(|f| f.name())
        .find(|name| name.to_lowercase().contains("dat"))
        .cloned()
}

pub fn max_text_value(batch: &RecordBatch, column: &str) -> Option<String> {
    let array = batch.column_by_name(column)?;
    let strings = array.as_any().downcast_ref::<StringArray>()?;
    max_string(strings).map(str::to_string)
}

pub fn column_names(batch: &RecordBatch) -> Vec<String> {
    batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().to_string())
        .collect()
}

/// Last URL path segment without its extension.
pub fn file_stem(url: &str) -> String {
    let segment = reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .unwrap_or_else(|| url.rsplit('/').next().unwrap_or_default().to_string());

    let stem = match segment.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => segment,
    };
    if stem.is_empty() {
        "data".to_string()
    } else {
        stem
    }
}

/// Past years land under `{package}/{year}/`. The current (or a future) year is
/// partitioned by ingestion date so later same-year ingestions never collide.
pub fn destination_path(package: &str, year: i32, url: &str, today: NaiveDate) -> String {
    let stem = file_stem(url);
    let current_year = today.year();
    if year < current_year {
        format!("{package}/{year}/{stem}.{OUTPUT_EXTENSION}")
    } else {
        format!(
            "{package}/{current_year}/{:02}/{:02}/{stem}.{OUTPUT_EXTENSION}",
            today.month(),
            today.day()
        )
    }
}
