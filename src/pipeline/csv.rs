use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use csv_async::{AsyncReaderBuilder, ErrorKind, StringRecord};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::io::StreamReader;

use super::{FormatOptions, Row};
use crate::error::{Error, Result};
use crate::storage::ByteStream;

/// Minimum delay between two progress reports of the validator.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationProgress {
    pub read_rows: u64,
    pub read_bytes: u64,
    pub total_bytes: u64,
}

fn reader_builder(options: &FormatOptions) -> Result<AsyncReaderBuilder> {
    let mut builder = AsyncReaderBuilder::new();
    builder
        .delimiter(options.delimiter_byte()?)
        .quote(options.quote_byte()?)
        .has_headers(true)
        .flexible(false);
    Ok(builder)
}

fn csv_error(err: csv_async::Error) -> Error {
    if matches!(err.kind(), ErrorKind::Io(_)) {
        Error::Io(std::io::Error::other(err.to_string()))
    } else {
        Error::Processing(err.to_string())
    }
}

fn check_headers(headers: &StringRecord) -> Result<()> {
    if headers.is_empty() {
        return Err(Error::Processing("Missing header row".into()));
    }
    let mut seen = HashSet::new();
    for (position, name) in headers.iter().enumerate() {
        if name.trim().is_empty() {
            return Err(Error::Processing(format!(
                "Empty column name at position {}",
                position + 1
            )));
        }
        if !seen.insert(name) {
            return Err(Error::Processing(format!("Duplicate column name {name}")));
        }
    }
    Ok(())
}

/// Streams the whole input through the CSV reader, reporting progress at most
/// every [`PROGRESS_INTERVAL`]. Returns the final counts on success.
pub async fn validate<F>(
    stream: ByteStream,
    total_bytes: u64,
    options: &FormatOptions,
    mut on_progress: F,
) -> Result<ValidationProgress>
where
    F: FnMut(ValidationProgress),
{
    let read_bytes = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&read_bytes);
    let counted = stream.inspect_ok(move |chunk| {
        counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
    });

    let mut reader = reader_builder(options)?.create_reader(StreamReader::new(counted));
    check_headers(reader.headers().await.map_err(csv_error)?)?;

    let progress = |read_rows| ValidationProgress {
        read_rows,
        read_bytes: read_bytes.load(Ordering::Relaxed),
        total_bytes,
    };

    let mut read_rows = 0u64;
    let mut last_report = Instant::now();
    let mut records = reader.records();
    while let Some(record) = records.next().await {
        record.map_err(csv_error)?;
        read_rows += 1;
        if last_report.elapsed() >= PROGRESS_INTERVAL {
            on_progress(progress(read_rows));
            last_report = Instant::now();
        }
    }

    Ok(progress(read_rows))
}

pub struct ParsedCsv {
    pub headers: Vec<String>,
    pub rows: BoxStream<'static, Result<Row>>,
}

/// Decodes the input into rows keyed by header name.
pub async fn parse(stream: ByteStream, options: &FormatOptions) -> Result<ParsedCsv> {
    let mut reader = reader_builder(options)?.create_reader(StreamReader::new(stream));
    let headers: Arc<Vec<String>> = Arc::new(
        reader
            .headers()
            .await
            .map_err(csv_error)?
            .iter()
            .map(str::to_string)
            .collect(),
    );

    let names = Arc::clone(&headers);
    let rows = reader
        .into_records()
        .map(move |record| -> Result<Row> {
            let record = record.map_err(csv_error)?;
            Ok(names
                .iter()
                .zip(record.iter())
                .map(|(name, value)| (name.clone(), Value::String(value.to_string())))
                .collect())
        })
        .boxed();

    Ok(ParsedCsv {
        headers: headers.to_vec(),
        rows,
    })
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn write_record<I, T>(delimiter: u8, fields: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut writer = ::csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(Vec::new());
    writer
        .write_record(fields)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    writer.into_inner().map_err(|e| Error::Io(e.into_error()))
}

/// Encodes rows as delimited text under a header of `columns`, written even
/// when there are no rows. Missing cells are left empty.
pub fn encode(
    rows: BoxStream<'static, Result<Row>>,
    delimiter: u8,
    columns: Vec<String>,
) -> ByteStream {
    let header = write_record(delimiter, &columns).map(Bytes::from);
    let records = rows.map(move |row| -> Result<Bytes> {
        let row = row?;
        let values: Vec<String> = columns
            .iter()
            .map(|c| row.get(c).map(cell).unwrap_or_default())
            .collect();
        Ok(Bytes::from(write_record(delimiter, &values)?))
    });

    stream::once(async move { header })
        .chain(records)
        .map_err(std::io::Error::from)
        .boxed()
}
