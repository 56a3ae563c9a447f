use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use portl_core::types::{FailureKind, FileFormat};
use serde_json::{Map, Value as JsonValue};

use crate::error::ConnectorError;

/// A rendered `file.read`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadSpec {
    pub path: PathBuf,
    pub format: FileFormat,
    pub delimiter: u8,
    pub has_header: bool,
    pub limit: Option<usize>,
}

pub type RowStream = BoxStream<'static, Result<JsonValue, ConnectorError>>;

#[async_trait]
pub trait RowSource: Send + Sync {
    async fn read(&self, spec: &ReadSpec) -> Result<RowStream, ConnectorError>;
}

/// Reads CSV, JSON-lines and JSON-array files from the local filesystem.
///
/// CSV rows become objects keyed by header (or arrays when `has_header` is off);
/// every CSV field is a string.
#[derive(Debug, Clone, Default)]
pub struct FileRowSource {
    base_dir: Option<PathBuf>,
}

impl FileRowSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative paths against `dir` instead of the working directory.
    pub fn with_base_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(dir.into()),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[async_trait]
impl RowSource for FileRowSource {
    async fn read(&self, spec: &ReadSpec) -> Result<RowStream, ConnectorError> {
        let mut spec = spec.clone();
        spec.path = self.resolve(&spec.path);
        tracing::debug!(path = %spec.path.display(), format = ?spec.format, "reading rows");

        let rows = tokio::task::spawn_blocking(move || read_rows(&spec))
            .await
            .map_err(|e| ConnectorError::permanent(FailureKind::Other, format!("reader task failed: {e}")))??;
        Ok(stream::iter(rows).boxed())
    }
}

fn read_rows(spec: &ReadSpec) -> Result<Vec<Result<JsonValue, ConnectorError>>, ConnectorError> {
    let file = File::open(&spec.path).map_err(|e| io_error(&spec.path, e))?;
    let limit = spec.limit.unwrap_or(usize::MAX);

    let rows = match spec.format {
        FileFormat::Csv => {
            let mut reader = csv::ReaderBuilder::new()
                .delimiter(spec.delimiter)
                .has_headers(spec.has_header)
                .from_reader(file);
            let headers = if spec.has_header {
                Some(reader.headers().map_err(|e| data_error(&spec.path, e))?.clone())
            } else {
                None
            };
            let mut out = Vec::new();
            for record in reader.records().take(limit) {
                let row = match record {
                    Ok(record) => Ok(csv_row(headers.as_ref(), &record)),
                    Err(e) => Err(data_error(&spec.path, e)),
                };
                let stop = row.is_err();
                out.push(row);
                if stop {
                    break;
                }
            }
            out
        }
        FileFormat::Jsonl => BufReader::new(file)
            .lines()
            .filter(|line| !matches!(line, Ok(l) if l.trim().is_empty()))
            .take(limit)
            .map(|line| -> Result<JsonValue, ConnectorError> {
                let line = line.map_err(|e| io_error(&spec.path, e))?;
                serde_json::from_str(&line).map_err(|e| data_error(&spec.path, e))
            })
            .collect(),
        FileFormat::Json => {
            let mut text = String::new();
            BufReader::new(file)
                .read_to_string(&mut text)
                .map_err(|e| io_error(&spec.path, e))?;
            match serde_json::from_str::<JsonValue>(&text).map_err(|e| data_error(&spec.path, e))? {
                JsonValue::Array(items) => items.into_iter().take(limit).map(Ok).collect(),
                other => {
                    return Err(data_error(
                        &spec.path,
                        format!("expected a JSON array, got {}", portl_core::expressions::value::type_name(&other)),
                    ))
                }
            }
        }
    };
    Ok(rows)
}

fn csv_row(headers: Option<&csv::StringRecord>, record: &csv::StringRecord) -> JsonValue {
    match headers {
        Some(headers) => {
            let mut row = Map::new();
            for (i, field) in record.iter().enumerate() {
                let key = headers.get(i).map(str::to_string).unwrap_or_else(|| format!("col{i}"));
                row.insert(key, JsonValue::String(field.to_string()));
            }
            JsonValue::Object(row)
        }
        None => JsonValue::Array(record.iter().map(|f| JsonValue::String(f.to_string())).collect()),
    }
}

fn io_error(path: &Path, e: std::io::Error) -> ConnectorError {
    ConnectorError::permanent(FailureKind::Io, format!("{}: {e}", path.display()))
}

fn data_error(path: &Path, e: impl std::fmt::Display) -> ConnectorError {
    ConnectorError::permanent(FailureKind::Data, format!("{}: {e}", path.display()))
}
