//! Tabular ingestion: type inference and mirror-table loading.
//!
//! The file is streamed twice: once with bounded lookahead to infer column
//! types, once to load rows. Gzipped payloads are decoded on the fly.
//! Failures surface as `CsvError` and end up in `parsing_error`; they
//! never abort the pipeline.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use thiserror::Error;
use tracing::debug;

use crate::repository::{ColumnType, MirrorRepository, RepositoryError};
use crate::utils::parsing_table_name;

#[derive(Error, Debug)]
pub enum CsvError {
    #[error("Not a tabular file: {0}")]
    NotTabular(String),
    #[error("CSV parse error: {0}")]
    Parse(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

fn open_reader(path: &Path, gzipped: bool) -> std::io::Result<Box<dyn Read>> {
    let file = File::open(path)?;
    if gzipped {
        Ok(Box::new(GzDecoder::new(BufReader::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Cheap guard before full ingestion: the first `sniff_bytes` must decode
/// as UTF-8 and parse as a delimited header row.
pub fn sniff_tabular(path: &Path, gzipped: bool, sniff_bytes: usize) -> Result<(), CsvError> {
    let mut reader = open_reader(path, gzipped)?;
    let mut prefix = vec![0u8; sniff_bytes];
    let mut read = 0;
    while read < sniff_bytes {
        let n = reader.read(&mut prefix[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    prefix.truncate(read);

    if prefix.is_empty() {
        return Err(CsvError::NotTabular("empty file".to_string()));
    }
    // tolerate a record cut mid-character at the end of the prefix
    let valid_up_to = match std::str::from_utf8(&prefix) {
        Ok(_) => prefix.len(),
        Err(e) if e.valid_up_to() > 0 && prefix.len() - e.valid_up_to() < 4 => e.valid_up_to(),
        Err(_) => return Err(CsvError::NotTabular("binary content".to_string())),
    };

    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(&prefix[..valid_up_to]);
    let headers = csv_reader
        .headers()
        .map_err(|e| CsvError::NotTabular(e.to_string()))?;
    if headers.is_empty() {
        return Err(CsvError::NotTabular("no header row".to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct TypeGuess {
    can_int: bool,
    can_float: bool,
    can_bool: bool,
    seen_value: bool,
}

impl Default for TypeGuess {
    fn default() -> Self {
        Self {
            can_int: true,
            can_float: true,
            can_bool: true,
            seen_value: false,
        }
    }
}

impl TypeGuess {
    fn observe(&mut self, raw: &str) {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return;
        }
        self.seen_value = true;
        if self.can_int && trimmed.parse::<i64>().is_err() {
            self.can_int = false;
        }
        if self.can_float && trimmed.parse::<f64>().is_err() {
            self.can_float = false;
        }
        if self.can_bool && crate::repository::parse_bool(trimmed).is_none() {
            self.can_bool = false;
        }
    }

    fn resolve(&self) -> ColumnType {
        if !self.seen_value {
            ColumnType::Text
        } else if self.can_int {
            ColumnType::Integer
        } else if self.can_float {
            ColumnType::Float
        } else if self.can_bool {
            ColumnType::Boolean
        } else {
            ColumnType::Text
        }
    }
}

/// Column names from the header row: trimmed, deduplicated, never empty.
fn normalize_headers(headers: &csv::StringRecord) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    headers
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            let base = raw.trim();
            let base = if base.is_empty() {
                format!("column_{}", i + 1)
            } else {
                base.to_string()
            };
            let count = seen.entry(base.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                format!("{}_{}", base, count)
            } else {
                base
            }
        })
        .collect()
}

/// Infer the mirror-table schema from up to `lookahead` rows.
pub fn infer_columns(
    path: &Path,
    gzipped: bool,
    lookahead: usize,
) -> Result<Vec<(String, ColumnType)>, CsvError> {
    let mut reader = csv::Reader::from_reader(open_reader(path, gzipped)?);
    let names = normalize_headers(reader.headers()?);
    let mut guesses = vec![TypeGuess::default(); names.len()];

    for (row_index, record) in reader.records().enumerate() {
        if row_index >= lookahead {
            break;
        }
        let record = record?;
        for (guess, cell) in guesses.iter_mut().zip(record.iter()) {
            guess.observe(cell);
        }
    }

    Ok(names
        .into_iter()
        .zip(guesses.iter().map(TypeGuess::resolve))
        .collect())
}

/// Parse a downloaded tabular file into its mirror table.
///
/// Returns the mirror table name and the row count. Indexes requested by a
/// resource exception are applied after the load.
pub fn parse_into_mirror(
    mirror: &MirrorRepository,
    table_indexes: Option<&HashMap<String, String>>,
    url: &str,
    path: &Path,
    gzipped: bool,
    lookahead: usize,
    sniff_bytes: usize,
) -> Result<(String, usize), CsvError> {
    sniff_tabular(path, gzipped, sniff_bytes)?;

    let columns = infer_columns(path, gzipped, lookahead)?;
    let table = parsing_table_name(url);
    mirror.create_table(&table, &columns)?;

    let mut reader = csv::Reader::from_reader(open_reader(path, gzipped)?);
    let expected = columns.len();
    let mut batch: Vec<Vec<Option<String>>> = Vec::with_capacity(1000);
    let mut inserted = 0;
    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                // a malformed record mid-file fails the whole parse
                mirror.drop_table(&table)?;
                return Err(CsvError::Parse(e));
            }
        };
        let mut cells: Vec<Option<String>> = record
            .iter()
            .map(|cell| {
                if cell.is_empty() {
                    None
                } else {
                    Some(cell.to_string())
                }
            })
            .collect();
        cells.resize(expected, None);
        batch.push(cells);
        if batch.len() == 1000 {
            inserted += mirror.insert_rows(&table, &columns, batch.drain(..))?;
        }
    }
    if !batch.is_empty() {
        inserted += mirror.insert_rows(&table, &columns, batch)?;
    }
    if let Some(indexes) = table_indexes {
        mirror.apply_indexes(&table, &columns, indexes)?;
    }

    debug!("Mirrored {} rows of {} into {}", inserted, url, table);
    Ok((table, inserted))
}
