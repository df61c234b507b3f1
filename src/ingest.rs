//!
//! CSV ingestion
//! -------------
//! Turns an uploaded grid of raw text cells into a clean rectangular
//! dataset, infers column identities and types from it, and bulk-inserts
//! the result as Column and Row records. The columns insert and the rows
//! insert are two separate store writes; they are not atomic as a pair and
//! a crash between them can leave columns without rows (known limitation,
//! kept as-is).

use serde_json::{Map, Value};
use tracing::debug;

use crate::datasource::search_text_for;
use crate::error::{AppError, AppResult};
use crate::schema::{FieldDescriptor, FieldKind, RawValues, RecordSchema, STRING_MAX_LENGTH};
use crate::slug::column_identity;
use crate::storage::{Datatype, SharedStore};

/// Read uploaded CSV text into a raw grid of string cells. Ragged record
/// lengths are allowed; normalization handles them.
pub fn parse_csv(text: &str) -> AppResult<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| AppError::user("invalid_csv", e.to_string()))?;
        rows.push(record.iter().map(|cell| cell.to_string()).collect());
    }
    Ok(rows)
}

fn pad_or_truncate(mut row: Vec<String>, length: usize) -> Vec<String> {
    if row.len() > length {
        row.truncate(length);
    } else {
        while row.len() < length {
            row.push(String::new());
        }
    }
    row
}

/// Clean a raw grid into a rectangular dataset, header row first.
///
/// In order: trim every cell, drop all-blank rows, normalize row lengths to
/// the most common length (first-encountered wins a tie; short rows pad,
/// long rows truncate), drop all-blank columns, and skip leading rows until
/// the first fully-populated row, which becomes the header. Idempotent on
/// already-normalized input.
pub fn normalize_table(rows: Vec<Vec<String>>) -> Vec<Vec<String>> {
    // Trim cells, then strip out any rows that only have blank values.
    let mut rows: Vec<Vec<String>> = rows
        .into_iter()
        .map(|row| row.into_iter().map(|cell| cell.trim().to_string()).collect::<Vec<_>>())
        .filter(|row: &Vec<String>| row.iter().any(|cell| !cell.is_empty()))
        .collect();
    if rows.is_empty() {
        return rows;
    }

    // Normalize so that all rows have the same length. The canonical length
    // is the most common one; on a tie the first-encountered length wins.
    let mut length_counts: Vec<(usize, usize)> = Vec::new();
    for row in &rows {
        match length_counts.iter_mut().find(|(len, _)| *len == row.len()) {
            Some((_, count)) => *count += 1,
            None => length_counts.push((row.len(), 1)),
        }
    }
    let mut canonical = 0;
    let mut best = 0;
    for (len, count) in &length_counts {
        // Strict comparison so the first-encountered length wins a tie
        if *count > best {
            best = *count;
            canonical = *len;
        }
    }
    rows = rows.into_iter().map(|row| pad_or_truncate(row, canonical)).collect();

    // Strip out any columns that only have blank values.
    let mut blank_columns: Vec<bool> = vec![true; canonical];
    for row in &rows {
        for (idx, cell) in row.iter().enumerate() {
            if !cell.is_empty() {
                blank_columns[idx] = false;
            }
        }
    }
    if blank_columns.iter().any(|b| *b) {
        rows = rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .enumerate()
                    .filter(|(idx, _)| !blank_columns[*idx])
                    .map(|(_, cell)| cell)
                    .collect()
            })
            .collect();
    }

    // Skip leading title/caption rows: the header is the first row where
    // every cell is non-empty. If no row qualifies the grid stays as-is.
    if let Some(header_idx) = rows.iter().position(|row| row.iter().all(|cell| !cell.is_empty())) {
        rows.drain(..header_idx);
    }
    rows
}

/// Derive column identities from the header row.
pub fn determine_column_identities(rows: &[Vec<String>]) -> Vec<String> {
    match rows.first() {
        Some(header) => header.iter().map(|name| column_identity(name)).collect(),
        None => Vec::new(),
    }
}

/// Infer a datatype per column and build the matching validation schema.
///
/// A column is integer when every data-row value parses as an integer
/// (blank cells allowed); otherwise it is string. One pass, best effort —
/// no mixed/decimal/date inference.
pub fn determine_column_types(rows: &[Vec<String>]) -> (Vec<Datatype>, RecordSchema) {
    let Some(header) = rows.first() else {
        return (Vec::new(), RecordSchema::default());
    };
    let identities = determine_column_identities(rows);
    let mut types = Vec::with_capacity(header.len());
    for idx in 0..header.len() {
        let all_integers = rows[1..].iter().all(|row| {
            let cell = row.get(idx).map(|s| s.trim()).unwrap_or("");
            cell.is_empty() || cell.parse::<i64>().is_ok()
        });
        types.push(if all_integers { Datatype::Integer } else { Datatype::String });
    }
    let fields = header
        .iter()
        .zip(identities.iter())
        .zip(types.iter())
        .map(|((name, identity), datatype)| FieldDescriptor {
            identity: identity.clone(),
            title: name.clone(),
            kind: match datatype {
                // Uploaded cells may be blank; both kinds allow it.
                Datatype::String => FieldKind::Str { max_length: STRING_MAX_LENGTH, required: false },
                Datatype::Integer => FieldKind::Int { minimum: None, maximum: None, required: false },
            },
        })
        .collect();
    (types, RecordSchema::new(fields))
}

/// Counts reported back from a completed ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub columns: usize,
    pub rows: usize,
}

/// Full upload path: normalize the grid, infer columns, validate every data
/// row, then bulk-insert columns followed by rows.
pub fn ingest_rows(store: &SharedStore, table_pk: i64, raw_rows: Vec<Vec<String>>) -> AppResult<IngestSummary> {
    let rows = normalize_table(raw_rows);
    if rows.is_empty() {
        return Err(AppError::user("empty_csv", "the uploaded file contained no header row"));
    }
    let identities = determine_column_identities(&rows);
    let (types, schema) = determine_column_types(&rows);

    let mut batch: Vec<(Map<String, Value>, String)> = Vec::with_capacity(rows.len() - 1);
    for (line, row) in rows[1..].iter().enumerate() {
        let mut raw = RawValues::new();
        for (identity, cell) in identities.iter().zip(row.iter()) {
            raw.insert(identity.clone(), cell.clone());
        }
        let record = schema.validate(&raw).map_err(|errors| {
            let detail = errors
                .iter()
                .map(|(field, message)| format!("{}: {}", field, message))
                .collect::<Vec<_>>()
                .join("; ");
            AppError::user("invalid_csv", format!("row {}: {}", line + 2, detail))
        })?;
        let search_text = search_text_for(&schema, &record);
        batch.push((record, search_text));
    }

    let column_entries: Vec<(String, String, Datatype)> = rows[0]
        .iter()
        .zip(identities.iter())
        .zip(types.iter())
        .map(|((name, identity), datatype)| (name.clone(), identity.clone(), *datatype))
        .collect();

    // Two store writes: columns first, then rows. Not atomic as a pair.
    let mut guard = store.0.lock();
    guard.insert_columns(table_pk, &column_entries).map_err(AppError::from)?;
    let inserted = guard.insert_rows(table_pk, batch).map_err(AppError::from)?;
    debug!(target: "gridbase::ingest",
        "ingest_rows: table={} columns={} rows={}", table_pk, column_entries.len(), inserted.len());
    Ok(IngestSummary { columns: column_entries.len(), rows: inserted.len() })
}
