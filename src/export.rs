//! Payload export: nested JSON (one object per bank) and flat CSV (one row
//! per bank × field). Both forms carry the same field-level data and read
//! back to equal records.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{ExtractionPayload, FieldFlags, FieldRecord, FieldValue};
use crate::pipeline::validation::derive_missing;

/// Column order of the flat export.
pub const CSV_COLUMNS: [&str; 8] = [
    "bank",
    "field",
    "value",
    "confidence",
    "evidence",
    "missing",
    "low_confidence",
    "invalid_format",
];

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ═══════════════════════════════════════════
// Nested JSON
// ═══════════════════════════════════════════

/// Pretty-printed `{bank: payload}` document.
pub fn to_json(payloads: &BTreeMap<String, ExtractionPayload>) -> Result<String, ExportError> {
    Ok(serde_json::to_string_pretty(payloads)?)
}

pub fn from_json(json: &str) -> Result<BTreeMap<String, ExtractionPayload>, ExportError> {
    Ok(serde_json::from_str(json)?)
}

// ═══════════════════════════════════════════
// Flat CSV
// ═══════════════════════════════════════════

#[derive(Debug, Serialize, Deserialize)]
struct FlatRow {
    bank: String,
    field: String,
    value: String,
    confidence: f64,
    evidence: String,
    missing: bool,
    low_confidence: bool,
    invalid_format: bool,
}

impl FlatRow {
    fn new(bank: &str, field: &str, record: &FieldRecord) -> Self {
        Self {
            bank: bank.to_string(),
            field: field.to_string(),
            value: encode_value(&record.value),
            confidence: record.confidence,
            evidence: record
                .evidence
                .as_deref()
                .map(encode_text)
                .unwrap_or_default(),
            missing: record.flags.missing,
            low_confidence: record.flags.low_confidence,
            invalid_format: record.flags.invalid_format,
        }
    }

    fn into_record(self) -> FieldRecord {
        FieldRecord {
            value: decode_value(&self.value),
            confidence: self.confidence,
            evidence: decode_text(&self.evidence),
            flags: FieldFlags {
                missing: self.missing,
                low_confidence: self.low_confidence,
                invalid_format: self.invalid_format,
            },
        }
    }
}

/// Write every payload's records, in registry order, as flat rows.
pub fn write_csv<'a, W, I>(writer: W, payloads: I) -> Result<(), ExportError>
where
    W: Write,
    I: IntoIterator<Item = &'a ExtractionPayload>,
{
    // Header written by hand so an empty export still has one.
    let mut csv_writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    csv_writer.write_record(CSV_COLUMNS)?;

    for payload in payloads {
        for (field, record) in payload.records() {
            csv_writer.serialize(FlatRow::new(&payload.bank, field, record))?;
        }
    }

    csv_writer.flush()?;
    Ok(())
}

/// Rebuild payloads from a flat export.
///
/// Row order becomes `required_fields` order. The flat form has no column
/// for the threshold, so the caller supplies it.
pub fn read_csv<R: Read>(
    reader: R,
    confidence_threshold: f64,
) -> Result<BTreeMap<String, ExtractionPayload>, ExportError> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut grouped: BTreeMap<String, (Vec<String>, BTreeMap<String, FieldRecord>)> =
        BTreeMap::new();

    for row in csv_reader.deserialize::<FlatRow>() {
        let row = row?;
        let (required, fields) = grouped.entry(row.bank.clone()).or_default();
        if !fields.contains_key(&row.field) {
            required.push(row.field.clone());
        }
        fields.insert(row.field.clone(), row.into_record());
    }

    Ok(grouped
        .into_iter()
        .map(|(bank, (required, fields))| {
            let missing = derive_missing(&required, &fields);
            let payload =
                ExtractionPayload::new(&bank, required, confidence_threshold, fields, missing);
            (bank, payload)
        })
        .collect())
}

// ═══════════════════════════════════════════
// Cell encoding
// ═══════════════════════════════════════════
//
// Null is an empty cell. Numbers and booleans are JSON literals. Text is
// written verbatim unless it is empty or would read back as a JSON scalar,
// in which case it is written as a JSON string.

fn encode_value(value: &FieldValue) -> String {
    match value {
        FieldValue::Null => String::new(),
        FieldValue::Bool(b) => b.to_string(),
        FieldValue::Number(n) => n.to_string(),
        FieldValue::Text(s) => encode_text(s),
    }
}

fn encode_text(text: &str) -> String {
    if text.is_empty() || parse_scalar(text).is_some() {
        Value::String(text.to_string()).to_string()
    } else {
        text.to_string()
    }
}

fn decode_value(cell: &str) -> FieldValue {
    if cell.is_empty() {
        return FieldValue::Null;
    }
    match parse_scalar(cell) {
        Some(Value::Null) => FieldValue::Null,
        Some(Value::Bool(b)) => FieldValue::Bool(b),
        Some(Value::Number(n)) => FieldValue::Number(n),
        Some(Value::String(s)) => FieldValue::Text(s),
        _ => FieldValue::Text(cell.to_string()),
    }
}

fn decode_text(cell: &str) -> Option<String> {
    if cell.is_empty() {
        return None;
    }
    match parse_scalar(cell) {
        Some(Value::String(s)) => Some(s),
        _ => Some(cell.to_string()),
    }
}

fn parse_scalar(cell: &str) -> Option<Value> {
    serde_json::from_str::<Value>(cell)
        .ok()
        .filter(|v| !v.is_array() && !v.is_object())
}
