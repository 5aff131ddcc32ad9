use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::field::{FieldRecord, FieldValue};
use crate::pipeline::validation::{derive_missing, field_flags, to_raw_map, validate};

/// Marker attached to a payload when the registry has no fields for the bank.
pub const NO_REQUIRED_FIELDS_ERROR: &str =
    "No required fields found for this bank. Check bank_registry.csv.";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Field '{0}' is not required for this bank")]
    UnknownField(String),
}

/// Consolidated extraction output for one bank.
///
/// `fields` always covers exactly `required_fields`. `missing_fields` is
/// derived from the field flags and is re-derived on every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionPayload {
    pub bank: String,
    pub fields: BTreeMap<String, FieldRecord>,
    pub missing_fields: Vec<String>,
    pub required_fields: Vec<String>,
    pub confidence_threshold: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExtractionPayload {
    /// Build a payload from validated records.
    pub fn new(
        bank: &str,
        required_fields: Vec<String>,
        confidence_threshold: f64,
        fields: BTreeMap<String, FieldRecord>,
        missing_fields: Vec<String>,
    ) -> Self {
        Self {
            bank: bank.to_string(),
            fields,
            missing_fields,
            required_fields,
            confidence_threshold,
            error: None,
        }
    }

    /// Payload for a bank whose registry entry yields no required fields.
    pub fn without_required_fields(bank: &str, confidence_threshold: f64) -> Self {
        Self {
            bank: bank.to_string(),
            fields: BTreeMap::new(),
            missing_fields: Vec::new(),
            required_fields: Vec::new(),
            confidence_threshold,
            error: Some(NO_REQUIRED_FIELDS_ERROR.to_string()),
        }
    }

    /// Record a reviewer-entered value and refresh the gap list.
    ///
    /// The value is still format-checked: a malformed manual entry stays
    /// in `missing_fields`.
    pub fn apply_manual_entry(
        &mut self,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> Result<(), PayloadError> {
        if !self.required_fields.iter().any(|f| f == field) {
            return Err(PayloadError::UnknownField(field.to_string()));
        }

        let mut record = FieldRecord::manual(value);
        record.flags = field_flags(field, &record, self.confidence_threshold);
        tracing::debug!(
            bank = %self.bank,
            field,
            still_flagged = record.flags.any(),
            "Manual entry applied"
        );
        self.fields.insert(field.to_string(), record);
        self.missing_fields = derive_missing(&self.required_fields, &self.fields);
        Ok(())
    }

    /// Re-run full validation over the current records.
    pub fn revalidate(&mut self) {
        let (missing, fields) = validate(
            &to_raw_map(&self.fields),
            &self.required_fields,
            self.confidence_threshold,
        );
        self.fields = fields;
        self.missing_fields = missing;
    }

    /// The first field, in registry order, still needing attention.
    pub fn next_missing_field(&self) -> Option<&str> {
        self.missing_fields.first().map(String::as_str)
    }

    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.missing_fields.is_empty()
    }

    /// Records in registry order.
    pub fn records(&self) -> impl Iterator<Item = (&str, &FieldRecord)> {
        self.required_fields
            .iter()
            .filter_map(|key| self.fields.get(key).map(|r| (key.as_str(), r)))
    }
}
