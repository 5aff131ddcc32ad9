// Post-extraction normalization and gap detection.
// Turns untrusted per-field model output into canonical FieldRecords and
// flags each field as missing, low-confidence, or format-invalid.
// Total over every input shape: bad data degrades to "missing", never an error.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde_json::{Map, Value};

use crate::models::{FieldFlags, FieldRecord, FieldValue};

static EMAIL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

static PHONE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+\d][\d\s-]{7,}$").unwrap());

static EMIRATES_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^784-\d{4}-\d{7}-\d$").unwrap());

/// Accepted date layouts: ISO, then day-first with slashes or hyphens.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"];

// ---------------------------------------------------------------------------
// Semantic categories
// ---------------------------------------------------------------------------

/// Semantic type of a field, inferred from its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldCategory {
    Email,
    Phone,
    EmiratesId,
    Date,
}

impl FieldCategory {
    /// First matching category wins, checked by substring of the lowercased key.
    pub fn detect(field_key: &str) -> Option<Self> {
        let key = field_key.to_lowercase();
        if key.contains("email") {
            Some(Self::Email)
        } else if key.contains("mobile") || key.contains("phone") {
            Some(Self::Phone)
        } else if key.contains("emirates") || key.contains("eid") {
            Some(Self::EmiratesId)
        } else if key.contains("date") || key.contains("dob") {
            Some(Self::Date)
        } else {
            None
        }
    }

    /// Whether `value` is well-formed for this category.
    pub fn accepts(&self, value: &str) -> bool {
        let value = value.trim();
        match self {
            Self::Email => EMAIL_PATTERN.is_match(value),
            Self::Phone => PHONE_PATTERN.is_match(value),
            Self::EmiratesId => EMIRATES_ID_PATTERN.is_match(value),
            Self::Date => DATE_FORMATS
                .iter()
                .any(|fmt| NaiveDate::parse_from_str(value, fmt).is_ok()),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw entry shapes
// ---------------------------------------------------------------------------

/// The shapes a model may return for one key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawFieldEntry<'a> {
    /// `{"value": .., "confidence": .., "evidence": ..}`, any member may be absent.
    Record {
        value: Option<&'a Value>,
        confidence: Option<&'a Value>,
        evidence: Option<&'a Value>,
    },
    /// A bare value with no confidence attached.
    Scalar(&'a Value),
    Absent,
}

impl<'a> RawFieldEntry<'a> {
    pub fn classify(entry: Option<&'a Value>) -> Self {
        match entry {
            None | Some(Value::Null) => Self::Absent,
            Some(Value::Object(map)) => Self::Record {
                value: map.get("value"),
                confidence: map.get("confidence"),
                evidence: map.get("evidence"),
            },
            Some(other) => Self::Scalar(other),
        }
    }

    /// Normalize into a canonical record. Flags are computed separately.
    pub fn normalize(self) -> FieldRecord {
        match self {
            Self::Absent => FieldRecord::empty(),
            Self::Scalar(value) => FieldRecord {
                value: FieldValue::from_json(value),
                ..FieldRecord::empty()
            },
            Self::Record {
                value,
                confidence,
                evidence,
            } => FieldRecord {
                value: value.map(FieldValue::from_json).unwrap_or_default(),
                confidence: coerce_confidence(confidence),
                evidence: evidence.and_then(coerce_evidence),
                flags: FieldFlags::default(),
            },
        }
    }
}

/// Coerce a raw confidence into [0.0, 1.0]. Anything non-numeric is 0.0.
pub fn coerce_confidence(raw: Option<&Value>) -> f64 {
    let parsed = match raw {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(c) if c.is_finite() => c.clamp(0.0, 1.0),
        _ => 0.0,
    }
}

fn coerce_evidence(raw: &Value) -> Option<String> {
    match raw {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Compute the flags for one record under `confidence_threshold`.
pub fn field_flags(field_key: &str, record: &FieldRecord, confidence_threshold: f64) -> FieldFlags {
    let invalid_format = match &record.value {
        FieldValue::Text(s) if !s.is_empty() => {
            FieldCategory::detect(field_key).is_some_and(|category| !category.accepts(s))
        }
        _ => false,
    };

    FieldFlags {
        missing: record.value.is_empty(),
        low_confidence: record.confidence < confidence_threshold,
        invalid_format,
    }
}

/// Ordered subsequence of `required` whose records need attention.
pub fn derive_missing(required: &[String], fields: &BTreeMap<String, FieldRecord>) -> Vec<String> {
    let mut seen = HashSet::new();
    required
        .iter()
        .filter(|key| seen.insert(key.as_str()))
        .filter(|key| fields.get(key.as_str()).map_or(true, |r| r.flags.any()))
        .cloned()
        .collect()
}

/// Normalize raw extraction output against the required field list.
///
/// Every required key gets a record (absent keys become empty records);
/// keys not in `required` are ignored. Returns `(missing_fields, fields)`.
pub fn validate(
    extracted: &Map<String, Value>,
    required: &[String],
    confidence_threshold: f64,
) -> (Vec<String>, BTreeMap<String, FieldRecord>) {
    let mut fields = BTreeMap::new();

    for key in required {
        if fields.contains_key(key) {
            continue;
        }
        let mut record = RawFieldEntry::classify(extracted.get(key)).normalize();
        record.flags = field_flags(key, &record, confidence_threshold);
        fields.insert(key.clone(), record);
    }

    let missing = derive_missing(required, &fields);
    (missing, fields)
}

/// Convert normalized records back into the raw map shape, for re-validation.
pub fn to_raw_map(fields: &BTreeMap<String, FieldRecord>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(key, record)| (key.clone(), record.to_raw()))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn raw(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("fixture must be an object"),
        }
    }

    #[test]
    fn format_invalid_email_is_missing() {
        let required = keys(&["applicant.full_name", "applicant.email"]);
        let extracted = raw(json!({
            "applicant.full_name": {"value": "Jane Doe", "confidence": 0.95, "evidence": "Name: Jane Doe"},
            "applicant.email": {"value": "not-an-email", "confidence": 0.9, "evidence": "..."}
        }));

        let (missing, fields) = validate(&extracted, &required, 0.6);

        assert_eq!(missing, keys(&["applicant.email"]));
        assert_eq!(fields["applicant.full_name"].flags, FieldFlags::default());
        assert!(fields["applicant.email"].flags.invalid_format);
        assert!(!fields["applicant.email"].flags.missing);
    }

    #[test]
    fn covers_exactly_the_required_set() {
        let required = keys(&["a", "b", "c"]);
        let extracted = raw(json!({
            "a": {"value": "x", "confidence": 0.9},
            "unrequested": {"value": "y", "confidence": 0.9}
        }));

        let (_, fields) = validate(&extracted, &required, 0.5);

        let got: Vec<&str> = fields.keys().map(String::as_str).collect();
        assert_eq!(got, vec!["a", "b", "c"]);
        assert_eq!(fields["b"], {
            let mut r = FieldRecord::empty();
            r.flags = FieldFlags { missing: true, low_confidence: true, invalid_format: false };
            r
        });
    }

    #[test]
    fn missing_preserves_required_order() {
        let required = keys(&["z", "a", "m"]);
        let (missing, _) = validate(&Map::new(), &required, 0.6);
        assert_eq!(missing, required);
    }

    #[test]
    fn duplicate_required_keys_collapse() {
        let required = keys(&["a", "b", "a"]);
        let (missing, fields) = validate(&Map::new(), &required, 0.6);
        assert_eq!(fields.len(), 2);
        assert_eq!(missing, keys(&["a", "b"]));
    }

    #[test]
    fn non_numeric_confidence_defaults_to_zero() {
        let required = keys(&["a", "b", "c", "d"]);
        let extracted = raw(json!({
            "a": {"value": "x", "confidence": "high"},
            "b": {"value": "x", "confidence": "0.8"},
            "c": {"value": "x", "confidence": [0.9]},
            "d": {"value": "x", "confidence": 7}
        }));

        let (_, fields) = validate(&extracted, &required, 0.6);

        assert_eq!(fields["a"].confidence, 0.0);
        assert!((fields["b"].confidence - 0.8).abs() < f64::EPSILON);
        assert_eq!(fields["c"].confidence, 0.0);
        assert_eq!(fields["d"].confidence, 1.0);
    }

    #[test]
    fn bare_scalar_keeps_value_with_zero_confidence() {
        let required = keys(&["loan.amount"]);
        let extracted = raw(json!({"loan.amount": 1500000}));

        let (missing, fields) = validate(&extracted, &required, 0.6);

        assert_eq!(fields["loan.amount"].value, FieldValue::from(1_500_000i64));
        assert_eq!(fields["loan.amount"].confidence, 0.0);
        assert!(fields["loan.amount"].flags.low_confidence);
        assert_eq!(missing, required);
    }

    #[test]
    fn malformed_shapes_degrade_to_missing() {
        let required = keys(&["a", "b", "c"]);
        let extracted = raw(json!({
            "a": null,
            "b": {"unexpected": true},
            "c": {"value": [], "confidence": 0.99}
        }));

        let (missing, fields) = validate(&extracted, &required, 0.6);

        assert_eq!(missing, required);
        assert!(fields.values().all(|r| r.flags.missing));
    }

    #[test]
    fn empty_string_is_missing() {
        let required = keys(&["applicant.employer"]);
        let extracted = raw(json!({"applicant.employer": {"value": "", "confidence": 0.9}}));
        let (missing, fields) = validate(&extracted, &required, 0.6);
        assert!(fields["applicant.employer"].flags.missing);
        assert_eq!(missing.len(), 1);
    }

    #[test]
    fn threshold_boundary_is_inclusive() {
        let required = keys(&["a"]);
        let extracted = raw(json!({"a": {"value": "x", "confidence": 0.6}}));
        let (missing, _) = validate(&extracted, &required, 0.6);
        assert!(missing.is_empty());

        let (missing, _) = validate(&extracted, &required, 0.61);
        assert_eq!(missing, required);
    }

    #[test]
    fn revalidation_is_idempotent() {
        let required = keys(&["applicant.email", "applicant.mobile", "applicant.dob", "x"]);
        let extracted = raw(json!({
            "applicant.email": {"value": "jane@doe.com", "confidence": 0.9, "evidence": "e"},
            "applicant.mobile": {"value": "12", "confidence": 0.9},
            "applicant.dob": {"value": "31/02/1990", "confidence": "0.7"},
            "x": 5
        }));

        let (missing, fields) = validate(&extracted, &required, 0.6);
        let (missing_again, fields_again) = validate(&to_raw_map(&fields), &required, 0.6);

        assert_eq!(missing, missing_again);
        assert_eq!(fields, fields_again);
    }

    #[test]
    fn missing_matches_flag_recomputation_for_any_threshold() {
        let required = keys(&["a", "b", "c"]);
        let extracted = raw(json!({
            "a": {"value": "x", "confidence": 0.2},
            "b": {"value": "y", "confidence": 0.5},
            "c": {"value": "z", "confidence": 0.9}
        }));

        for t in [0.0, 0.2, 0.3, 0.5, 0.7, 0.9, 1.0] {
            let (missing, fields) = validate(&extracted, &required, t);
            let expected: Vec<String> = required
                .iter()
                .filter(|k| {
                    let r = &fields[k.as_str()];
                    r.value.is_empty() || r.confidence < t || r.flags.invalid_format
                })
                .cloned()
                .collect();
            assert_eq!(missing, expected, "threshold {t}");
        }
    }

    #[test]
    fn category_detection_order() {
        assert_eq!(FieldCategory::detect("Applicant Email"), Some(FieldCategory::Email));
        assert_eq!(FieldCategory::detect("mobile_phone"), Some(FieldCategory::Phone));
        assert_eq!(FieldCategory::detect("EID Number"), Some(FieldCategory::EmiratesId));
        assert_eq!(FieldCategory::detect("emirates_id_expiry_date"), Some(FieldCategory::EmiratesId));
        assert_eq!(FieldCategory::detect("DOB"), Some(FieldCategory::Date));
        assert_eq!(FieldCategory::detect("monthly_salary"), None);
    }

    #[test]
    fn phone_format() {
        assert!(FieldCategory::Phone.accepts("+971 50 123 4567"));
        assert!(FieldCategory::Phone.accepts("050-1234567"));
        assert!(!FieldCategory::Phone.accepts("12345"));
        assert!(!FieldCategory::Phone.accepts("call me"));
    }

    #[test]
    fn emirates_id_format() {
        assert!(FieldCategory::EmiratesId.accepts("784-1990-1234567-1"));
        assert!(!FieldCategory::EmiratesId.accepts("784-199-1234567-1"));
        assert!(!FieldCategory::EmiratesId.accepts("785-1990-1234567-1"));
    }

    #[test]
    fn date_formats() {
        assert!(FieldCategory::Date.accepts("1990-04-21"));
        assert!(FieldCategory::Date.accepts("21/04/1990"));
        assert!(FieldCategory::Date.accepts("21-04-1990"));
        assert!(!FieldCategory::Date.accepts("04/31/1990"));
        assert!(!FieldCategory::Date.accepts("April 21, 1990"));
    }

    #[test]
    fn non_string_values_are_never_format_invalid() {
        let record = FieldRecord {
            value: FieldValue::from(971501234567i64),
            confidence: 0.9,
            evidence: None,
            flags: FieldFlags::default(),
        };
        assert!(!field_flags("applicant.mobile", &record, 0.6).invalid_format);
    }

    #[test]
    fn uncategorized_keys_always_valid_format() {
        let record = FieldRecord {
            value: FieldValue::from("anything at all"),
            confidence: 0.9,
            evidence: None,
            flags: FieldFlags::default(),
        };
        assert_eq!(field_flags("property.community", &record, 0.6), FieldFlags::default());
    }
}
