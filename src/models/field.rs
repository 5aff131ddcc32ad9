use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Confidence assigned to values typed in by a reviewer.
pub const MANUAL_CONFIDENCE: f64 = 0.99;

/// Evidence sentinel marking a reviewer-entered value.
pub const MANUAL_EVIDENCE: &str = "manual_input";

/// The extracted content of one form field.
///
/// Serializes as a bare JSON scalar (`null`, `true`, `42`, `"text"`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl FieldValue {
    /// Normalize an untrusted JSON value into a field value.
    ///
    /// Empty arrays become `Null`; other arrays are joined into text.
    /// Objects keep their compact JSON text so nothing is silently dropped.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Self::Number(n.clone()),
            Value::String(s) => Self::Text(s.clone()),
            Value::Array(items) if items.is_empty() => Self::Null,
            Value::Array(items) => Self::Text(
                items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            Value::Object(_) => Self::Text(value.to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(n.clone()),
            Self::Text(s) => Value::String(s.clone()),
        }
    }

    /// True for `null` and the empty string.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Human-readable rendering (empty for `Null`).
    pub fn display(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.clone(),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

/// Derived quality flags for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldFlags {
    pub missing: bool,
    pub low_confidence: bool,
    pub invalid_format: bool,
}

impl FieldFlags {
    /// True when the field needs human attention.
    pub fn any(&self) -> bool {
        self.missing || self.low_confidence || self.invalid_format
    }
}

/// Canonical record for one extracted field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRecord {
    #[serde(default)]
    pub value: FieldValue,
    pub confidence: f64,
    pub evidence: Option<String>,
    #[serde(default)]
    pub flags: FieldFlags,
}

impl FieldRecord {
    /// The soft-fail shape: no value, zero confidence, no evidence.
    pub fn empty() -> Self {
        Self {
            value: FieldValue::Null,
            confidence: 0.0,
            evidence: None,
            flags: FieldFlags::default(),
        }
    }

    /// A reviewer-entered value. Flags are left for the validator.
    pub fn manual(value: impl Into<FieldValue>) -> Self {
        Self {
            value: value.into(),
            confidence: MANUAL_CONFIDENCE,
            evidence: Some(MANUAL_EVIDENCE.to_string()),
            flags: FieldFlags::default(),
        }
    }

    pub fn is_manual(&self) -> bool {
        self.evidence.as_deref() == Some(MANUAL_EVIDENCE)
    }

    /// The raw `{value, confidence, evidence}` shape the model produces.
    pub fn to_raw(&self) -> Value {
        serde_json::json!({
            "value": self.value.to_json(),
            "confidence": self.confidence,
            "evidence": self.evidence,
        })
    }
}
