//! Bank field registry: which fields each bank's application form requires.
//!
//! The registry is a CSV with one row per (bank, field). Mandatory columns
//! are `bank` and `bank_label` (`field` is accepted in its place); optional
//! columns are `canonical_key`, `section` and `required`. When a
//! `required` column is absent every listed row is required.
//!
//! The file is read-only for the lifetime of the process. `RegistryCache`
//! loads it once and swaps in a whole new snapshot on reload, so readers
//! never observe a partially loaded registry.

use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Remediation shown with every registry failure.
pub const REGISTRY_REMEDIATION: &str =
    "Build/generate the bank registry (bank_registry.csv) before running extraction";

const BANK_COLUMN: &str = "bank";
const LABEL_COLUMNS: &[&str] = &["bank_label", "field"];
const REQUIRED_COLUMN: &str = "required";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Bank registry not found at {}. Build/generate the bank registry (bank_registry.csv) first", .path.display())]
    NotFound { path: PathBuf },

    #[error("Bank registry {} is missing column(s): {}. Rebuild/generate the bank registry", .path.display(), .missing.join(", "))]
    MissingColumns { path: PathBuf, missing: Vec<String> },

    #[error("Bank registry is not valid CSV ({0}). Rebuild/generate the bank registry")]
    Csv(#[from] csv::Error),

    #[error("Bank registry could not be read: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bank registry cache lock poisoned")]
    LockPoisoned,
}

impl RegistryError {
    pub fn remediation(&self) -> &'static str {
        REGISTRY_REMEDIATION
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// One (bank, field) row of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegistryRow {
    pub bank: String,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub bank_label: Option<String>,
    /// Label column written by older registry builders.
    #[serde(default, deserialize_with = "blank_as_none")]
    pub field: Option<String>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub canonical_key: Option<String>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub section: Option<String>,
    #[serde(default, deserialize_with = "truthy")]
    pub required: bool,
}

impl RegistryRow {
    /// The bank's own label, `bank_label` first.
    pub fn label(&self) -> Option<&str> {
        self.bank_label.as_deref().or(self.field.as_deref())
    }

    /// Canonical key when usable, else the bank's own label.
    pub fn field_key(&self) -> Option<&str> {
        self.canonical_key
            .as_deref()
            .filter(|k| is_usable_key(k))
            .or_else(|| self.label().filter(|k| is_usable_key(k)))
            .map(str::trim)
    }
}

/// Rejects blank, whitespace-only and spreadsheet "nan" placeholders.
pub fn is_usable_key(key: &str) -> bool {
    let trimmed = key.trim();
    !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case("nan")
}

/// Trim, drop unusable keys, and de-duplicate keeping first occurrence.
pub fn clean_field_keys<I, S>(keys: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    keys.into_iter()
        .filter_map(|k| {
            let k = k.as_ref().trim();
            is_usable_key(k).then(|| k.to_string())
        })
        .filter(|k| seen.insert(k.clone()))
        .collect()
}

fn blank_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(deserializer)?;
    Ok(opt.filter(|value| !value.trim().is_empty()))
}

fn truthy<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(deserializer)?;
    Ok(opt.is_some_and(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "y"
        )
    }))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Anything that can resolve a bank's required fields.
pub trait RegistrySource: Send + Sync {
    fn required_fields(&self, bank: &str) -> Result<Vec<String>, RegistryError>;
}

/// A fully loaded registry snapshot.
#[derive(Debug, Clone, Default)]
pub struct BankRegistry {
    rows: Vec<RegistryRow>,
    has_required_column: bool,
}

impl BankRegistry {
    /// Load the registry CSV at `path`.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        if !path.is_file() {
            return Err(RegistryError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let file = std::fs::File::open(path)?;
        Self::parse(file, path)
    }

    /// Parse a registry from any reader (path is reported as `<reader>`).
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, RegistryError> {
        Self::parse(reader, Path::new("<reader>"))
    }

    fn parse<R: Read>(reader: R, origin: &Path) -> Result<Self, RegistryError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let headers = csv_reader.headers()?.clone();
        let has = |name: &str| headers.iter().any(|h| h == name);

        let mut missing = Vec::new();
        if !has(BANK_COLUMN) {
            missing.push(BANK_COLUMN.to_string());
        }
        if !LABEL_COLUMNS.iter().any(|&c| has(c)) {
            missing.push(LABEL_COLUMNS[0].to_string());
        }
        if !missing.is_empty() {
            return Err(RegistryError::MissingColumns {
                path: origin.to_path_buf(),
                missing,
            });
        }

        let has_required_column = has(REQUIRED_COLUMN);
        let rows = csv_reader
            .deserialize::<RegistryRow>()
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(
            rows = rows.len(),
            has_required_column,
            "Bank registry loaded"
        );

        Ok(Self {
            rows,
            has_required_column,
        })
    }

    /// Distinct bank identifiers in first-seen order.
    pub fn banks(&self) -> Vec<String> {
        clean_field_keys(self.rows.iter().map(|r| r.bank.as_str()))
    }

    pub fn rows(&self) -> &[RegistryRow] {
        &self.rows
    }

    /// Ordered, de-duplicated required field keys for `bank` (exact match).
    pub fn required_fields_for(&self, bank: &str) -> Vec<String> {
        let keys = self
            .rows
            .iter()
            .filter(|r| r.bank == bank)
            .filter(|r| !self.has_required_column || r.required)
            .filter_map(RegistryRow::field_key);
        clean_field_keys(keys)
    }
}

impl RegistrySource for BankRegistry {
    fn required_fields(&self, bank: &str) -> Result<Vec<String>, RegistryError> {
        Ok(self.required_fields_for(bank))
    }
}

/// Process-lifetime cache over a registry file.
pub struct RegistryCache {
    path: PathBuf,
    snapshot: RwLock<Option<Arc<BankRegistry>>>,
}

impl RegistryCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            snapshot: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current snapshot, loading it on first access.
    pub fn get(&self) -> Result<Arc<BankRegistry>, RegistryError> {
        {
            let guard = self.snapshot.read().map_err(|_| RegistryError::LockPoisoned)?;
            if let Some(registry) = guard.as_ref() {
                return Ok(Arc::clone(registry));
            }
        }
        self.reload()
    }

    /// Load the file again and swap the snapshot in one step.
    pub fn reload(&self) -> Result<Arc<BankRegistry>, RegistryError> {
        let fresh = Arc::new(BankRegistry::load(&self.path)?);
        let mut guard = self.snapshot.write().map_err(|_| RegistryError::LockPoisoned)?;
        *guard = Some(Arc::clone(&fresh));
        Ok(fresh)
    }
}

impl RegistrySource for RegistryCache {
    fn required_fields(&self, bank: &str) -> Result<Vec<String>, RegistryError> {
        Ok(self.get()?.required_fields_for(bank))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
