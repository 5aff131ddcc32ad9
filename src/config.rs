use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "Mortgage Intake";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Registry location used when `MORTGAGE_INTAKE_REGISTRY` is not set.
pub const DEFAULT_REGISTRY_PATH: &str = "registry_store/bank_registry.csv";

/// Environment variable overriding the registry location.
pub const REGISTRY_PATH_ENV: &str = "MORTGAGE_INTAKE_REGISTRY";

/// Default tracing filter when `RUST_LOG` is unset.
/// HTTP internals stay at warn so request bodies never reach the log.
pub fn default_log_filter() -> &'static str {
    "mortgage_intake_lib=info,mortgage_intake=info,reqwest=warn,hyper=warn"
}

/// Resolve the bank registry CSV path.
pub fn registry_path() -> PathBuf {
    std::env::var(REGISTRY_PATH_ENV)
        .ok()
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_REGISTRY_PATH))
}
