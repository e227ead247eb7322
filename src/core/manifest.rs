//! Rule manifests
//!
//! A manifest is a JSON array of [`RuleSpec`] objects:
//!
//! ```json
//! [
//!   { "name": "ssh", "dport": 22 },
//!   { "name": "web", "dport": [80, 443], "source": ["10.0.0.0/8", "192.168.0.0/16"] },
//!   { "name": "drop rest", "proto": "all", "jump": "DROP" }
//! ]
//! ```
//!
//! Names identify declarations and must be unique within a manifest.

use crate::core::firewall::RuleSpec;
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

/// Error type for manifest loading
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Manifest not found: {0}")]
    NotFound(String),

    #[error("Duplicate rule name '{0}'")]
    DuplicateName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid manifest: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Parses manifest JSON.
///
/// # Errors
///
/// Returns `Err` on malformed JSON, unknown fields or enum values, or a
/// repeated rule name.
pub fn parse(json: &str) -> Result<Vec<RuleSpec>, ManifestError> {
    let specs: Vec<RuleSpec> = serde_json::from_str(json)?;

    let mut seen = HashSet::new();
    if let Some(dup) = specs.iter().find(|spec| !seen.insert(spec.name.as_str())) {
        return Err(ManifestError::DuplicateName(dup.name.clone()));
    }

    Ok(specs)
}

/// Reads and parses a manifest file.
///
/// Uses `tokio::fs` for non-blocking file I/O.
pub async fn load(path: &Path) -> Result<Vec<RuleSpec>, ManifestError> {
    if !tokio::fs::try_exists(path).await? {
        return Err(ManifestError::NotFound(path.display().to_string()));
    }

    let json = tokio::fs::read_to_string(path).await?;
    let specs = parse(&json)?;
    info!("Loaded {} rule spec(s) from {}", specs.len(), path.display());
    Ok(specs)
}
