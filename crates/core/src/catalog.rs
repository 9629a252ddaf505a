//! Normalization for branch and area catalog entries.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("name is required")]
    EmptyName,
    #[error("code is required")]
    EmptyCode,
    #[error("code '{0}' may only contain letters, digits and underscores")]
    InvalidCode(String),
}

/// Trims a display name, rejecting blanks.
pub fn normalize_name(raw: &str) -> Result<String, CatalogError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(CatalogError::EmptyName);
    }
    Ok(name.to_string())
}

/// Lowercases a code and replaces spaces with underscores.
pub fn normalize_code(raw: &str) -> Result<String, CatalogError> {
    let code = raw.trim().to_lowercase().replace(' ', "_");
    if code.is_empty() {
        return Err(CatalogError::EmptyCode);
    }
    if !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(CatalogError::InvalidCode(code));
    }
    Ok(code)
}

/// Outcome of asking whether a catalog entry may be deactivated.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Deactivation {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl Deactivation {
    /// Blocks when the entry still has active workers or campaigns.
    pub fn evaluate(active_workers: i64, active_campaigns: i64) -> Self {
        let mut blockers = Vec::new();
        if active_workers > 0 {
            blockers.push(format!("{active_workers} active worker(s)"));
        }
        if active_campaigns > 0 {
            blockers.push(format!("{active_campaigns} active campaign(s)"));
        }
        if blockers.is_empty() {
            Self {
                allowed: true,
                reason: None,
            }
        } else {
            Self {
                allowed: false,
                reason: Some(format!("still has {}", blockers.join(" and "))),
            }
        }
    }
}
