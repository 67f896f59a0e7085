//! Key generation and the 32-character persisted key format.

use uuid::Uuid;

use crate::error::DomainError;

/// Generates a new globally unique, time-ordered key.
#[must_use]
pub fn new_key() -> Uuid {
    Uuid::now_v7()
}

/// Formats a key as 32 lowercase hex characters without hyphens.
#[must_use]
pub fn format_key(key: Uuid) -> String {
    key.simple().to_string()
}

/// Parses a key stored in the 32-character format.
///
/// # Errors
///
/// Returns `DomainError::Serialization` if `raw` is not a valid key.
pub fn parse_key(raw: &str) -> Result<Uuid, DomainError> {
    Uuid::try_parse(raw.trim())
        .map_err(|e| DomainError::Serialization(format!("invalid key {raw:?}: {e}")))
}
