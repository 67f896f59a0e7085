//! Payload envelope codec.
//!
//! Outbox payloads and snapshot state are persisted as text: the value is
//! serialized to JSON, compressed with zstd and base64-encoded. Event payloads
//! are wrapped in a [`PayloadEnvelope`] whose `$type` discriminator lets a
//! reader rebuild the record without knowing the concrete event type.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::event::EventMetadata;
use crate::storage::{OutboxState, StoredEvent};

/// zstd level used for persisted payloads.
const ZSTD_COMPRESSION_LEVEL: i32 = 3;

/// Self-describing event payload as persisted in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadEnvelope {
    /// Event type discriminator.
    #[serde(rename = "$type")]
    pub event_type: String,
    /// Type of the aggregate that raised the event.
    pub aggregate_type: String,
    /// Full event metadata.
    pub metadata: EventMetadata,
    /// Event payload.
    pub data: serde_json::Value,
}

impl PayloadEnvelope {
    /// Wraps a stored event.
    #[must_use]
    pub fn from_stored(event: &StoredEvent) -> Self {
        Self {
            event_type: event.event_type.clone(),
            aggregate_type: event.aggregate_type.clone(),
            metadata: event.metadata.clone(),
            data: event.body.clone(),
        }
    }

    /// Unwraps into a stored event with the given delivery bookkeeping.
    #[must_use]
    pub fn into_stored(self, times_sent: i16, state: OutboxState) -> StoredEvent {
        StoredEvent {
            metadata: self.metadata,
            aggregate_type: self.aggregate_type,
            event_type: self.event_type,
            body: self.data,
            times_sent,
            state,
        }
    }
}

/// Serializes, compresses and base64-encodes a value.
///
/// # Errors
///
/// Returns `DomainError::Serialization` if serialization or compression fails.
pub fn encode<T: Serialize>(value: &T) -> Result<String, DomainError> {
    let json = serde_json::to_vec(value)?;
    let compressed = zstd::encode_all(json.as_slice(), ZSTD_COMPRESSION_LEVEL)
        .map_err(|e| DomainError::Serialization(format!("payload compression failed: {e}")))?;
    Ok(STANDARD.encode(compressed))
}

/// Reverses [`encode`].
///
/// # Errors
///
/// Returns `DomainError::Serialization` if the text is not valid base64, not
/// a zstd frame, or does not deserialize into `T`.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, DomainError> {
    let compressed = STANDARD
        .decode(text.trim())
        .map_err(|e| DomainError::Serialization(format!("payload is not base64: {e}")))?;
    let json = zstd::decode_all(compressed.as_slice())
        .map_err(|e| DomainError::Serialization(format!("payload decompression failed: {e}")))?;
    Ok(serde_json::from_slice(&json)?)
}

/// Encodes a stored event as an outbox payload.
///
/// # Errors
///
/// See [`encode`].
pub fn encode_event(event: &StoredEvent) -> Result<String, DomainError> {
    encode(&PayloadEnvelope::from_stored(event))
}

/// Decodes an outbox payload back into a stored event.
///
/// # Errors
///
/// See [`decode`].
pub fn decode_event(
    text: &str,
    times_sent: i16,
    state: OutboxState,
) -> Result<StoredEvent, DomainError> {
    Ok(decode::<PayloadEnvelope>(text)?.into_stored(times_sent, state))
}
