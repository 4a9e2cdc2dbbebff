//! Inbound message envelopes
//!
//! One JSON object per line, using the upstream wire format's
//! PascalCase field names. Only the sender is mandatory; everything
//! the engine does not consume is carried for completeness and
//! ignored downstream.

use serde::Deserialize;
use thiserror::Error;

/// Structured message envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    pub sender: String,
    #[serde(default)]
    pub sender_type: Option<String>,
    #[serde(default)]
    pub message_text: String,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub sentiment: Option<String>,
    #[serde(default)]
    pub attachments: Vec<serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid envelope JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope has empty sender")]
    EmptySender,
}

/// Parse one envelope line, rejecting malformed JSON and envelopes
/// with an empty or whitespace-only sender before they can reach the
/// debounce engine.
pub fn parse(line: &str) -> Result<Envelope, EnvelopeError> {
    let envelope: Envelope = serde_json::from_str(line)?;
    if envelope.sender.trim().is_empty() {
        return Err(EnvelopeError::EmptySender);
    }
    Ok(envelope)
}
