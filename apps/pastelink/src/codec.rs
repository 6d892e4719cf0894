//! Exchange codes: the printable form of a session descriptor that users copy
//! between machines by hand.
//!
//! A code is standard (padded) base64 over the JSON object
//! `{"type": "offer" | "answer", "sdp": "..."}`, which is the same shape a
//! browser produces for `JSON.stringify(RTCSessionDescription)`.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorKind {
    Offer,
    Answer,
}

impl DescriptorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DescriptorKind::Offer => "offer",
            DescriptorKind::Answer => "answer",
        }
    }
}

impl fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side's proposed session parameters. Produced by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    #[serde(rename = "type")]
    pub kind: DescriptorKind,
    #[serde(rename = "sdp")]
    pub body: String,
}

impl SessionDescriptor {
    pub fn offer(body: impl Into<String>) -> Self {
        Self {
            kind: DescriptorKind::Offer,
            body: body.into(),
        }
    }

    pub fn answer(body: impl Into<String>) -> Self {
        Self {
            kind: DescriptorKind::Answer,
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeCode(String);

impl ExchangeCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ExchangeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ExchangeCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid connection code: {0}")]
    InvalidFormat(String),
}

pub fn encode(descriptor: &SessionDescriptor) -> ExchangeCode {
    let json = serde_json::json!({
        "type": descriptor.kind.as_str(),
        "sdp": descriptor.body,
    });
    ExchangeCode(STANDARD.encode(json.to_string()))
}

/// Decodes a pasted code. Whitespace anywhere in the input is ignored so that
/// codes wrapped by chat clients or terminals still decode.
pub fn decode(code: &str) -> Result<SessionDescriptor, CodecError> {
    let compact: String = code.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(CodecError::InvalidFormat("code is empty".into()));
    }

    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|err| CodecError::InvalidFormat(format!("not base64: {err}")))?;
    let text = String::from_utf8(bytes)
        .map_err(|err| CodecError::InvalidFormat(format!("not utf-8: {err}")))?;
    let descriptor: SessionDescriptor = serde_json::from_str(&text)
        .map_err(|err| CodecError::InvalidFormat(format!("not a session description: {err}")))?;

    if descriptor.body.trim().is_empty() {
        return Err(CodecError::InvalidFormat(
            "session description is empty".into(),
        ));
    }
    Ok(descriptor)
}
