//! In-band messages carried on the data channel.
//!
//! Every message travels as a JSON envelope `{"kind": ..., "payload": ...}`.
//! Only `credential` is defined; anything else decodes to
//! [`Message::Unknown`] so newer peers never break older ones.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::transport::{ChannelState, DataLink, TransportError};

const CREDENTIAL_KIND: &str = "credential";

#[derive(Clone, PartialEq, Eq)]
pub enum Message {
    Credential { value: String },
    Unknown { kind: String },
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Credential { value } => f
                .debug_struct("Credential")
                .field("len", &value.len())
                .finish(),
            Message::Unknown { kind } => f.debug_struct("Unknown").field("kind", kind).finish(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct CredentialPayload {
    value: String,
}

impl Message {
    pub fn credential(value: impl Into<String>) -> Self {
        Message::Credential {
            value: value.into(),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Message::Credential { .. } => CREDENTIAL_KIND,
            Message::Unknown { kind } => kind,
        }
    }

    pub fn to_wire(&self) -> String {
        let payload = match self {
            Message::Credential { value } => serde_json::json!({ "value": value }),
            Message::Unknown { .. } => serde_json::Value::Null,
        };
        serde_json::json!({ "kind": self.kind(), "payload": payload }).to_string()
    }

    pub fn from_wire(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))?;
        match envelope.kind.as_str() {
            CREDENTIAL_KIND => {
                let payload: CredentialPayload = serde_json::from_value(envelope.payload)
                    .map_err(|err| ProtocolError::Malformed(format!("credential payload: {err}")))?;
                Ok(Message::Credential {
                    value: payload.value,
                })
            }
            _ => Ok(Message::Unknown {
                kind: envelope.kind,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            interval: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Upper bound on the time `send_with_retry` spends waiting.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts.max(1)
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("data channel was not created after multiple attempts")]
    ChannelNotCreated,
    #[error("data channel still connecting after multiple attempts")]
    ChannelTimeout,
    #[error("data channel is closed")]
    ChannelClosed,
    #[error("data channel in unexpected state {0:?}")]
    UnexpectedChannelState(ChannelState),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The session's current data channel, as published by the controller.
pub type ChannelWatch = watch::Receiver<Option<Arc<dyn DataLink>>>;

/// Sends `message` once the current channel is open, polling every
/// `policy.interval` for at most `policy.max_attempts` looks.
pub async fn send_with_retry(
    channels: &ChannelWatch,
    message: &Message,
    policy: RetryPolicy,
) -> Result<(), SendError> {
    let max_attempts = policy.max_attempts.max(1);
    let wire = message.to_wire();
    let mut attempt = 1;
    loop {
        let channel = channels.borrow().clone();
        let pending = match channel {
            None => SendError::ChannelNotCreated,
            Some(channel) => match channel.ready_state() {
                ChannelState::Open => {
                    channel.send_text(&wire).await?;
                    info!(
                        target: "pastelink::protocol",
                        kind = message.kind(),
                        channel = %channel.id(),
                        attempt,
                        "message sent"
                    );
                    return Ok(());
                }
                ChannelState::Connecting => SendError::ChannelTimeout,
                ChannelState::Closing | ChannelState::Closed => {
                    warn!(
                        target: "pastelink::protocol",
                        channel = %channel.id(),
                        "refusing to send on a closed channel"
                    );
                    return Err(SendError::ChannelClosed);
                }
                other => SendError::UnexpectedChannelState(other),
            },
        };

        if attempt >= max_attempts {
            warn!(
                target: "pastelink::protocol",
                kind = message.kind(),
                attempts = attempt,
                error = %pending,
                "giving up on send"
            );
            return Err(pending);
        }
        debug!(
            target: "pastelink::protocol",
            attempt,
            max_attempts,
            reason = %pending,
            "channel not ready; retrying"
        );
        sleep(policy.interval).await;
        attempt += 1;
    }
}

/// Sends credentials over whichever channel the session currently holds.
#[derive(Clone)]
pub struct CredentialSender {
    channels: ChannelWatch,
    policy: RetryPolicy,
}

impl CredentialSender {
    pub fn new(channels: ChannelWatch, policy: RetryPolicy) -> Self {
        Self { channels, policy }
    }

    pub async fn send(&self, value: &str) -> Result<(), SendError> {
        send_with_retry(&self.channels, &Message::credential(value), self.policy).await
    }
}
