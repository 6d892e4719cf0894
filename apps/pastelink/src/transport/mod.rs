use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::codec::SessionDescriptor;
use crate::session::{AttemptId, SessionEvent};

pub mod mock;
pub mod webrtc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("transport timeout")]
    Timeout,
}

pub(crate) fn to_setup_error<E: fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dc-{}", self.0)
    }
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_channel_id() -> ChannelId {
    ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
    Unknown,
}

/// Peer connection state as reported by the underlying stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

pub enum TransportEvent {
    LinkStateChanged(LinkState),
    ChannelOpened(ChannelId),
    ChannelClosed(ChannelId),
    /// A data channel announced by the remote peer.
    IncomingChannel(Arc<dyn DataLink>),
    Message {
        channel: ChannelId,
        text: String,
    },
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::LinkStateChanged(state) => {
                f.debug_tuple("LinkStateChanged").field(state).finish()
            }
            TransportEvent::ChannelOpened(id) => f.debug_tuple("ChannelOpened").field(id).finish(),
            TransportEvent::ChannelClosed(id) => f.debug_tuple("ChannelClosed").field(id).finish(),
            TransportEvent::IncomingChannel(channel) => f
                .debug_struct("IncomingChannel")
                .field("id", &channel.id())
                .field("label", &channel.label())
                .finish(),
            TransportEvent::Message { channel, text } => f
                .debug_struct("Message")
                .field("channel", channel)
                .field("len", &text.len())
                .finish(),
        }
    }
}

/// Forwards transport callbacks into the controller loop, tagged with the
/// attempt that registered them.
#[derive(Debug, Clone)]
pub struct EventSink {
    attempt: AttemptId,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(attempt: AttemptId, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { attempt, tx }
    }

    pub fn channel(attempt: AttemptId) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(attempt, tx), rx)
    }

    /// A sink whose events go nowhere.
    pub fn detached() -> Self {
        Self::channel(AttemptId(0)).0
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    pub fn emit(&self, event: TransportEvent) {
        if self
            .tx
            .send(SessionEvent::Transport {
                attempt: self.attempt,
                event,
            })
            .is_err()
        {
            tracing::trace!(
                target: "pastelink::transport",
                attempt = %self.attempt,
                "event dropped; controller gone"
            );
        }
    }
}

/// Factory for peer connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_peer(&self, events: EventSink) -> Result<Arc<dyn PeerLink>, TransportError>;
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Creates an offer and installs it as the local description.
    async fn create_offer(&self) -> Result<(), TransportError>;

    /// Creates an answer to the applied remote offer and installs it locally.
    async fn create_answer(&self) -> Result<(), TransportError>;

    async fn apply_remote(&self, descriptor: &SessionDescriptor) -> Result<(), TransportError>;

    /// Resolves once candidate gathering for the local description finishes.
    /// May never resolve; callers bound it with a timeout.
    async fn wait_for_gathering(&self);

    async fn local_descriptor(&self) -> Option<SessionDescriptor>;

    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataLink>, TransportError>;

    fn link_state(&self) -> LinkState;

    fn ice_state(&self) -> IceState;

    /// True once the connection itself is usable, whether or not a data
    /// channel has opened on it.
    fn is_connected(&self) -> bool {
        matches!(self.ice_state(), IceState::Connected | IceState::Completed)
            || self.link_state() == LinkState::Connected
    }

    /// Closes the connection. Closing twice is a no-op.
    async fn close(&self);
}

#[async_trait]
pub trait DataLink: Send + Sync {
    fn id(&self) -> ChannelId;

    fn label(&self) -> String;

    fn ready_state(&self) -> ChannelState;

    async fn send_text(&self, text: &str) -> Result<(), TransportError>;

    /// Closes the channel. Closing twice is a no-op.
    async fn close(&self);
}
