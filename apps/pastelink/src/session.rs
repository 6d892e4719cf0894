use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::codec::SessionDescriptor;
use crate::transport::{ChannelState, DataLink, PeerLink, TransportEvent};
use crate::watchdog::WatchdogTicket;

/// Which side of the hand-off this instance plays. The sender creates the
/// offer and the primary data channel; the receiver answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    Negotiating,
    AwaitingRemote,
    Connecting,
    Open,
    Closed,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Negotiating => "negotiating",
            Phase::AwaitingRemote => "awaiting_remote",
            Phase::Connecting => "connecting",
            Phase::Open => "open",
            Phase::Closed => "closed",
            Phase::Failed => "failed",
        }
    }

    /// Phases after which the attempt holds no live handles.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Closed | Phase::Failed)
    }

    /// Phases that end watchdog supervision.
    pub fn ends_supervision(self) -> bool {
        matches!(self, Phase::Open | Phase::Closed | Phase::Failed)
    }

    pub fn can_advance_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Idle, Negotiating)
                | (Negotiating, AwaitingRemote)
                | (Negotiating, Connecting)
                | (AwaitingRemote, Connecting)
                | (Connecting, Open)
                | (Open, Closed)
                | (Negotiating, Failed)
                | (AwaitingRemote, Failed)
                | (Connecting, Failed)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(pub u64);

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything that can wake the controller loop. Every variant names the
/// attempt it belongs to so that events from a superseded attempt are dropped.
#[derive(Debug)]
pub enum SessionEvent {
    Transport {
        attempt: AttemptId,
        event: TransportEvent,
    },
    WatchdogTick {
        attempt: AttemptId,
    },
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub from: Phase,
    pub to: Phase,
}

/// One connection attempt. Owned by the controller; nothing else mutates it.
pub struct SessionState {
    attempt: AttemptId,
    role: Role,
    phase: Phase,
    pub(crate) local: Option<SessionDescriptor>,
    pub(crate) remote: Option<SessionDescriptor>,
    peer: Option<Arc<dyn PeerLink>>,
    channel: Option<Arc<dyn DataLink>>,
    started_at: Instant,
    watchdog: Option<WatchdogTicket>,
    pub(crate) fallback_fired: bool,
    pub(crate) credential_sent: bool,
}

impl SessionState {
    pub fn new(attempt: AttemptId, role: Role) -> Self {
        Self {
            attempt,
            role,
            phase: Phase::Idle,
            local: None,
            remote: None,
            peer: None,
            channel: None,
            started_at: Instant::now(),
            watchdog: None,
            fallback_fired: false,
            credential_sent: false,
        }
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn local_descriptor(&self) -> Option<&SessionDescriptor> {
        self.local.as_ref()
    }

    pub fn remote_descriptor(&self) -> Option<&SessionDescriptor> {
        self.remote.as_ref()
    }

    pub fn peer(&self) -> Option<&Arc<dyn PeerLink>> {
        self.peer.as_ref()
    }

    pub fn channel(&self) -> Option<&Arc<dyn DataLink>> {
        self.channel.as_ref()
    }

    pub fn channel_open(&self) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|channel| channel.ready_state() == ChannelState::Open)
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Moves to `next`. Entering `Open`, `Closed` or `Failed` cancels any
    /// pending watchdog tick.
    pub fn advance(&mut self, next: Phase) -> Result<Phase, InvalidTransition> {
        if !self.phase.can_advance_to(next) {
            return Err(InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        let previous = self.phase;
        self.phase = next;
        if next.ends_supervision() {
            self.cancel_watchdog();
        }
        Ok(previous)
    }

    pub(crate) fn restart_clock(&mut self) {
        self.started_at = Instant::now();
    }

    pub(crate) fn set_peer(&mut self, peer: Arc<dyn PeerLink>) {
        self.peer = Some(peer);
    }

    pub(crate) fn set_channel(&mut self, channel: Arc<dyn DataLink>) -> Option<Arc<dyn DataLink>> {
        self.channel.replace(channel)
    }

    pub(crate) fn take_channel(&mut self) -> Option<Arc<dyn DataLink>> {
        self.channel.take()
    }

    /// Stores the next tick, dropping (and so aborting) any previous one.
    pub(crate) fn store_ticket(&mut self, ticket: WatchdogTicket) {
        if let Some(previous) = self.watchdog.replace(ticket) {
            previous.cancel();
        }
    }

    pub(crate) fn take_ticket(&mut self) -> Option<WatchdogTicket> {
        self.watchdog.take()
    }

    pub(crate) fn cancel_watchdog(&mut self) {
        if let Some(ticket) = self.watchdog.take() {
            ticket.cancel();
        }
    }

    /// Cancels supervision and closes the channel and peer. Safe to call any
    /// number of times.
    pub(crate) async fn release(&mut self) {
        self.cancel_watchdog();
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        if let Some(peer) = self.peer.take() {
            peer.close().await;
        }
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("attempt", &self.attempt)
            .field("role", &self.role)
            .field("phase", &self.phase)
            .field("has_local", &self.local.is_some())
            .field("has_remote", &self.remote.is_some())
            .field("has_peer", &self.peer.is_some())
            .field("channel", &self.channel.as_ref().map(|c| c.id()))
            .field("watchdog_armed", &self.watchdog.is_some())
            .finish()
    }
}

/// Read-only view of the current attempt for UI layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub attempt: Option<AttemptId>,
    pub role: Option<Role>,
    pub phase: Phase,
    pub channel_open: bool,
    pub local_descriptor: Option<SessionDescriptor>,
}
