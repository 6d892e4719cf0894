//! User-facing status text.

use std::fmt;

use crate::controller::RecoveryAction;
use crate::session::{Phase, Role};
use crate::transport::{IceState, LinkState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Connecting => "Connecting...",
            ConnectionStatus::Disconnected => "Disconnected",
        })
    }
}

/// Summarises ICE and peer connection state for display.
pub fn connection_status(ice: IceState, link: LinkState) -> ConnectionStatus {
    if matches!(ice, IceState::Connected | IceState::Completed) || link == LinkState::Connected {
        ConnectionStatus::Connected
    } else if matches!(ice, IceState::New | IceState::Checking)
        || matches!(link, LinkState::New | LinkState::Connecting)
    {
        ConnectionStatus::Connecting
    } else {
        ConnectionStatus::Disconnected
    }
}

pub fn phase_text(role: Role, phase: Phase) -> &'static str {
    match (role, phase) {
        (_, Phase::Idle) => "Not connected.",
        (Role::Sender, Phase::Negotiating) => "Generating connection code...",
        (Role::Receiver, Phase::Negotiating) => "Establishing connection...",
        (_, Phase::AwaitingRemote) => {
            "Connection code generated! Share it with the receiver and wait for their answer code."
        }
        (Role::Sender, Phase::Connecting) => "Answer processed! Establishing connection...",
        (Role::Receiver, Phase::Connecting) => {
            "Send this answer code back to the sender to complete the connection."
        }
        (Role::Sender, Phase::Open) => "Connection established! Ready to send password.",
        (Role::Receiver, Phase::Open) => "Connected! Ready to receive password.",
        (_, Phase::Closed) => "Connection closed.",
        (Role::Sender, Phase::Failed) => {
            "Data channel connection failed. Please generate a new code."
        }
        (Role::Receiver, Phase::Failed) => {
            "Data channel connection failed. Please try reconnecting."
        }
    }
}

pub fn recovery_text(action: RecoveryAction) -> &'static str {
    match action {
        RecoveryAction::GenerateNewCode => "generate a new code and share it again",
        RecoveryAction::Reconnect => "reconnect with a fresh code from the sender",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_connectivity_counts_as_connected() {
        assert_eq!(
            connection_status(IceState::Completed, LinkState::Connecting),
            ConnectionStatus::Connected
        );
        assert_eq!(
            connection_status(IceState::Disconnected, LinkState::Connected),
            ConnectionStatus::Connected
        );
    }

    #[test]
    fn pending_states_read_as_connecting() {
        assert_eq!(
            connection_status(IceState::Checking, LinkState::Failed),
            ConnectionStatus::Connecting
        );
        assert_eq!(
            connection_status(IceState::Failed, LinkState::New),
            ConnectionStatus::Connecting
        );
    }

    #[test]
    fn dead_paths_read_as_disconnected() {
        assert_eq!(
            connection_status(IceState::Failed, LinkState::Failed),
            ConnectionStatus::Disconnected
        );
        assert_eq!(
            connection_status(IceState::Closed, LinkState::Disconnected),
            ConnectionStatus::Disconnected
        );
    }

    #[test]
    fn failure_text_names_the_recovery() {
        assert!(phase_text(Role::Sender, Phase::Failed).contains("generate a new code"));
        assert!(phase_text(Role::Receiver, Phase::Failed).contains("reconnecting"));
    }
}
