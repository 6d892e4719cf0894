//! The connection state machine.
//!
//! A [`ConnectionController`] owns at most one [`SessionState`] and is the only
//! thing that changes it. Transport callbacks and watchdog ticks arrive as
//! [`SessionEvent`]s on the controller's queue and are handled one at a time,
//! either by the caller pumping [`ConnectionController::next_event`] or by a
//! [`driver::SessionDriver`].

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{self, CodecError, DescriptorKind, ExchangeCode, SessionDescriptor};
use crate::config::Config;
use crate::protocol::{ChannelWatch, CredentialSender, Message};
use crate::session::{AttemptId, Phase, Role, SessionEvent, SessionSnapshot, SessionState};
use crate::status::{ConnectionStatus, connection_status};
use crate::store::{ConnectionInfo, StateStore, StoreError};
use crate::transport::{
    ChannelId, ChannelState, DataLink, EventSink, LinkState, PeerLink, Transport, TransportError,
    TransportEvent,
};
use crate::watchdog::SENDER_CHANNEL_LABEL;

pub mod driver;

const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    InvalidFormat(#[from] CodecError),
    #[error("the peer's connection code could not be applied ({0}); ask for a fresh code")]
    RemoteDescriptorRejected(String),
    #[error("connection failed; start a new attempt")]
    ConnectivityFailed,
    #[error("{trigger} is not valid while the session is {phase}")]
    InvalidTrigger { trigger: &'static str, phase: Phase },
    #[error("{trigger} is not available to the {role}")]
    WrongRole { trigger: &'static str, role: Role },
    #[error("the password was already sent in this session")]
    CredentialAlreadySent,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What the user has to do after an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    GenerateNewCode,
    Reconnect,
}

impl RecoveryAction {
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Sender => RecoveryAction::GenerateNewCode,
            Role::Receiver => RecoveryAction::Reconnect,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    ConnectionLost(LinkState),
    ChannelStalled,
}

/// Signals for UI layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    PhaseChanged { role: Role, phase: Phase },
    CodeReady { role: Role, code: ExchangeCode },
    ConnectionStatus(ConnectionStatus),
    ChannelRecreated { role: Role, label: String },
    CredentialReceived,
    RecoveryRequired { role: Role, action: RecoveryAction },
}

pub struct ConnectionController {
    transport: Arc<dyn Transport>,
    store: Arc<dyn StateStore>,
    config: Config,
    session: Option<SessionState>,
    attempts: u64,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    channel_tx: watch::Sender<Option<Arc<dyn DataLink>>>,
    notices: broadcast::Sender<Notice>,
}

impl ConnectionController {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn StateStore>, config: Config) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (channel_tx, _) = watch::channel(None);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            transport,
            store,
            config,
            session: None,
            attempts: 0,
            events_tx,
            events_rx,
            channel_tx,
            notices,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.store)
    }

    pub fn phase(&self) -> Phase {
        self.session
            .as_ref()
            .map_or(Phase::Idle, SessionState::phase)
    }

    pub fn role(&self) -> Option<Role> {
        self.session.as_ref().map(SessionState::role)
    }

    pub fn session(&self) -> Option<&SessionState> {
        self.session.as_ref()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            attempt: self.session.as_ref().map(SessionState::attempt),
            role: self.role(),
            phase: self.phase(),
            channel_open: self
                .session
                .as_ref()
                .is_some_and(SessionState::channel_open),
            local_descriptor: self
                .session
                .as_ref()
                .and_then(|session| session.local_descriptor().cloned()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn notice_sender(&self) -> broadcast::Sender<Notice> {
        self.notices.clone()
    }

    /// The current data channel; updated whenever the channel is replaced.
    pub fn channel_watch(&self) -> ChannelWatch {
        self.channel_tx.subscribe()
    }

    pub(crate) fn credential_sender(&self) -> CredentialSender {
        CredentialSender::new(self.channel_watch(), self.config.send_retry)
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.recv().await
    }

    pub(crate) fn event_sender(&self) -> mpsc::UnboundedSender<SessionEvent> {
        self.events_tx.clone()
    }

    pub(crate) fn session_mut(&mut self) -> Option<&mut SessionState> {
        self.session.as_mut()
    }

    pub(crate) fn notify(&self, notice: Notice) {
        // no subscribers is fine
        let _ = self.notices.send(notice);
    }

    /// Starts a sender attempt and returns the offer code to hand to the
    /// receiver. Any previous attempt is torn down first.
    pub async fn initiate(&mut self) -> Result<ExchangeCode, ControllerError> {
        self.discard_session().await;
        let attempt = self.begin(Role::Sender);
        match self.negotiate_offer(attempt).await {
            Ok(code) => Ok(code),
            Err(err) => {
                warn!(
                    target: "pastelink::controller",
                    %attempt,
                    error = %err,
                    "offer negotiation failed"
                );
                self.discard_session().await;
                Err(err)
            }
        }
    }

    /// Applies the receiver's answer code to a waiting sender attempt. A bad
    /// code leaves the attempt waiting so the user can paste again.
    pub async fn submit_answer(&mut self, code: &str) -> Result<(), ControllerError> {
        let phase = self.phase();
        match (self.role(), phase) {
            (Some(Role::Sender), Phase::AwaitingRemote) => {}
            (_, Phase::Failed) => return Err(ControllerError::ConnectivityFailed),
            _ => {
                return Err(ControllerError::InvalidTrigger {
                    trigger: "submit_answer",
                    phase,
                });
            }
        }

        let descriptor = codec::decode(code)?;
        expect_kind(&descriptor, DescriptorKind::Answer)?;

        let Some(session) = self.session.as_mut() else {
            return Err(ControllerError::InvalidTrigger {
                trigger: "submit_answer",
                phase,
            });
        };
        let attempt = session.attempt();
        let peer = session
            .peer()
            .cloned()
            .ok_or_else(|| TransportError::Setup("no peer connection for this attempt".into()))?;
        peer.apply_remote(&descriptor)
            .await
            .map_err(|err| ControllerError::RemoteDescriptorRejected(err.to_string()))?;
        session.remote = Some(descriptor);
        // supervision measures the connectivity attempt, not the time spent
        // waiting for the user to paste
        session.restart_clock();

        self.enter_connecting(attempt);
        Ok(())
    }

    /// Starts a receiver attempt from the sender's offer code and returns the
    /// answer code. A bad code leaves the controller untouched.
    pub async fn submit_offer(&mut self, code: &str) -> Result<ExchangeCode, ControllerError> {
        let descriptor = codec::decode(code)?;
        expect_kind(&descriptor, DescriptorKind::Offer)?;

        self.discard_session().await;
        let attempt = self.begin(Role::Receiver);
        match self.negotiate_answer(attempt, descriptor, code.trim()).await {
            Ok(answer) => Ok(answer),
            Err(err) => {
                warn!(
                    target: "pastelink::controller",
                    %attempt,
                    error = %err,
                    "answer negotiation failed"
                );
                self.discard_session().await;
                Err(err)
            }
        }
    }

    /// Reserves the attempt's one credential send. Only a sender whose channel
    /// is being set up or is already open may send, and only once.
    pub fn claim_credential_send(&mut self) -> Result<(), ControllerError> {
        const TRIGGER: &str = "send_credential";
        let phase = self.phase();
        let Some(session) = self.session.as_mut() else {
            return Err(ControllerError::InvalidTrigger {
                trigger: TRIGGER,
                phase,
            });
        };
        let role = session.role();
        if role != Role::Sender {
            return Err(ControllerError::WrongRole {
                trigger: TRIGGER,
                role,
            });
        }
        if !matches!(phase, Phase::Connecting | Phase::Open) {
            return Err(ControllerError::InvalidTrigger {
                trigger: TRIGGER,
                phase,
            });
        }
        if session.credential_sent {
            return Err(ControllerError::CredentialAlreadySent);
        }
        session.credential_sent = true;
        debug!(
            target: "pastelink::controller",
            attempt = %session.attempt(),
            "credential send claimed"
        );
        Ok(())
    }

    /// Explicit user teardown. An open session becomes `Closed`; an attempt
    /// still in progress is discarded.
    pub async fn teardown(&mut self) {
        match self.phase() {
            Phase::Open => self.close_session().await,
            Phase::Negotiating | Phase::AwaitingRemote | Phase::Connecting => {
                self.discard_session().await
            }
            Phase::Idle | Phase::Closed | Phase::Failed => {
                if let Some(session) = self.session.as_mut() {
                    session.release().await;
                }
            }
        }
    }

    /// Drops the current attempt, whatever its state, and returns to `Idle`.
    pub async fn reconnect(&mut self) {
        info!(target: "pastelink::controller", phase = %self.phase(), "reconnect requested");
        self.discard_session().await;
    }

    pub async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::WatchdogTick { attempt } => self.on_watchdog_tick(attempt).await,
            SessionEvent::Transport { attempt, event } => {
                let current = self.session.as_ref().map(SessionState::attempt);
                if current != Some(attempt) {
                    debug!(
                        target: "pastelink::controller",
                        %attempt,
                        ?event,
                        "dropping event from a superseded attempt"
                    );
                    return;
                }
                self.on_transport_event(event).await;
            }
        }
    }

    fn begin(&mut self, role: Role) -> AttemptId {
        self.attempts += 1;
        let attempt = AttemptId(self.attempts);
        self.session = Some(SessionState::new(attempt, role));
        info!(target: "pastelink::controller", %attempt, %role, "starting attempt");
        self.advance(Phase::Negotiating);
        attempt
    }

    async fn negotiate_offer(
        &mut self,
        attempt: AttemptId,
    ) -> Result<ExchangeCode, ControllerError> {
        let peer = self.open_peer(attempt).await?;
        let channel = peer.create_channel(SENDER_CHANNEL_LABEL).await?;
        self.install_channel(channel);
        peer.create_offer().await?;
        let local = self.collect_local_descriptor(&peer).await?;
        let code = codec::encode(&local);
        if let Some(session) = self.session.as_mut() {
            session.local = Some(local);
        }

        self.advance(Phase::AwaitingRemote);
        self.remember(ConnectionInfo {
            role: Role::Sender,
            encoded_offer: code.to_string(),
            encoded_answer: None,
        })
        .await;
        self.notify(Notice::CodeReady {
            role: Role::Sender,
            code: code.clone(),
        });
        Ok(code)
    }

    async fn negotiate_answer(
        &mut self,
        attempt: AttemptId,
        offer: SessionDescriptor,
        offer_code: &str,
    ) -> Result<ExchangeCode, ControllerError> {
        let peer = self.open_peer(attempt).await?;
        peer.apply_remote(&offer)
            .await
            .map_err(|err| ControllerError::RemoteDescriptorRejected(err.to_string()))?;
        if let Some(session) = self.session.as_mut() {
            session.remote = Some(offer);
        }
        peer.create_answer().await?;
        let local = self.collect_local_descriptor(&peer).await?;
        let code = codec::encode(&local);
        if let Some(session) = self.session.as_mut() {
            session.local = Some(local);
        }

        self.remember(ConnectionInfo {
            role: Role::Receiver,
            encoded_offer: offer_code.to_string(),
            encoded_answer: Some(code.to_string()),
        })
        .await;
        self.notify(Notice::CodeReady {
            role: Role::Receiver,
            code: code.clone(),
        });
        self.enter_connecting(attempt);
        Ok(code)
    }

    async fn open_peer(
        &mut self,
        attempt: AttemptId,
    ) -> Result<Arc<dyn PeerLink>, ControllerError> {
        let sink = EventSink::new(attempt, self.events_tx.clone());
        let peer = self.transport.open_peer(sink).await?;
        if let Some(session) = self.session.as_mut() {
            session.set_peer(Arc::clone(&peer));
        }
        Ok(peer)
    }

    /// Waits, within the discovery budget, for candidate gathering and
    /// returns the local description including whatever was found.
    async fn collect_local_descriptor(
        &self,
        peer: &Arc<dyn PeerLink>,
    ) -> Result<SessionDescriptor, ControllerError> {
        let budget = self.config.discovery_timeout;
        match timeout(budget, peer.wait_for_gathering()).await {
            Ok(()) => debug!(target: "pastelink::controller", "candidate gathering complete"),
            Err(_) => info!(
                target: "pastelink::controller",
                budget_ms = budget.as_millis() as u64,
                "candidate gathering still running; exporting what was found so far"
            ),
        }
        peer.local_descriptor()
            .await
            .ok_or_else(|| {
                TransportError::Setup("failed to obtain local description".into()).into()
            })
    }

    async fn remember(&self, info: ConnectionInfo) {
        if let Err(err) = self.store.save_connection_info(info).await {
            warn!(target: "pastelink::controller", error = %err, "failed to save connection info");
        }
    }

    fn enter_connecting(&mut self, attempt: AttemptId) {
        self.advance(Phase::Connecting);
        self.arm_watchdog(attempt);
    }

    fn advance(&mut self, next: Phase) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.advance(next) {
            Ok(previous) => {
                let role = session.role();
                info!(
                    target: "pastelink::controller",
                    attempt = %session.attempt(),
                    %role,
                    from = %previous,
                    to = %next,
                    elapsed_ms = session.elapsed().as_millis() as u64,
                    "phase changed"
                );
                self.notify(Notice::PhaseChanged { role, phase: next });
            }
            Err(err) => {
                debug!(target: "pastelink::controller", error = %err, "transition ignored");
            }
        }
    }

    /// Makes `channel` the session's channel and publishes it to senders.
    pub(crate) fn install_channel(&mut self, channel: Arc<dyn DataLink>) {
        if let Some(session) = self.session.as_mut() {
            session.set_channel(Arc::clone(&channel));
            self.channel_tx.send_replace(Some(channel));
        }
    }

    pub(crate) fn mark_open(&mut self) {
        if self.phase() == Phase::Connecting {
            self.advance(Phase::Open);
        }
    }

    pub(crate) async fn fail(&mut self, cause: FailureCause) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.advance(Phase::Failed).is_err() {
            return;
        }
        let role = session.role();
        warn!(
            target: "pastelink::controller",
            attempt = %session.attempt(),
            %role,
            ?cause,
            elapsed_ms = session.elapsed().as_millis() as u64,
            "attempt failed"
        );
        session.release().await;
        self.channel_tx.send_replace(None);
        self.notify(Notice::PhaseChanged {
            role,
            phase: Phase::Failed,
        });
        self.notify(Notice::RecoveryRequired {
            role,
            action: RecoveryAction::for_role(role),
        });
    }

    async fn close_session(&mut self) {
        self.advance(Phase::Closed);
        if let Some(session) = self.session.as_mut() {
            session.release().await;
        }
        self.channel_tx.send_replace(None);
    }

    /// Releases and forgets the current attempt.
    async fn discard_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            debug!(
                target: "pastelink::controller",
                attempt = %session.attempt(),
                phase = %session.phase(),
                "discarding attempt"
            );
            session.release().await;
            self.channel_tx.send_replace(None);
            if !session.phase().is_terminal() && session.phase() != Phase::Idle {
                self.notify(Notice::PhaseChanged {
                    role: session.role(),
                    phase: Phase::Idle,
                });
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LinkStateChanged(state) => self.on_link_state(state).await,
            TransportEvent::ChannelOpened(id) => {
                if self.is_current_channel(id) {
                    debug!(target: "pastelink::controller", channel = %id, "data channel open");
                    self.mark_open();
                }
            }
            TransportEvent::ChannelClosed(id) => {
                if self.is_current_channel(id) && self.phase() == Phase::Open {
                    info!(
                        target: "pastelink::controller",
                        channel = %id,
                        "data channel closed by peer"
                    );
                    self.close_session().await;
                }
            }
            TransportEvent::IncomingChannel(channel) => self.adopt_channel(channel).await,
            TransportEvent::Message { channel, text } => self.on_message(channel, &text).await,
        }
    }

    async fn on_link_state(&mut self, state: LinkState) {
        if let Some(peer) = self.session.as_ref().and_then(|session| session.peer()) {
            self.notify(Notice::ConnectionStatus(connection_status(
                peer.ice_state(),
                state,
            )));
        }
        if !state.is_terminal() {
            return;
        }
        match self.phase() {
            Phase::Negotiating | Phase::AwaitingRemote | Phase::Connecting => {
                self.fail(FailureCause::ConnectionLost(state)).await
            }
            Phase::Open => self.close_session().await,
            Phase::Idle | Phase::Closed | Phase::Failed => {}
        }
    }

    /// Takes over a channel the remote peer opened, unless the session
    /// already has an open one.
    async fn adopt_channel(&mut self, channel: Arc<dyn DataLink>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.phase().is_terminal() || session.channel_open() {
            debug!(
                target: "pastelink::controller",
                channel = %channel.id(),
                label = %channel.label(),
                "ignoring remote channel"
            );
            return;
        }
        if let Some(stale) = session.take_channel() {
            stale.close().await;
        }
        info!(
            target: "pastelink::controller",
            channel = %channel.id(),
            label = %channel.label(),
            "adopted data channel from peer"
        );
        let open = channel.ready_state() == ChannelState::Open;
        self.install_channel(channel);
        if open {
            self.mark_open();
        }
    }

    async fn on_message(&mut self, channel: ChannelId, text: &str) {
        let Some(role) = self.role() else {
            return;
        };
        match Message::from_wire(text) {
            Ok(Message::Credential { value }) => {
                if role != Role::Receiver {
                    warn!(
                        target: "pastelink::controller",
                        %channel,
                        "sender ignoring inbound credential"
                    );
                    return;
                }
                match self.store.save_credential(value).await {
                    Ok(()) => {
                        info!(target: "pastelink::controller", %channel, "credential received");
                        self.notify(Notice::CredentialReceived);
                    }
                    Err(err) => {
                        warn!(
                            target: "pastelink::controller",
                            error = %err,
                            "failed to store credential"
                        )
                    }
                }
            }
            Ok(Message::Unknown { kind }) => {
                warn!(
                    target: "pastelink::controller",
                    %channel,
                    %kind,
                    "dropping message of unknown kind"
                );
            }
            Err(err) => {
                warn!(
                    target: "pastelink::controller",
                    %channel,
                    error = %err,
                    "dropping undecodable message"
                );
            }
        }
    }

    fn is_current_channel(&self, id: ChannelId) -> bool {
        self.session
            .as_ref()
            .and_then(SessionState::channel)
            .is_some_and(|channel| channel.id() == id)
    }
}

fn expect_kind(
    descriptor: &SessionDescriptor,
    expected: DescriptorKind,
) -> Result<(), ControllerError> {
    if descriptor.kind == expected {
        Ok(())
    } else {
        Err(ControllerError::RemoteDescriptorRejected(format!(
            "expected an {expected} code but got an {} code",
            descriptor.kind
        )))
    }
}
