//! In-memory transport. Peers that exchange descriptors through a shared
//! [`MockNetwork`] connect to each other and deliver channel traffic without
//! touching the OS network stack, which keeps controller tests deterministic.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    ChannelId, ChannelState, DataLink, EventSink, IceState, LinkState, PeerLink, Transport,
    TransportError, TransportEvent, next_channel_id,
};
use crate::codec::{DescriptorKind, SessionDescriptor};

const TOKEN_PREFIX: &str = "mock-peer:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOpening {
    Always,
    Never,
    /// The first channel created on the network stalls; later ones open.
    AfterFirst,
}

#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub connects: bool,
    pub channel_opening: ChannelOpening,
    /// Whether an opened channel is announced to the remote peer.
    pub announce_channels: bool,
    pub gathering_completes: bool,
    pub accept_remote: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            connects: true,
            channel_opening: ChannelOpening::Always,
            announce_channels: true,
            gathering_completes: true,
            accept_remote: true,
        }
    }
}

struct NetworkState {
    behavior: MockBehavior,
    peers: HashMap<u64, Weak<MockPeer>>,
    next_peer: u64,
    channels_created: usize,
}

pub struct MockNetwork {
    state: Mutex<NetworkState>,
}

impl MockNetwork {
    pub fn new(behavior: MockBehavior) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NetworkState {
                behavior,
                peers: HashMap::new(),
                next_peer: 1,
                channels_created: 0,
            }),
        })
    }

    pub fn transport(self: &Arc<Self>) -> MockTransport {
        MockTransport {
            network: Arc::clone(self),
        }
    }

    pub fn behavior(&self) -> MockBehavior {
        self.state.lock().behavior.clone()
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        self.state.lock().behavior = behavior;
    }

    /// Channels created through `create_channel`; channels announced by a
    /// remote peer are not counted.
    pub fn channels_created(&self) -> usize {
        self.state.lock().channels_created
    }

    /// Reports a failed connection on every live peer.
    pub fn fail_links(&self) {
        for peer in self.live_peers() {
            peer.set_link(LinkState::Failed);
        }
    }

    fn live_peers(&self) -> Vec<Arc<MockPeer>> {
        self.state
            .lock()
            .peers
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn peer(&self, id: u64) -> Option<Arc<MockPeer>> {
        self.state.lock().peers.get(&id).and_then(Weak::upgrade)
    }

    fn next_ordinal(&self) -> usize {
        let mut state = self.state.lock();
        state.channels_created += 1;
        state.channels_created
    }

    fn try_connect(&self, a: u64, b: u64) {
        let (Some(first), Some(second)) = (self.peer(a), self.peer(b)) else {
            return;
        };
        if !(first.negotiated_with(b) && second.negotiated_with(a)) {
            return;
        }
        if !self.behavior().connects {
            first.set_link(LinkState::Connecting);
            second.set_link(LinkState::Connecting);
            return;
        }
        first.set_link(LinkState::Connected);
        second.set_link(LinkState::Connected);
        for owner in [&first, &second] {
            for channel in owner.channels() {
                self.activate_channel(owner, &channel);
            }
        }
    }

    fn activate_channel(&self, owner: &MockPeer, channel: &Arc<MockChannel>) {
        let behavior = self.behavior();
        let opens = match behavior.channel_opening {
            ChannelOpening::Always => true,
            ChannelOpening::Never => false,
            ChannelOpening::AfterFirst => channel.ordinal > 1,
        };
        if !opens || channel.ready_state() != ChannelState::Connecting {
            return;
        }
        channel.set_state(ChannelState::Open);
        owner.events.emit(TransportEvent::ChannelOpened(channel.id));

        if !behavior.announce_channels {
            return;
        }
        let Some(remote) = owner.remote_peer().and_then(|id| self.peer(id)) else {
            return;
        };
        let mirror = MockChannel::new(&channel.label, remote.events.clone(), 0);
        mirror.set_state(ChannelState::Open);
        MockChannel::pair(channel, &mirror);
        remote.state.lock().channels.push(Arc::clone(&mirror));
        remote
            .events
            .emit(TransportEvent::IncomingChannel(mirror.clone()));
        remote.events.emit(TransportEvent::ChannelOpened(mirror.id));
    }
}

pub struct MockTransport {
    network: Arc<MockNetwork>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_peer(&self, events: EventSink) -> Result<Arc<dyn PeerLink>, TransportError> {
        let peer = {
            let mut state = self.network.state.lock();
            let id = state.next_peer;
            state.next_peer += 1;
            let peer = Arc::new(MockPeer {
                id,
                network: Arc::clone(&self.network),
                events,
                state: Mutex::new(PeerState {
                    local: None,
                    remote_peer: None,
                    link: LinkState::New,
                    channels: Vec::new(),
                    closed: false,
                }),
            });
            state.peers.insert(id, Arc::downgrade(&peer));
            peer
        };
        Ok(peer)
    }
}

struct PeerState {
    local: Option<SessionDescriptor>,
    remote_peer: Option<u64>,
    link: LinkState,
    channels: Vec<Arc<MockChannel>>,
    closed: bool,
}

pub struct MockPeer {
    id: u64,
    network: Arc<MockNetwork>,
    events: EventSink,
    state: Mutex<PeerState>,
}

impl MockPeer {
    fn token(&self) -> String {
        format!("{TOKEN_PREFIX}{}", self.id)
    }

    fn negotiated_with(&self, other: u64) -> bool {
        let state = self.state.lock();
        !state.closed && state.local.is_some() && state.remote_peer == Some(other)
    }

    fn remote_peer(&self) -> Option<u64> {
        self.state.lock().remote_peer
    }

    fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.state.lock().channels.clone()
    }

    fn set_link(&self, link: LinkState) {
        {
            let mut state = self.state.lock();
            if state.closed || state.link == link {
                return;
            }
            state.link = link;
        }
        self.events.emit(TransportEvent::LinkStateChanged(link));
    }

    fn set_local(&self, kind: DescriptorKind) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Setup("peer connection is closed".into()));
        }
        if kind == DescriptorKind::Answer && state.remote_peer.is_none() {
            return Err(TransportError::Setup("no remote offer to answer".into()));
        }
        state.local = Some(SessionDescriptor {
            kind,
            body: self.token(),
        });
        Ok(())
    }
}

#[async_trait]
impl PeerLink for MockPeer {
    async fn create_offer(&self) -> Result<(), TransportError> {
        self.set_local(DescriptorKind::Offer)
    }

    async fn create_answer(&self) -> Result<(), TransportError> {
        self.set_local(DescriptorKind::Answer)
    }

    async fn apply_remote(&self, descriptor: &SessionDescriptor) -> Result<(), TransportError> {
        if !self.network.behavior().accept_remote {
            return Err(TransportError::Setup(
                "remote description rejected".into(),
            ));
        }
        let remote = descriptor
            .body
            .trim()
            .strip_prefix(TOKEN_PREFIX)
            .and_then(|id| id.parse::<u64>().ok())
            .ok_or_else(|| TransportError::Setup("unrecognised session description".into()))?;
        {
            let mut state = self.state.lock();
            let local = state.local.as_ref().map(|local| local.kind);
            match (local, descriptor.kind) {
                (None, DescriptorKind::Offer)
                | (Some(DescriptorKind::Offer), DescriptorKind::Answer) => {}
                _ => {
                    return Err(TransportError::Setup(format!(
                        "cannot apply remote {} in the current signaling state",
                        descriptor.kind
                    )));
                }
            }
            state.remote_peer = Some(remote);
        }
        self.network.try_connect(self.id, remote);
        Ok(())
    }

    async fn wait_for_gathering(&self) {
        if !self.network.behavior().gathering_completes {
            std::future::pending::<()>().await;
        }
    }

    async fn local_descriptor(&self) -> Option<SessionDescriptor> {
        self.state.lock().local.clone()
    }

    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataLink>, TransportError> {
        let ordinal = self.network.next_ordinal();
        let channel = MockChannel::new(label, self.events.clone(), ordinal);
        let connected = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::Setup("peer connection is closed".into()));
            }
            state.channels.push(Arc::clone(&channel));
            state.link == LinkState::Connected
        };
        if connected {
            self.network.activate_channel(self, &channel);
        }
        Ok(channel)
    }

    fn link_state(&self) -> LinkState {
        self.state.lock().link
    }

    fn ice_state(&self) -> IceState {
        match self.link_state() {
            LinkState::New => IceState::New,
            LinkState::Connecting => IceState::Checking,
            LinkState::Connected => IceState::Connected,
            LinkState::Disconnected => IceState::Disconnected,
            LinkState::Failed => IceState::Failed,
            LinkState::Closed => IceState::Closed,
        }
    }

    async fn close(&self) {
        let channels = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.link = LinkState::Closed;
            std::mem::take(&mut state.channels)
        };
        for channel in channels {
            channel.close().await;
        }
        self.events
            .emit(TransportEvent::LinkStateChanged(LinkState::Closed));
    }
}

pub struct MockChannel {
    id: ChannelId,
    label: String,
    ordinal: usize,
    events: EventSink,
    state: Mutex<ChannelState>,
    other_end: Mutex<Weak<MockChannel>>,
    sent: Mutex<Vec<String>>,
}

impl MockChannel {
    fn new(label: &str, events: EventSink, ordinal: usize) -> Arc<Self> {
        Arc::new(Self {
            id: next_channel_id(),
            label: label.to_string(),
            ordinal,
            events,
            state: Mutex::new(ChannelState::Connecting),
            other_end: Mutex::new(Weak::new()),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// A channel attached to no peer, for exercising senders directly.
    pub fn detached(label: &str, state: ChannelState) -> Arc<Self> {
        let channel = Self::new(label, EventSink::detached(), 0);
        channel.set_state(state);
        channel
    }

    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    fn pair(a: &Arc<MockChannel>, b: &Arc<MockChannel>) {
        *a.other_end.lock() = Arc::downgrade(b);
        *b.other_end.lock() = Arc::downgrade(a);
    }

    fn mark_closed(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ChannelState::Closed {
            return false;
        }
        *state = ChannelState::Closed;
        true
    }
}

#[async_trait]
impl DataLink for MockChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn ready_state(&self) -> ChannelState {
        *self.state.lock()
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if self.ready_state() != ChannelState::Open {
            return Err(TransportError::ChannelClosed);
        }
        self.sent.lock().push(text.to_string());
        let other = self.other_end.lock().upgrade();
        if let Some(other) = other {
            other.events.emit(TransportEvent::Message {
                channel: other.id,
                text: text.to_string(),
            });
        }
        Ok(())
    }

    async fn close(&self) {
        if !self.mark_closed() {
            return;
        }
        self.events.emit(TransportEvent::ChannelClosed(self.id));
        let other = std::mem::take(&mut *self.other_end.lock()).upgrade();
        if let Some(other) = other {
            if other.mark_closed() {
                other.events.emit(TransportEvent::ChannelClosed(other.id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{AttemptId, SessionEvent};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn drain(rx: &mut UnboundedReceiver<SessionEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(SessionEvent::Transport { event, .. }) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn negotiated_pair(
        network: &Arc<MockNetwork>,
    ) -> (
        Arc<dyn PeerLink>,
        UnboundedReceiver<SessionEvent>,
        Arc<dyn PeerLink>,
        UnboundedReceiver<SessionEvent>,
    ) {
        let transport = network.transport();
        let (offer_sink, offer_rx) = EventSink::channel(AttemptId(1));
        let (answer_sink, answer_rx) = EventSink::channel(AttemptId(2));
        let offerer = transport.open_peer(offer_sink).await.unwrap();
        let answerer = transport.open_peer(answer_sink).await.unwrap();

        offerer.create_offer().await.unwrap();
        let offer = offerer.local_descriptor().await.unwrap();
        answerer.apply_remote(&offer).await.unwrap();
        answerer.create_answer().await.unwrap();
        let answer = answerer.local_descriptor().await.unwrap();
        offerer.apply_remote(&answer).await.unwrap();
        (offerer, offer_rx, answerer, answer_rx)
    }

    #[tokio::test]
    async fn negotiated_peers_connect_and_exchange_text() {
        let network = MockNetwork::new(MockBehavior::default());
        let (offerer, _offer_rx, answerer, mut answer_rx) = negotiated_pair(&network).await;
        assert!(offerer.is_connected());
        assert!(answerer.is_connected());

        let channel = offerer.create_channel("probe").await.unwrap();
        assert_eq!(channel.ready_state(), ChannelState::Open);

        let events = drain(&mut answer_rx);
        let mirror = events
            .iter()
            .find_map(|event| match event {
                TransportEvent::IncomingChannel(channel) => Some(channel.clone()),
                _ => None,
            })
            .expect("remote end announced");
        assert_eq!(mirror.label(), "probe");

        channel.send_text("ping").await.unwrap();
        let events = drain(&mut answer_rx);
        assert!(events.iter().any(|event| matches!(
            event,
            TransportEvent::Message { channel, text } if *channel == mirror.id() && text == "ping"
        )));
    }

    #[tokio::test]
    async fn stalled_channels_stay_connecting() {
        let network = MockNetwork::new(MockBehavior {
            channel_opening: ChannelOpening::Never,
            ..MockBehavior::default()
        });
        let (offerer, _offer_rx, _answerer, _answer_rx) = negotiated_pair(&network).await;
        let channel = offerer.create_channel("probe").await.unwrap();
        assert_eq!(channel.ready_state(), ChannelState::Connecting);
        assert!(matches!(
            channel.send_text("ping").await,
            Err(TransportError::ChannelClosed)
        ));
        assert_eq!(network.channels_created(), 1);
    }

    #[tokio::test]
    async fn closing_twice_is_a_no_op() {
        let network = MockNetwork::new(MockBehavior::default());
        let (offerer, mut offer_rx, answerer, _answer_rx) = negotiated_pair(&network).await;
        let channel = offerer.create_channel("probe").await.unwrap();
        drain(&mut offer_rx);

        channel.close().await;
        channel.close().await;
        offerer.close().await;
        offerer.close().await;
        answerer.close().await;

        let closes = drain(&mut offer_rx)
            .into_iter()
            .filter(|event| matches!(event, TransportEvent::ChannelClosed(_)))
            .count();
        assert_eq!(closes, 1);
        assert_eq!(offerer.link_state(), LinkState::Closed);
    }
}
