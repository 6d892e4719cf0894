//! webrtc-rs binding for [`Transport`], [`PeerLink`] and [`DataLink`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

use super::{
    ChannelId, ChannelState, DataLink, EventSink, IceState, LinkState, PeerLink, Transport,
    TransportError, TransportEvent, next_channel_id, to_setup_error,
};
use crate::codec::{DescriptorKind, SessionDescriptor};

pub mod config;

pub use config::WebRtcConfig;

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn setting_engine(config: &WebRtcConfig) -> SettingEngine {
    let mut setting = SettingEngine::default();
    setting.set_ice_timeouts(
        Some(config.ice_disconnected_timeout),
        Some(config.ice_failed_timeout),
        Some(config.ice_keepalive_interval),
    );
    setting
}

pub struct WebRtcTransport {
    api: API,
    config: WebRtcConfig,
    router: Option<Arc<AsyncMutex<Router>>>,
}

impl WebRtcTransport {
    pub fn new(config: WebRtcConfig) -> Result<Self, TransportError> {
        let setting = setting_engine(&config);
        Self::with_setting_engine(config, setting)
    }

    pub fn with_setting_engine(
        config: WebRtcConfig,
        setting: SettingEngine,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            api: build_api(setting)?,
            config,
            router: None,
        })
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.config.ice_servers.clone(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn open_peer(&self, events: EventSink) -> Result<Arc<dyn PeerLink>, TransportError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_configuration())
                .await
                .map_err(to_setup_error)?,
        );
        tracing::debug!(
            target: "pastelink::transport::webrtc",
            attempt = %events.attempt(),
            ice_servers = self.config.ice_servers.len(),
            "peer connection created"
        );

        let link_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = link_events.clone();
            Box::pin(async move {
                tracing::debug!(
                    target: "pastelink::transport::webrtc",
                    ?state,
                    "peer connection state changed"
                );
                events.emit(TransportEvent::LinkStateChanged(link_state(state)));
            })
        }));

        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            Box::pin(async move {
                tracing::debug!(
                    target: "pastelink::transport::webrtc",
                    ?state,
                    "ice connection state changed"
                );
            })
        }));

        let incoming_events = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = incoming_events.clone();
            Box::pin(async move {
                let channel = WebRtcChannel::bind(dc, events.clone());
                tracing::debug!(
                    target: "pastelink::transport::webrtc",
                    channel = %channel.id(),
                    label = %channel.label(),
                    "remote data channel announced"
                );
                events.emit(TransportEvent::IncomingChannel(channel));
            })
        }));

        Ok(Arc::new(WebRtcPeer {
            pc,
            events,
            ordered: self.config.ordered,
            max_retransmits: self.config.max_retransmits,
            gathering: Mutex::new(None),
            closed: AtomicBool::new(false),
            _router: self.router.clone(),
        }))
    }
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    events: EventSink,
    ordered: bool,
    max_retransmits: Option<u16>,
    gathering: Mutex<Option<mpsc::Receiver<()>>>,
    closed: AtomicBool,
    _router: Option<Arc<AsyncMutex<Router>>>,
}

impl WebRtcPeer {
    async fn install_local(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), TransportError> {
        // the promise has to exist before gathering starts
        let gather = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_setup_error)?;
        *self.gathering.lock() = Some(gather);
        Ok(())
    }
}

#[async_trait]
impl PeerLink for WebRtcPeer {
    async fn create_offer(&self) -> Result<(), TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(to_setup_error)?;
        self.install_local(offer).await
    }

    async fn create_answer(&self) -> Result<(), TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(to_setup_error)?;
        self.install_local(answer).await
    }

    async fn apply_remote(&self, descriptor: &SessionDescriptor) -> Result<(), TransportError> {
        let description = session_description_from(descriptor)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_setup_error)
    }

    async fn wait_for_gathering(&self) {
        let gather = self.gathering.lock().take();
        if let Some(mut gather) = gather {
            let _ = gather.recv().await;
            tracing::trace!(target: "pastelink::transport::webrtc", "ice gathering complete");
        }
    }

    async fn local_descriptor(&self) -> Option<SessionDescriptor> {
        let description = self.pc.local_description().await?;
        descriptor_from(&description)
    }

    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataLink>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(self.ordered),
            max_retransmits: self.max_retransmits,
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_setup_error)?;
        Ok(WebRtcChannel::bind(dc, self.events.clone()))
    }

    fn link_state(&self) -> LinkState {
        link_state(self.pc.connection_state())
    }

    fn ice_state(&self) -> IceState {
        ice_state(self.pc.ice_connection_state())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(
                target: "pastelink::transport::webrtc",
                error = %err,
                "peer connection close failed"
            );
        }
    }
}

pub struct WebRtcChannel {
    id: ChannelId,
    dc: Arc<RTCDataChannel>,
}

impl WebRtcChannel {
    /// Wraps `dc` and forwards its open, close and message callbacks to
    /// `events`.
    pub fn bind(dc: Arc<RTCDataChannel>, events: EventSink) -> Arc<Self> {
        let id = next_channel_id();

        let open_events = events.clone();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                tracing::debug!(
                    target: "pastelink::transport::webrtc",
                    channel = %id,
                    "data channel opened"
                );
                open_events.emit(TransportEvent::ChannelOpened(id));
            })
        }));

        let close_events = events.clone();
        dc.on_close(Box::new(move || {
            let events = close_events.clone();
            Box::pin(async move {
                tracing::debug!(
                    target: "pastelink::transport::webrtc",
                    channel = %id,
                    "data channel closed"
                );
                events.emit(TransportEvent::ChannelClosed(id));
            })
        }));

        dc.on_error(Box::new(move |err: webrtc::Error| {
            Box::pin(async move {
                tracing::warn!(
                    target: "pastelink::transport::webrtc",
                    channel = %id,
                    error = %err,
                    "data channel error"
                );
            })
        }));

        let message_events = events;
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = message_events.clone();
            Box::pin(async move {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => events.emit(TransportEvent::Message { channel: id, text }),
                    Err(_) => tracing::warn!(
                        target: "pastelink::transport::webrtc",
                        channel = %id,
                        frame_len = msg.data.len(),
                        "dropping non-text frame"
                    ),
                }
            })
        }));

        Arc::new(Self { id, dc })
    }
}

#[async_trait]
impl DataLink for WebRtcChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn ready_state(&self) -> ChannelState {
        channel_state(self.dc.ready_state())
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.dc
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|err| TransportError::Send(err.to_string()))
    }

    async fn close(&self) {
        if matches!(
            self.dc.ready_state(),
            RTCDataChannelState::Closing | RTCDataChannelState::Closed
        ) {
            return;
        }
        if let Err(err) = self.dc.close().await {
            tracing::debug!(
                target: "pastelink::transport::webrtc",
                channel = %self.id,
                error = %err,
                "data channel close failed"
            );
        }
    }
}

fn link_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
    }
}

fn ice_state(state: RTCIceConnectionState) -> IceState {
    match state {
        RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => IceState::New,
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
    }
}

fn channel_state(state: RTCDataChannelState) -> ChannelState {
    match state {
        RTCDataChannelState::Connecting => ChannelState::Connecting,
        RTCDataChannelState::Open => ChannelState::Open,
        RTCDataChannelState::Closing => ChannelState::Closing,
        RTCDataChannelState::Closed => ChannelState::Closed,
        RTCDataChannelState::Unspecified => ChannelState::Unknown,
    }
}

fn descriptor_from(description: &RTCSessionDescription) -> Option<SessionDescriptor> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => DescriptorKind::Offer,
        RTCSdpType::Answer => DescriptorKind::Answer,
        _ => return None,
    };
    Some(SessionDescriptor {
        kind,
        body: description.sdp.clone(),
    })
}

fn session_description_from(
    descriptor: &SessionDescriptor,
) -> Result<RTCSessionDescription, TransportError> {
    let sdp = descriptor.body.clone();
    match descriptor.kind {
        DescriptorKind::Offer => RTCSessionDescription::offer(sdp),
        DescriptorKind::Answer => RTCSessionDescription::answer(sdp),
    }
    .map_err(to_setup_error)
}

async fn attach_vnet_to_router(
    vnet: &Arc<Net>,
    router: &Arc<AsyncMutex<Router>>,
) -> Result<(), TransportError> {
    let nic = vnet.get_nic().map_err(to_setup_error)?;
    {
        let mut router_guard = router.lock().await;
        router_guard
            .add_net(Arc::clone(&nic))
            .await
            .map_err(to_setup_error)?;
    }
    let nic_guard = nic.lock().await;
    nic_guard
        .set_router(Arc::clone(router))
        .await
        .map_err(to_setup_error)
}

fn virtual_transport(
    vnet: Arc<Net>,
    router: &Arc<AsyncMutex<Router>>,
) -> Result<WebRtcTransport, TransportError> {
    let mut setting = SettingEngine::default();
    setting.set_vnet(Some(vnet));
    setting.set_ice_timeouts(
        Some(Duration::from_secs(1)),
        Some(Duration::from_secs(1)),
        Some(Duration::from_millis(200)),
    );
    let mut transport = WebRtcTransport::with_setting_engine(WebRtcConfig::localhost(), setting)?;
    transport.router = Some(Arc::clone(router));
    Ok(transport)
}

/// Two transports joined by an in-process virtual network, so the real
/// stack can be exercised without OS networking.
pub async fn virtual_pair() -> Result<(WebRtcTransport, WebRtcTransport), TransportError> {
    let wan = Arc::new(AsyncMutex::new(
        Router::new(RouterConfig {
            cidr: "10.0.0.0/24".to_owned(),
            ..Default::default()
        })
        .map_err(to_setup_error)?,
    ));

    let offer_vnet = Arc::new(Net::new(Some(NetConfig {
        static_ips: vec!["10.0.0.2".to_owned()],
        ..Default::default()
    })));
    attach_vnet_to_router(&offer_vnet, &wan).await?;

    let answer_vnet = Arc::new(Net::new(Some(NetConfig {
        static_ips: vec!["10.0.0.3".to_owned()],
        ..Default::default()
    })));
    attach_vnet_to_router(&answer_vnet, &wan).await?;

    {
        let mut router = wan.lock().await;
        router.start().await.map_err(to_setup_error)?;
    }

    Ok((
        virtual_transport(offer_vnet, &wan)?,
        virtual_transport(answer_vnet, &wan)?,
    ))
}
