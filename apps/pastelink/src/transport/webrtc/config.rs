use std::time::Duration;

use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::config::Config;

/// Configuration for the WebRTC transport
#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    /// ICE servers for connection establishment
    pub ice_servers: Vec<RTCIceServer>,
    /// Whether data channels deliver in order
    pub ordered: bool,
    /// Maximum number of retransmissions; `None` keeps channels reliable
    pub max_retransmits: Option<u16>,
    pub ice_disconnected_timeout: Duration,
    pub ice_failed_timeout: Duration,
    pub ice_keepalive_interval: Duration,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl WebRtcConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ordered: true,
            max_retransmits: None,
            ice_disconnected_timeout: Duration::from_secs(5),
            ice_failed_timeout: Duration::from_secs(25),
            ice_keepalive_interval: Duration::from_secs(2),
        }
    }

    /// Host candidates only (no STUN/TURN)
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Self::default()
        }
    }
}
