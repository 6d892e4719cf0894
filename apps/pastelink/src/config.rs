use std::env;
use std::time::Duration;

use crate::protocol::RetryPolicy;
use crate::watchdog::DEFAULT_INTERVAL;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Pastelink runtime configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// ICE server URLs handed to the peer connection
    pub ice_servers: Vec<String>,
    /// Upper bound on the wait for candidate gathering before a code is exported
    pub discovery_timeout: Duration,
    /// Watchdog polling cadence
    pub watchdog_interval: Duration,
    /// Retry budget for in-band sends
    pub send_retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            watchdog_interval: DEFAULT_INTERVAL,
            send_retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = env::var("PASTELINK_ICE_SERVERS") {
            config.ice_servers = parse_list(&raw);
        }
        if env_truthy("PASTELINK_DISABLE_STUN").unwrap_or(false) {
            config = config.without_stun();
        }
        if let Some(timeout) = env_millis("PASTELINK_DISCOVERY_TIMEOUT_MS") {
            config.discovery_timeout = timeout;
        }
        if let Some(interval) = env_millis("PASTELINK_WATCHDOG_INTERVAL_MS") {
            config.watchdog_interval = interval;
        }
        if let Some(attempts) = env::var("PASTELINK_SEND_ATTEMPTS")
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|v| *v > 0)
        {
            config.send_retry.max_attempts = attempts;
        }
        if let Some(interval) = env_millis("PASTELINK_SEND_INTERVAL_MS") {
            config.send_retry.interval = interval;
        }
        config
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    /// Drops STUN servers, leaving host candidates (and any TURN relays).
    pub fn without_stun(mut self) -> Self {
        self.ice_servers
            .retain(|url| !url.starts_with("stun:") && !url.starts_with("stuns:"));
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    pub fn with_send_retry(mut self, policy: RetryPolicy) -> Self {
        self.send_retry = policy;
        self
    }
}

pub(crate) fn env_truthy(var: &str) -> Option<bool> {
    env::var(var)
        .map(|v| !matches!(v.trim(), "" | "0" | "false" | "no" | "off"))
        .ok()
}

fn env_millis(var: &str) -> Option<Duration> {
    env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // environment variables are process-wide
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: [&str; 6] = [
        "PASTELINK_ICE_SERVERS",
        "PASTELINK_DISABLE_STUN",
        "PASTELINK_DISCOVERY_TIMEOUT_MS",
        "PASTELINK_WATCHDOG_INTERVAL_MS",
        "PASTELINK_SEND_ATTEMPTS",
        "PASTELINK_SEND_INTERVAL_MS",
    ];

    fn clear_env() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.ice_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert_eq!(config.discovery_timeout, Duration::from_millis(5_000));
        assert_eq!(config.watchdog_interval, Duration::from_millis(1_000));
        assert_eq!(config.send_retry.max_attempts, 20);
        assert_eq!(config.send_retry.interval, Duration::from_millis(500));
    }

    #[test]
    fn test_config_from_env_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        assert_eq!(Config::from_env(), Config::default());
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var(
                "PASTELINK_ICE_SERVERS",
                "stun:stun.example.org:3478, turn:turn.example.org:3478 ,",
            );
            env::set_var("PASTELINK_DISCOVERY_TIMEOUT_MS", "2500");
            env::set_var("PASTELINK_SEND_ATTEMPTS", "5");
            env::set_var("PASTELINK_SEND_INTERVAL_MS", "not-a-number");
        }
        let config = Config::from_env();
        assert_eq!(
            config.ice_servers,
            vec![
                "stun:stun.example.org:3478".to_string(),
                "turn:turn.example.org:3478".to_string()
            ]
        );
        assert_eq!(config.discovery_timeout, Duration::from_millis(2_500));
        assert_eq!(config.send_retry.max_attempts, 5);
        assert_eq!(config.send_retry.interval, Duration::from_millis(500));

        unsafe {
            env::set_var("PASTELINK_DISABLE_STUN", "1");
        }
        let config = Config::from_env();
        assert_eq!(config.ice_servers, vec!["turn:turn.example.org:3478".to_string()]);
        clear_env();
    }

    #[test]
    fn test_without_stun_keeps_turn() {
        let config = Config::default()
            .with_ice_servers(vec![
                DEFAULT_STUN_SERVER.to_string(),
                "turns:relay.example.org:5349".to_string(),
            ])
            .without_stun();
        assert_eq!(config.ice_servers, vec!["turns:relay.example.org:5349".to_string()]);
    }
}
