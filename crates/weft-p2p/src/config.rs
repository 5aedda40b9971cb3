//! Overlay configuration.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use validator::Validate;

/// Default discovery namespace.
pub const DEFAULT_NAMESPACE: &str = "weft";

/// Default protocol tag used when opening streams.
pub const DEFAULT_PROTOCOL_ID: &str = "/weft/overlay/1";

/// Default keep-alive window.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(600);

/// Default deadline extension granted by a pong.
pub const DEFAULT_PONG_GRACE: Duration = Duration::from_secs(600);

/// Default interval between idle-peer reconciliation passes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(120);

/// Default interval between discovery polls.
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);

/// Default timeout for dialing a peer.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-session outbound queue depth.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 2;

/// Default actor mailbox depth.
pub const DEFAULT_MAILBOX_SIZE: usize = 100;

/// Default number of gossip identities remembered.
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// Prefix of environment variables read by [`OverlayConfig::load`].
pub const ENV_PREFIX: &str = "WEFT";

/// Configuration for an overlay node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct OverlayConfig {
    /// Namespace advertised to and queried from discovery.
    #[validate(length(min = 1))]
    pub namespace: String,

    /// Protocol tag passed to the substrate when dialing.
    #[validate(length(min = 1))]
    pub protocol_id: String,

    /// Cap on concurrently active sessions. Zero means unlimited.
    pub max_connected_peers: usize,

    /// Keep-alive window in milliseconds. Pings go out every third of it.
    #[validate(range(min = 3))]
    pub keep_alive_ms: u64,

    /// How long a received pong keeps a session alive, in milliseconds.
    #[validate(range(min = 1))]
    pub pong_grace_ms: u64,

    /// Interval between idle-peer reconciliation passes, in milliseconds.
    #[validate(range(min = 1))]
    pub reconcile_interval_ms: u64,

    /// Interval between discovery polls, in milliseconds.
    #[validate(range(min = 1))]
    pub discovery_interval_ms: u64,

    /// Dial timeout, in milliseconds.
    #[validate(range(min = 1))]
    pub connect_timeout_ms: u64,

    /// Depth of each session's outbound queue.
    #[validate(range(min = 1))]
    pub outbound_queue: usize,

    /// Depth of the manager and router mailboxes.
    #[validate(range(min = 1))]
    pub mailbox_size: usize,

    /// Number of gossip identities the router remembers.
    #[validate(range(min = 1))]
    pub dedup_capacity: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            protocol_id: DEFAULT_PROTOCOL_ID.to_string(),
            max_connected_peers: 0,
            keep_alive_ms: millis(DEFAULT_KEEP_ALIVE),
            pong_grace_ms: millis(DEFAULT_PONG_GRACE),
            reconcile_interval_ms: millis(DEFAULT_RECONCILE_INTERVAL),
            discovery_interval_ms: millis(DEFAULT_DISCOVERY_INTERVAL),
            connect_timeout_ms: millis(DEFAULT_CONNECT_TIMEOUT),
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            mailbox_size: DEFAULT_MAILBOX_SIZE,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl OverlayConfig {
    /// Create a configuration for the given discovery namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Load configuration from an optional file and `WEFT__*` environment
    /// variables, on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        tracing::debug!(?config, "Loaded overlay configuration");
        Ok(config)
    }

    /// Set the protocol tag.
    pub fn with_protocol_id(mut self, protocol_id: impl Into<String>) -> Self {
        self.protocol_id = protocol_id.into();
        self
    }

    /// Set the connection cap (zero for unlimited).
    pub fn with_max_connected_peers(mut self, max: usize) -> Self {
        self.max_connected_peers = max;
        self
    }

    /// Set the keep-alive window.
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive_ms = millis(keep_alive);
        self
    }

    /// Set the grace period granted by a pong.
    pub fn with_pong_grace(mut self, grace: Duration) -> Self {
        self.pong_grace_ms = millis(grace);
        self
    }

    /// Set the idle reconciliation interval.
    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval_ms = millis(interval);
        self
    }

    /// Set the discovery poll interval.
    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval_ms = millis(interval);
        self
    }

    /// Set the dial timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = millis(timeout);
        self
    }

    /// Set the per-session outbound queue depth.
    pub fn with_outbound_queue(mut self, depth: usize) -> Self {
        self.outbound_queue = depth;
        self
    }

    /// Set the dedup set capacity.
    pub fn with_dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity;
        self
    }

    /// The keep-alive window.
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    /// Interval between pings: a third of the keep-alive window.
    pub fn ping_interval(&self) -> Duration {
        self.keep_alive() / 3
    }

    /// The grace period granted by a pong.
    pub fn pong_grace(&self) -> Duration {
        Duration::from_millis(self.pong_grace_ms)
    }

    /// The idle reconciliation interval.
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    /// The discovery poll interval.
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    /// The dial timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Returns true if `active` sessions leave no room for another.
    pub fn at_capacity(&self, active: usize) -> bool {
        self.max_connected_peers > 0 && active >= self.max_connected_peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = OverlayConfig::default();
        assert_eq!(config.keep_alive(), DEFAULT_KEEP_ALIVE);
        assert_eq!(config.ping_interval(), Duration::from_secs(200));
        assert_eq!(config.max_connected_peers, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = OverlayConfig::new("chat")
            .with_protocol_id("/chat/1")
            .with_max_connected_peers(4)
            .with_keep_alive(Duration::from_secs(60));

        assert_eq!(config.namespace, "chat");
        assert_eq!(config.protocol_id, "/chat/1");
        assert_eq!(config.ping_interval(), Duration::from_secs(20));
        assert!(config.at_capacity(4));
        assert!(!config.at_capacity(3));
    }

    #[test]
    fn zero_cap_is_unlimited() {
        let config = OverlayConfig::default();
        assert!(!config.at_capacity(usize::MAX));
    }

    #[test]
    fn invalid_values_fail_validation() {
        let mut config = OverlayConfig::new("");
        assert!(config.validate().is_err());

        config.namespace = "ok".into();
        config.keep_alive_ms = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "namespace: lobby\nmax_connected_peers: 8\nkeep_alive_ms: 30000").unwrap();

        let config = OverlayConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.namespace, "lobby");
        assert_eq!(config.max_connected_peers, 8);
        assert_eq!(config.keep_alive(), Duration::from_secs(30));
        assert_eq!(config.protocol_id, DEFAULT_PROTOCOL_ID);
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let config = OverlayConfig::load(None).unwrap();
        assert_eq!(config.dedup_capacity, DEFAULT_DEDUP_CAPACITY);
    }
}
