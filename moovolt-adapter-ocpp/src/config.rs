//! Configuration for the charge point adapter
//!
//! Combines the station link settings with the adapter's bus participation.

use std::time::Duration;

use moovolt_core::ChargePointIdentity;

/// Complete adapter configuration
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Station this adapter drives
    pub identity: ChargePointIdentity,

    /// Station link settings
    pub connection: ConnectionConfig,

    /// Consumer group on the station's command topic
    pub group: String,

    /// Command correlation ids remembered for duplicate detection
    pub dedupe_window: usize,
}

/// Station WebSocket link configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Initial reconnect delay
    pub reconnect_delay: Duration,

    /// Maximum reconnect delay (exponential backoff cap)
    pub max_reconnect_delay: Duration,

    /// How long a command waits for the station's CALLRESULT
    pub command_timeout: Duration,

    /// Heartbeat interval handed to the station in the BootNotification response
    pub heartbeat_interval: Duration,

    /// Largest accepted WebSocket message
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            command_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(60),
            max_message_size: 64 * 1024,
        }
    }
}

impl ConnectionConfig {
    /// Set reconnect backoff bounds
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

impl AdapterConfig {
    /// Create config for one station
    pub fn new(station_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            identity: ChargePointIdentity::new(station_id, endpoint),
            connection: ConnectionConfig::default(),
            group: "adapter".to_string(),
            dedupe_window: 1024,
        }
    }

    /// Set station link settings
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Set command consumer group
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Set duplicate detection window
    pub fn with_dedupe_window(mut self, capacity: usize) -> Self {
        self.dedupe_window = capacity;
        self
    }
}
