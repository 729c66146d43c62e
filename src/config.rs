//! Connection and server configuration

use crate::constants::{
    DEFAULT_AGI_PORT, DEFAULT_AMI_PORT, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_FAST_RECONNECT_ATTEMPTS,
    DEFAULT_FAST_RECONNECT_INTERVAL_MS, DEFAULT_KEEPALIVE_INTERVAL_MS, DEFAULT_LOGIN_TIMEOUT_MS,
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_POLL_INTERVAL_MS, DEFAULT_RESPONSE_TIMEOUT_MS,
    DEFAULT_SLOW_RECONNECT_INTERVAL_MS, MAX_EVENT_QUEUE_SIZE,
};
use serde::Deserialize;
use std::time::Duration;

/// How events reach general subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Handlers run on the reader task in registration order; reading pauses
    /// until they return.
    #[default]
    Sync,
    /// Each subscriber gets its own task. Per-subscriber order is kept, order
    /// across subscribers is not.
    Async,
}

/// Two-phase reconnect backoff.
///
/// The first `fast_attempts` retries use `fast_interval_ms` (the server is
/// probably restarting), later ones `slow_interval_ms`, up to `max_attempts`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Reconnect after a lost session. Never applies to the initial login.
    pub enabled: bool,
    pub fast_interval_ms: u64,
    pub fast_attempts: usize,
    pub slow_interval_ms: u64,
    /// `None` retries forever.
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            fast_interval_ms: DEFAULT_FAST_RECONNECT_INTERVAL_MS,
            fast_attempts: DEFAULT_FAST_RECONNECT_ATTEMPTS,
            slow_interval_ms: DEFAULT_SLOW_RECONNECT_INTERVAL_MS,
            max_attempts: Some(DEFAULT_MAX_RECONNECT_ATTEMPTS),
        }
    }
}

impl ReconnectPolicy {
    /// Policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before attempt number `attempt` (zero-based), or `None` once the
    /// attempts are used up.
    pub fn delay_for(&self, attempt: usize) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return None;
            }
        }
        let ms = if attempt < self.fast_attempts {
            self.fast_interval_ms
        } else {
            self.slow_interval_ms
        };
        Some(Duration::from_millis(ms))
    }
}

/// Settings for a [`ManagerConnection`](crate::ManagerConnection).
///
/// Deserializable with every field optional:
///
/// ```
/// # use asterisk_manager_tokio::ManagerConfig;
/// let config = ManagerConfig::new("pbx.example.com", "admin", "s3cret");
/// assert_eq!(config.port, 5038);
/// assert!(!format!("{:?}", config).contains("s3cret"));
/// ```
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
    /// `Events:` mask sent with the login (`on`, `off`, `call,system`, ...).
    pub events: Option<String>,
    pub connect_timeout_ms: u64,
    /// Budget for banner, challenge and login together.
    pub login_timeout_ms: u64,
    /// Timeout for [`send_action`](crate::ManagerConnection::send_action).
    pub default_response_timeout_ms: u64,
    /// Ping interval; 0 disables keepalive.
    pub keepalive_interval_ms: u64,
    pub reconnect: ReconnectPolicy,
    /// Keep retrying when a reconnect attempt fails authentication.
    pub keep_alive_after_auth_failure: bool,
    pub dispatch_mode: DispatchMode,
    /// Send events without a subscriber to the event stream.
    pub fire_unhandled_events: bool,
    /// Capacity of the event stream queue.
    pub event_queue_size: usize,
    /// Idle read wakeup, bounds how late a stop request is noticed.
    pub poll_interval_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_AMI_PORT,
            username: String::new(),
            secret: String::new(),
            events: Some("on".to_string()),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            login_timeout_ms: DEFAULT_LOGIN_TIMEOUT_MS,
            default_response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
            reconnect: ReconnectPolicy::default(),
            keep_alive_after_auth_failure: false,
            dispatch_mode: DispatchMode::Sync,
            fire_unhandled_events: true,
            event_queue_size: MAX_EVENT_QUEUE_SIZE,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl std::fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"[REDACTED]")
            .field("events", &self.events)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("login_timeout_ms", &self.login_timeout_ms)
            .field(
                "default_response_timeout_ms",
                &self.default_response_timeout_ms,
            )
            .field("keepalive_interval_ms", &self.keepalive_interval_ms)
            .field("reconnect", &self.reconnect)
            .field(
                "keep_alive_after_auth_failure",
                &self.keep_alive_after_auth_failure,
            )
            .field("dispatch_mode", &self.dispatch_mode)
            .field("fire_unhandled_events", &self.fire_unhandled_events)
            .field("event_queue_size", &self.event_queue_size)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .finish()
    }
}

impl ManagerConfig {
    /// Config for `host` on the default port.
    pub fn new(host: impl Into<String>, username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            secret: secret.into(),
            ..Self::default()
        }
    }

    /// Override the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the reconnect policy.
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Override the keepalive interval (0 disables).
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Override the dispatch mode.
    pub fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub(crate) fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    pub(crate) fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.default_response_timeout_ms)
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.poll_interval_ms
                .max(1),
        )
    }

    pub(crate) fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_ms > 0).then(|| Duration::from_millis(self.keepalive_interval_ms))
    }
}

/// Settings for an [`AgiServer`](crate::agi::AgiServer).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AgiServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Concurrent sessions; further connections wait for a free slot.
    pub max_connections: usize,
}

impl Default for AgiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_AGI_PORT,
            max_connections: 64,
        }
    }
}
