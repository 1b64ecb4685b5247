//! Tunables for the synchronization layer.

use std::time::Duration;

use thiserror::Error;

use crate::SyncError;
use crate::fallback::DEFAULT_DEMO_PREFIX;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl From<ConfigError> for SyncError {
    fn from(err: ConfigError) -> Self {
        SyncError::Config(err.to_string())
    }
}

/// Timing and policy settings shared by the store, poller and coordinator.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Any request slower than this is treated as failed.
    pub request_timeout: Duration,
    /// Poll interval for the chat list.
    pub chats_poll_interval: Duration,
    /// Poll interval for an open conversation.
    pub messages_poll_interval: Duration,
    /// Delays after a successful write at which affected keys are
    /// invalidated again, on top of the immediate invalidation.
    pub revalidate_delays: Vec<Duration>,
    /// Instance id prefix reserved for demonstration resources.
    pub demo_prefix: String,
    /// How long an unobserved entry is kept. `None` keeps entries forever.
    pub retention: Option<Duration>,
    /// How long a notice stays visible unless dismissed.
    pub notice_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            chats_poll_interval: Duration::from_secs(10),
            messages_poll_interval: Duration::from_secs(5),
            revalidate_delays: vec![
                Duration::from_millis(300),
                Duration::from_millis(1000),
                Duration::from_millis(1500),
            ],
            demo_prefix: DEFAULT_DEMO_PREFIX.to_string(),
            retention: None,
            notice_ttl: Duration::from_secs(5),
        }
    }
}

impl SyncConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_poll_intervals(mut self, chats: Duration, messages: Duration) -> Self {
        self.chats_poll_interval = chats;
        self.messages_poll_interval = messages;
        self
    }

    pub fn with_revalidate_delays(mut self, delays: Vec<Duration>) -> Self {
        self.revalidate_delays = delays;
        self
    }

    pub fn with_demo_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.demo_prefix = prefix.into();
        self
    }

    pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_notice_ttl(mut self, ttl: Duration) -> Self {
        self.notice_ttl = ttl;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout",
                reason: "must be > 0".to_string(),
            });
        }
        if self.chats_poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "chats_poll_interval",
                reason: "must be > 0".to_string(),
            });
        }
        if self.messages_poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "messages_poll_interval",
                reason: "must be > 0".to_string(),
            });
        }
        if self.revalidate_delays.len() < 2 {
            return Err(ConfigError::InvalidValue {
                field: "revalidate_delays",
                reason: "must hold at least two delays".to_string(),
            });
        }
        if self.revalidate_delays.windows(2).any(|w| w[0] > w[1]) {
            return Err(ConfigError::InvalidValue {
                field: "revalidate_delays",
                reason: "must be in ascending order".to_string(),
            });
        }
        if self.demo_prefix.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "demo_prefix",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
