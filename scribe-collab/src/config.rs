//! Client-side collaboration settings.

use std::time::Duration;

/// Environment variable overriding [`CollabConfig::server_url`].
pub const ENV_WS_URL: &str = "SCRIBE_WS_URL";

/// Bounded reconnection with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before giving up
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for the doubled delay
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Backoff before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
        }
    }
}

/// Collaboration client configuration.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// WebSocket endpoint of the collaboration server
    pub server_url: String,
    /// Quiet interval before a burst of local edits is broadcast
    pub edit_debounce: Duration,
    /// Quiet interval before a caret move is broadcast
    pub cursor_debounce: Duration,
    /// Transport reconnection policy
    pub reconnect: ReconnectPolicy,
    /// Delay between join attempts while the transport is not connected
    pub join_retry_delay: Duration,
    /// Give up joining after this many retries (`None` = keep trying)
    pub join_retry_limit: Option<u32>,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:5000".to_string(),
            edit_debounce: Duration::from_millis(500),
            cursor_debounce: Duration::from_millis(100),
            reconnect: ReconnectPolicy::default(),
            join_retry_delay: Duration::from_millis(1000),
            join_retry_limit: None,
        }
    }
}

impl CollabConfig {
    /// Defaults, with the server url taken from `SCRIBE_WS_URL` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var(ENV_WS_URL) {
            if !url.trim().is_empty() {
                config.server_url = url.trim().to_string();
            }
        }
        config
    }

    /// Create with an explicit server url.
    pub fn with_url(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CollabConfig::default();
        assert_eq!(config.edit_debounce, Duration::from_millis(500));
        assert_eq!(config.cursor_debounce, Duration::from_millis(100));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert!(config.join_retry_limit.is_none());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(5000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(5000));
    }

    #[test]
    fn test_with_url() {
        let config = CollabConfig::with_url("ws://example.test:9000");
        assert_eq!(config.server_url, "ws://example.test:9000");
        assert_eq!(config.reconnect, ReconnectPolicy::default());
    }
}
