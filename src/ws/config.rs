#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::backoff::Backoff;

const DEFAULT_HANDSHAKE_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_BASE_DELAY_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_CAP_DELAY_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_TOKEN_PARAM: &str = "token";

/// Configuration for the realtime socket.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum time for TCP connect plus the WebSocket handshake
    pub handshake_timeout: Duration,
    /// Interval between PING frames. `None` disables the heartbeat
    pub heartbeat_interval: Option<Duration>,
    /// Silence tolerated after a PING before the socket is treated as dead
    pub heartbeat_timeout: Duration,
    /// Query parameter carrying the access token on the connection URL
    pub token_param: String,
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT_DURATION,
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL_DURATION),
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT_DURATION,
            token_param: DEFAULT_TOKEN_PARAM.to_owned(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Config {
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    #[must_use]
    pub fn with_heartbeat(mut self, interval: Option<Duration>, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Reconnect attempts allowed after the connection is lost, counted since the last `Open`
    pub max_attempts: u32,
    /// Delay before the first reconnect attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub cap_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY_DURATION,
            cap_delay: DEFAULT_CAP_DELAY_DURATION,
        }
    }
}

impl ReconnectConfig {
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration, cap_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            cap_delay,
        }
    }
}

impl From<ReconnectConfig> for ReconnectBackoff {
    fn from(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }
}

/// Deterministic doubling backoff: the `n`th delay (1-indexed) is
/// `min(base_delay * 2^(n-1), cap_delay)`, and there is no delay after `max_attempts`.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl ReconnectBackoff {
    /// Attempts handed out since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.config
            .base_delay
            .checked_mul(factor)
            .map_or(self.config.cap_delay, |delay| delay.min(self.config.cap_delay))
    }
}

impl Backoff for ReconnectBackoff {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.delay(self.attempt))
    }
}
