//! Explicit configuration structs.
//!
//! The teacher builds its collaborators from bare constructor arguments
//! (`CollaborationManager::new(url, user_id, user_name)`). Per the source's
//! own "Design Notes" (spec.md §9: replace property-bag arguments with
//! explicit configuration structs), this crate groups the rate limiter,
//! reconnect supervisor, and undo stack's knobs into named structs, plus a
//! top-level `SessionConfig` that aggregates them with the operation timeout
//! from spec.md §5.

use std::time::Duration;

/// Token-bucket-ish rate limiting for outgoing operations (spec.md §4.3.3).
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Minimum gap between successive outgoing operations.
    pub min_interval: Duration,
    /// Maximum operations admitted within `burst_window`.
    pub max_burst: usize,
    /// Sliding window over which `max_burst` is measured.
    pub burst_window: Duration,
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(0),
            max_burst: usize::MAX,
            burst_window: Duration::from_secs(1),
            enabled: false,
        }
    }
}

/// Exponential backoff for the reconnect supervisor (spec.md §4.3.6).
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub enabled: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            enabled: true,
        }
    }
}

impl ReconnectConfig {
    /// `delay = min(max_delay, initial_delay * backoff_factor^attempts)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Undo/redo grouping and capacity (spec.md §3 "Undo/redo stacks", §4.3.5).
#[derive(Debug, Clone)]
pub struct UndoConfig {
    pub max_size: usize,
    pub group_interval: Duration,
    pub enabled: bool,
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            group_interval: Duration::from_millis(1000),
            enabled: true,
        }
    }
}

/// Aggregate configuration for a `SessionClient`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub rate_limit: RateLimitConfig,
    pub reconnect: ReconnectConfig,
    pub undo: UndoConfig,
    /// How long to wait for an ack before firing `OperationTimeout`
    /// (spec.md §5, default 5s).
    pub operation_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            reconnect: ReconnectConfig::default(),
            undo: UndoConfig::default(),
            operation_timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl SessionConfig {
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }
}
