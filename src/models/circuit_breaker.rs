use serde::Serialize;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_window: Duration::from_secs(60),
        }
    }
}

/// Per-channel breaker bookkeeping. Absent state means closed.
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub failure_count: u32,
    pub last_failure_at: Instant,
    pub is_open: bool,
    pub half_open_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelBreakerStatus {
    pub is_open: bool,
    pub failures: u32,
}
