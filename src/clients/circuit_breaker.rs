use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::models::{
    channel::Channel,
    circuit_breaker::{ChannelBreakerStatus, CircuitBreakerConfig, CircuitBreakerState},
};

/// Process-wide per-channel breaker. State is in memory and resets on restart.
///
/// A channel opens on the threshold-th consecutive failure. Once the recovery
/// window has elapsed exactly one `is_available` call per window is let
/// through as a trial. The failure count survives the trial, so a failing
/// trial re-opens the channel immediately and only `record_success` resets it.
/// A trial whose outcome is never recorded is replaced after another window.
pub struct CircuitBreaker {
    states: Mutex<HashMap<Channel, CircuitBreakerState>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        info!(
            failure_threshold = config.failure_threshold,
            recovery_window_ms = config.recovery_window.as_millis() as u64,
            "Circuit breaker initialized"
        );

        Self {
            states: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn is_available(&self, channel: Channel) -> bool {
        let mut states = self.states.lock();

        let Some(state) = states.get_mut(&channel) else {
            return true;
        };

        if !state.is_open {
            return true;
        }

        match state.half_open_at {
            Some(half_open_at) if Instant::now() >= half_open_at => {
                state.half_open_at = Some(Instant::now() + self.config.recovery_window);
                info!(
                    channel = %channel,
                    failures = state.failure_count,
                    "Circuit breaker half-open, allowing trial"
                );
                true
            }
            _ => false,
        }
    }

    pub fn record_success(&self, channel: Channel) {
        if let Some(previous) = self.states.lock().remove(&channel) {
            if previous.failure_count >= self.config.failure_threshold {
                info!(channel = %channel, "Circuit breaker closed after successful trial");
            }
        }
    }

    pub fn record_failure(&self, channel: Channel) {
        let now = Instant::now();
        let mut states = self.states.lock();

        let state = states.entry(channel).or_insert(CircuitBreakerState {
            failure_count: 0,
            last_failure_at: now,
            is_open: false,
            half_open_at: None,
        });

        state.failure_count += 1;
        state.last_failure_at = now;

        debug!(
            channel = %channel,
            failures = state.failure_count,
            threshold = self.config.failure_threshold,
            "Circuit breaker failure recorded"
        );

        if state.failure_count >= self.config.failure_threshold {
            state.is_open = true;
            state.half_open_at = Some(now + self.config.recovery_window);
            warn!(
                channel = %channel,
                failures = state.failure_count,
                "Circuit breaker opened"
            );
        }
    }

    /// Snapshot of every channel with recorded failures. A channel whose
    /// half-open trial is in flight still reports `is_open: true`; it flips to
    /// closed only when the trial's success is recorded.
    pub fn get_status(&self) -> HashMap<Channel, ChannelBreakerStatus> {
        self.states
            .lock()
            .iter()
            .map(|(channel, state)| {
                (
                    *channel,
                    ChannelBreakerStatus {
                        is_open: state.is_open,
                        failures: state.failure_count,
                    },
                )
            })
            .collect()
    }
}
