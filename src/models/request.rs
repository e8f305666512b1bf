use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::models::channel::{Channel, lenient_channel};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePolicy {
    /// Lower weight is served first.
    pub weight: u8,
    pub retry_limit: u32,
    pub retry_delay: Duration,
    pub expire_in: Duration,
}

impl QueuePolicy {
    /// Exponential backoff from the base delay; `attempt` is 1-based.
    pub fn retry_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_delay.saturating_mul(1 << exponent)
    }

    /// AMQP priority, where larger values are delivered first.
    pub fn amqp_priority(&self) -> u8 {
        11u8.saturating_sub(self.weight)
    }
}

impl Priority {
    pub fn policy(&self) -> QueuePolicy {
        match self {
            Priority::High => QueuePolicy {
                weight: 1,
                retry_limit: 3,
                retry_delay: Duration::from_secs(10),
                expire_in: Duration::from_secs(300),
            },
            Priority::Normal => QueuePolicy {
                weight: 5,
                retry_limit: 3,
                retry_delay: Duration::from_secs(30),
                expire_in: Duration::from_secs(600),
            },
            Priority::Low => QueuePolicy {
                weight: 10,
                retry_limit: 3,
                retry_delay: Duration::from_secs(60),
                expire_in: Duration::from_secs(1800),
            },
        }
    }
}

/// A single delivery request as handed to the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub user_id: String,
    pub template_code: String,

    #[serde(default, deserialize_with = "lenient_channel")]
    pub preferred_channel: Option<Channel>,

    #[serde(default)]
    pub context_data: HashMap<String, String>,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub service_instance_id: Option<String>,

    #[serde(default)]
    pub event_type: Option<String>,

    #[serde(default)]
    pub batchable: bool,

    /// Set for webhook-triggered sends; checked against previously seen keys.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl NotificationRequest {
    pub fn new(user_id: impl Into<String>, template_code: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            template_code: template_code.into(),
            ..Default::default()
        }
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.preferred_channel = Some(channel);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context_data.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_service_instance(mut self, service_instance_id: impl Into<String>) -> Self {
        self.service_instance_id = Some(service_instance_id.into());
        self
    }
}
