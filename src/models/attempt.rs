use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::channel::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Sent,
    Failed,
    NoTokens,
    NoPhone,
    OptedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub channel: Channel,
    pub message_id: String,
    pub status: AttemptStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryAttempt {
    pub fn sent(channel: Channel, message_id: String) -> Self {
        Self {
            channel,
            message_id,
            status: AttemptStatus::Sent,
            error: None,
        }
    }

    pub fn unsuccessful(channel: Channel, status: AttemptStatus, error: String) -> Self {
        Self {
            channel,
            message_id: String::new(),
            status,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalStatus {
    Delivered,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub attempts: Vec<DeliveryAttempt>,
    pub final_status: FinalStatus,
    pub notification_log_id: Option<Uuid>,
}
