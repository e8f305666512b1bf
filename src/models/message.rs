use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::request::NotificationRequest;

/// Body published to the broker for every queued delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub request: NotificationRequest,

    /// Content key of the request, see `hash_notification`. Workers claim it
    /// while processing so identical jobs never run concurrently.
    pub idempotency_key: String,

    /// Present when the job stands for a collapsed batch; the latest payload
    /// is held under this key in the batch store.
    #[serde(default)]
    pub batch_key: Option<String>,

    #[serde(default = "first_attempt")]
    pub attempt: u32,

    pub enqueued_at: DateTime<Utc>,

    /// Set on batch jobs held back until their window closes; expiry counts
    /// from here instead of `enqueued_at`.
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
}

fn first_attempt() -> u32 {
    1
}

impl QueuedJob {
    pub fn new(request: NotificationRequest, idempotency_key: String) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            request,
            idempotency_key,
            batch_key: None,
            attempt: 1,
            enqueued_at: Utc::now(),
            not_before: None,
        }
    }

    pub fn with_batch_key(mut self, batch_key: String) -> Self {
        self.batch_key = Some(batch_key);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let expire_in = self.request.priority.policy().expire_in;
        match chrono::Duration::from_std(expire_in) {
            Ok(expire_in) => now - self.not_before.unwrap_or(self.enqueued_at) > expire_in,
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqMessage {
    pub original_job: QueuedJob,
    pub failure_reason: String,
    pub failed_at: String,
}
