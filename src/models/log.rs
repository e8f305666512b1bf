use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{channel::Channel, status::LogStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationLog {
    pub id: Uuid,
    pub user_id: String,
    pub template_code: String,
    pub channel: Option<Channel>,
    pub status: LogStatus,
    pub context_data_hash: String,
    pub external_message_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub service_instance_id: Option<String>,
    pub event_type: Option<String>,
    pub failure_reason: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateNotificationLog {
    pub user_id: String,
    pub template_code: String,
    pub channel: Option<Channel>,
    pub status: LogStatus,
    pub context_data_hash: String,
    pub external_message_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub service_instance_id: Option<String>,
    pub event_type: Option<String>,
    pub failure_reason: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl CreateNotificationLog {
    pub fn new(
        user_id: String,
        template_code: String,
        channel: Option<Channel>,
        status: LogStatus,
        context_data_hash: String,
    ) -> Self {
        Self {
            user_id,
            template_code,
            channel,
            status,
            context_data_hash,
            external_message_id: None,
            idempotency_key: None,
            service_instance_id: None,
            event_type: None,
            failure_reason: None,
            retry_count: 0,
            created_at: Utc::now(),
            sent_at: None,
            failed_at: None,
        }
    }

    pub fn with_external_message_id(mut self, message_id: String) -> Self {
        if !message_id.is_empty() {
            self.external_message_id = Some(message_id);
        }
        self
    }

    pub fn with_correlation(
        mut self,
        service_instance_id: Option<String>,
        event_type: Option<String>,
        idempotency_key: Option<String>,
    ) -> Self {
        self.service_instance_id = service_instance_id;
        self.event_type = event_type;
        self.idempotency_key = idempotency_key;
        self
    }

    pub fn with_failure(mut self, reason: String) -> Self {
        self.failure_reason = Some(reason);
        self
    }

    pub fn with_retry_count(mut self, retry_count: i32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_timestamps(
        mut self,
        created_at: DateTime<Utc>,
        sent_at: Option<DateTime<Utc>>,
        failed_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_at = created_at;
        self.sent_at = sent_at;
        self.failed_at = failed_at;
        self
    }

    pub fn into_log(self, id: Uuid) -> NotificationLog {
        NotificationLog {
            id,
            user_id: self.user_id,
            template_code: self.template_code,
            channel: self.channel,
            status: self.status,
            context_data_hash: self.context_data_hash,
            external_message_id: self.external_message_id,
            idempotency_key: self.idempotency_key,
            service_instance_id: self.service_instance_id,
            event_type: self.event_type,
            failure_reason: self.failure_reason,
            retry_count: self.retry_count,
            created_at: self.created_at,
            sent_at: self.sent_at,
            delivered_at: None,
            read_at: None,
            failed_at: self.failed_at,
        }
    }
}

/// Recovery record written when the whole channel chain is exhausted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedNotification {
    pub id: Uuid,
    pub notification_log_id: Option<Uuid>,
    pub user_id: String,
    pub template_code: String,
    pub channel: Option<Channel>,
    pub context_data: HashMap<String, String>,
    pub service_instance_id: Option<String>,
    pub event_type: Option<String>,
    pub failure_reason: String,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateFailedNotification {
    pub notification_log_id: Option<Uuid>,
    pub user_id: String,
    pub template_code: String,
    pub channel: Option<Channel>,
    pub context_data: HashMap<String, String>,
    pub service_instance_id: Option<String>,
    pub event_type: Option<String>,
    pub failure_reason: String,
    pub retry_count: i32,
}

impl CreateFailedNotification {
    pub fn into_failed(self, id: Uuid) -> FailedNotification {
        FailedNotification {
            id,
            notification_log_id: self.notification_log_id,
            user_id: self.user_id,
            template_code: self.template_code,
            channel: self.channel,
            context_data: self.context_data,
            service_instance_id: self.service_instance_id,
            event_type: self.event_type,
            failure_reason: self.failure_reason,
            retry_count: self.retry_count,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}

/// Lookup key for a previously delivered identical notification.
#[derive(Debug, Clone)]
pub struct DuplicateQuery {
    pub user_id: String,
    pub template_code: String,
    pub service_instance_id: Option<String>,
    pub context_data_hash: String,
    pub since: DateTime<Utc>,
}

/// A provider receipt applied to the log row owning `external_message_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub external_message_id: String,
    pub status: LogStatus,
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub failure_reason: Option<String>,
}
