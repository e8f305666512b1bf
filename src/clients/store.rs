use std::{collections::HashSet, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    channel::Channel,
    log::{
        CreateFailedNotification, CreateNotificationLog, DuplicateQuery, FailedNotification,
        NotificationLog, StatusUpdate,
    },
    message::{DlqMessage, QueuedJob},
    request::QueuePolicy,
};

/// Durable notification history: the log and the failed-notification table.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert_log(&self, log: CreateNotificationLog) -> Result<Uuid>;

    async fn insert_failed(&self, failed: CreateFailedNotification) -> Result<Uuid>;

    /// True when a successful row matching the query exists since `query.since`.
    async fn find_recent_success(&self, query: &DuplicateQuery) -> Result<bool>;

    /// True when a successful row carries `key` as its external message id
    /// or idempotency key and was created since `since`.
    async fn find_recent_message_key(&self, key: &str, since: DateTime<Utc>) -> Result<bool>;

    /// Applies the update if the row is in one of `update.status.predecessors()`.
    /// Returns whether a row changed.
    async fn update_status(&self, update: &StatusUpdate) -> Result<bool>;

    async fn logs_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<NotificationLog>>;

    async fn get_failed(&self, id: Uuid) -> Result<Option<FailedNotification>>;

    async fn list_unresolved_failed(&self, limit: i64) -> Result<Vec<FailedNotification>>;

    async fn resolve_failed(&self, id: Uuid, resolved_at: DateTime<Utc>) -> Result<bool>;

    async fn health_check(&self) -> Result<()>;
}

/// Stored user preferences behind the preference gate.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// Channels the user has hard-opted-out of.
    async fn channel_opt_outs(&self, user_id: &str) -> Result<HashSet<Channel>>;

    /// `None` when the user has no record for this category and channel.
    async fn category_enabled(
        &self,
        user_id: &str,
        category: &str,
        channel: Channel,
    ) -> Result<Option<bool>>;

    async fn set_channel_opt_out(&self, user_id: &str, channel: Channel, opted_out: bool)
    -> Result<()>;
}

/// Where adapters find recipient addresses.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn device_tokens(&self, user_id: &str) -> Result<Vec<String>>;

    async fn invalidate_device_tokens(&self, user_id: &str, tokens: &[String]) -> Result<()>;

    async fn phone_number(&self, user_id: &str) -> Result<Option<String>>;
}

/// Durable job broker the queue front-end publishes to.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn publish(&self, job: &QueuedJob, policy: &QueuePolicy) -> Result<()>;

    /// Publishes a job that becomes visible to workers after `delay`.
    async fn publish_delayed(&self, job: &QueuedJob, policy: &QueuePolicy, delay: Duration)
    -> Result<()>;

    async fn publish_dead_letter(&self, message: &DlqMessage) -> Result<()>;
}

/// Short-lived shared keys: the latest payload of a batchable
/// `(user, template)` pair while its single job is queued, and in-flight
/// claims on job idempotency keys.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Stores `payload` under `key`. Returns true when this call opened the
    /// batch, false when it overwrote the payload of an open one. An opened
    /// batch lives for `ttl` unless taken first.
    async fn open_or_update(&self, key: &str, payload: &str, ttl: Duration) -> Result<bool>;

    /// Removes and returns the latest payload.
    async fn take(&self, key: &str) -> Result<Option<String>>;

    /// Sets `key` if absent. Returns false while another holder has it.
    async fn claim(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn release(&self, key: &str) -> Result<()>;
}
