use std::{collections::HashMap, sync::Arc};

use anyhow::{Result, anyhow};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    clients::{
        dedup::{NotificationKey, hash_notification},
        store::{BatchStore, JobQueue},
    },
    models::{
        channel::Channel,
        message::{DlqMessage, QueuedJob},
        request::{NotificationRequest, Priority},
    },
};

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("user_id is required")]
    MissingUserId,

    #[error("template_code is required")]
    MissingTemplateCode,

    #[error("unknown channel '{0}', expected push, whatsapp or sms")]
    InvalidChannel(String),

    #[error(transparent)]
    Queue(#[from] anyhow::Error),
}

/// Producer-facing enqueue payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnqueueRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default, alias = "template_name")]
    pub template_code: String,
    #[serde(default)]
    pub channel: Option<String>,
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
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Requeued { attempt: u32 },
    DeadLettered,
}

/// Upper bound on one job's processing time; a crashed worker's claim lapses
/// after this.
pub const JOB_CLAIM_TTL: Duration = Duration::from_secs(120);

pub fn batch_key(user_id: &str, template_code: &str) -> String {
    format!("batch:{}:{}", user_id, template_code)
}

fn claim_key(job: &QueuedJob) -> String {
    format!("claim:{}", job.idempotency_key)
}

pub struct QueueFrontEnd {
    queue: Arc<dyn JobQueue>,
    batches: Arc<dyn BatchStore>,
    batch_window: Duration,
}

impl QueueFrontEnd {
    pub fn new(queue: Arc<dyn JobQueue>, batches: Arc<dyn BatchStore>, batch_window: Duration) -> Self {
        Self {
            queue,
            batches,
            batch_window,
        }
    }

    pub fn validate(input: EnqueueRequest) -> Result<NotificationRequest, EnqueueError> {
        if input.user_id.trim().is_empty() {
            return Err(EnqueueError::MissingUserId);
        }

        if input.template_code.trim().is_empty() {
            return Err(EnqueueError::MissingTemplateCode);
        }

        let preferred_channel = match input.channel.as_deref() {
            None | Some("") => None,
            Some(name) => Some(
                Channel::from_string(name)
                    .ok_or_else(|| EnqueueError::InvalidChannel(name.to_string()))?,
            ),
        };

        Ok(NotificationRequest {
            user_id: input.user_id,
            template_code: input.template_code,
            preferred_channel,
            context_data: input.context_data,
            priority: input.priority,
            service_instance_id: input.service_instance_id,
            event_type: input.event_type,
            batchable: input.batchable,
            idempotency_key: input.idempotency_key,
        })
    }

    /// Validates and enqueues. Returns the job id, or `None` when the request
    /// was folded into an already queued batch for the same user and template.
    pub async fn queue_notification(
        &self,
        input: EnqueueRequest,
    ) -> Result<Option<Uuid>, EnqueueError> {
        let request = Self::validate(input)?;
        self.enqueue(request).await
    }

    pub async fn enqueue(
        &self,
        request: NotificationRequest,
    ) -> Result<Option<Uuid>, EnqueueError> {
        let idempotency_key = hash_notification(&NotificationKey {
            user_id: &request.user_id,
            template_code: &request.template_code,
            channel: request.preferred_channel.unwrap_or(Channel::Push),
            service_instance_id: request.service_instance_id.as_deref(),
            context_data: &request.context_data,
        });

        let mut job = QueuedJob::new(request, idempotency_key);
        let policy = job.request.priority.policy();

        if job.request.batchable {
            let key = batch_key(&job.request.user_id, &job.request.template_code);
            let payload = serde_json::to_string(&job.request).map_err(|e| anyhow!(e))?;

            // The payload must outlive the window until a worker takes it, so
            // requests landing after the window but before the claim still fold.
            let opened = self
                .batches
                .open_or_update(&key, &payload, self.batch_window + policy.expire_in)
                .await?;

            if !opened {
                info!(
                    user_id = %job.request.user_id,
                    template_code = %job.request.template_code,
                    "Folded into queued batch"
                );
                return Ok(None);
            }

            let window = chrono::Duration::from_std(self.batch_window).map_err(|e| anyhow!(e))?;
            job.not_before = Some(job.enqueued_at + window);
            job = job.with_batch_key(key);

            self.queue
                .publish_delayed(&job, &policy, self.batch_window)
                .await?;

            info!(
                job_id = %job.job_id,
                user_id = %job.request.user_id,
                window_secs = self.batch_window.as_secs(),
                "Batch opened, job held until the window closes"
            );

            return Ok(Some(job.job_id));
        }

        self.queue.publish(&job, &policy).await?;

        info!(
            job_id = %job.job_id,
            user_id = %job.request.user_id,
            priority = ?job.request.priority,
            "Notification queued"
        );

        Ok(Some(job.job_id))
    }

    /// Swaps a batch job's request for the latest payload written to its
    /// batch and clears the key. Jobs without a batch key pass through.
    pub async fn resolve_batched(&self, mut job: QueuedJob) -> Result<QueuedJob> {
        let Some(key) = job.batch_key.take() else {
            return Ok(job);
        };

        match self.batches.take(&key).await? {
            Some(payload) => {
                job.request = serde_json::from_str(&payload)?;
                debug!(job_id = %job.job_id, batch_key = %key, "Using latest batch payload");
            }
            None => {
                debug!(job_id = %job.job_id, batch_key = %key, "Batch expired, using queued payload");
            }
        }

        Ok(job)
    }

    /// Republishes the job behind the backoff for `job.attempt`, or moves it
    /// to the dead-letter queue once the retry limit is spent. The backoff is
    /// served by the broker, not by the calling worker.
    pub async fn retry_or_dead_letter(&self, mut job: QueuedJob, reason: &str) -> Result<RetryOutcome> {
        let policy = job.request.priority.policy();

        if job.attempt > policy.retry_limit {
            self.dead_letter(job, reason).await?;
            return Ok(RetryOutcome::DeadLettered);
        }

        let delay = policy.retry_delay_for(job.attempt);
        warn!(
            job_id = %job.job_id,
            attempt = job.attempt,
            delay_ms = delay.as_millis() as u64,
            reason,
            "Job failed, scheduling retry"
        );

        job.attempt += 1;
        self.queue.publish_delayed(&job, &policy, delay).await?;

        Ok(RetryOutcome::Requeued {
            attempt: job.attempt,
        })
    }

    /// Marks the job's content as in flight. Returns false while an identical
    /// job is being processed elsewhere.
    pub async fn claim_job(&self, job: &QueuedJob) -> Result<bool> {
        self.batches.claim(&claim_key(job), JOB_CLAIM_TTL).await
    }

    pub async fn release_job(&self, job: &QueuedJob) -> Result<()> {
        self.batches.release(&claim_key(job)).await
    }

    pub async fn dead_letter(&self, job: QueuedJob, reason: &str) -> Result<()> {
        warn!(job_id = %job.job_id, attempt = job.attempt, reason, "Moving job to dead-letter queue");

        let message = DlqMessage {
            original_job: job,
            failure_reason: reason.to_string(),
            failed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };

        self.queue.publish_dead_letter(&message).await
    }
}
