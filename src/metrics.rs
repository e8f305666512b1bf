use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use tracing::info;
use uuid::Uuid;

use crate::{
    clients::store::NotificationStore,
    models::{
        channel::Channel,
        log::{FailedNotification, NotificationLog},
        report::{ChannelReport, ChannelTotals, DeliveryReport, FailureReasonCount},
        request::{NotificationRequest, Priority},
        status::LogStatus,
    },
    orchestrator::{
        REASON_ALL_OPTED_OUT, REASON_DUPLICATE, REASON_EVENT_OPTED_OUT, REASON_WEBHOOK_DUPLICATE,
    },
    queue::QueueFrontEnd,
};

pub const DEFAULT_REPORT_WINDOW_HOURS: i64 = 24;
pub const DEFAULT_TOP_FAILURE_REASONS: usize = 10;

/// Longest acceptable time from creation to provider acknowledgement.
pub fn sla_ceiling(channel: Channel) -> Option<Duration> {
    match channel {
        Channel::Push => Some(Duration::seconds(5)),
        Channel::Whatsapp => Some(Duration::seconds(30)),
        Channel::Sms => None,
    }
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((part as f64 / total as f64) * 10_000.0).round() / 100.0
}

fn is_sla_breach(log: &NotificationLog) -> bool {
    let (Some(channel), Some(sent_at)) = (log.channel, log.sent_at) else {
        return false;
    };

    sla_ceiling(channel).is_some_and(|ceiling| sent_at - log.created_at > ceiling)
}

/// Aggregates log rows into per-channel totals, rates, SLA breaches and the
/// `top_n` most frequent failure reasons.
pub fn build_report(
    logs: &[NotificationLog],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    top_n: usize,
) -> DeliveryReport {
    let mut totals: BTreeMap<Channel, (ChannelTotals, u64)> = BTreeMap::new();
    let mut reasons: HashMap<&str, u64> = HashMap::new();
    let mut duplicates_suppressed = 0;
    let mut opt_out_skips = 0;

    for log in logs {
        if let Some(reason) = log.failure_reason.as_deref() {
            if log.status == LogStatus::Failed {
                *reasons.entry(reason).or_default() += 1;
            }
            if log.status == LogStatus::Skipped {
                match reason {
                    REASON_DUPLICATE | REASON_WEBHOOK_DUPLICATE => duplicates_suppressed += 1,
                    REASON_ALL_OPTED_OUT | REASON_EVENT_OPTED_OUT => opt_out_skips += 1,
                    _ => {}
                }
            }
        }

        let Some(channel) = log.channel else {
            continue;
        };

        let (channel_totals, breaches) = totals.entry(channel).or_default();
        match log.status {
            LogStatus::Sent => channel_totals.sent += 1,
            LogStatus::Delivered => channel_totals.delivered += 1,
            LogStatus::Read => channel_totals.read += 1,
            LogStatus::Failed => channel_totals.failed += 1,
            LogStatus::Skipped => channel_totals.skipped += 1,
        }

        if is_sla_breach(log) {
            *breaches += 1;
        }
    }

    let channels = totals
        .into_iter()
        .map(|(channel, (totals, sla_breaches))| {
            let total = totals.total();
            let reached = totals.sent + totals.delivered + totals.read;
            let report = ChannelReport {
                delivery_rate: percentage(reached, total),
                failure_rate: percentage(totals.failed, total),
                sla_breaches,
                totals,
            };
            (channel, report)
        })
        .collect();

    let mut top_failure_reasons: Vec<FailureReasonCount> = reasons
        .into_iter()
        .map(|(reason, count)| FailureReasonCount {
            reason: reason.to_string(),
            count,
        })
        .collect();
    top_failure_reasons
        .sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.reason.cmp(&b.reason)));
    top_failure_reasons.truncate(top_n);

    DeliveryReport {
        window_start,
        window_end,
        channels,
        top_failure_reasons,
        duplicates_suppressed,
        opt_out_skips,
    }
}

/// Read-only reporting over the notification log, plus operator recovery of
/// failed notifications.
pub struct MetricsObserver {
    store: Arc<dyn NotificationStore>,
    queue: Arc<QueueFrontEnd>,
}

impl MetricsObserver {
    pub fn new(store: Arc<dyn NotificationStore>, queue: Arc<QueueFrontEnd>) -> Self {
        Self { store, queue }
    }

    pub async fn delivery_report(&self, window: Duration) -> Result<DeliveryReport> {
        let end = Utc::now();
        let start = end
            .checked_sub_signed(window)
            .ok_or_else(|| anyhow!("Report window of {} is out of range", window))?;
        self.report_between(start, end).await
    }

    pub async fn report_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<DeliveryReport> {
        let logs = self.store.logs_between(start, end).await?;
        Ok(build_report(&logs, start, end, DEFAULT_TOP_FAILURE_REASONS))
    }

    pub async fn unresolved_failures(&self, limit: i64) -> Result<Vec<FailedNotification>> {
        self.store.list_unresolved_failed(limit).await
    }

    /// Re-submits a failed notification at high priority and resolves the
    /// failure record. Returns the new job id.
    pub async fn retry_failed(&self, id: Uuid) -> Result<Option<Uuid>> {
        let failed = self
            .store
            .get_failed(id)
            .await?
            .ok_or_else(|| anyhow!("Failed notification {} not found", id))?;

        if failed.resolved_at.is_some() {
            return Err(anyhow!("Failed notification {} is already resolved", id));
        }

        let request = NotificationRequest {
            user_id: failed.user_id.clone(),
            template_code: failed.template_code.clone(),
            preferred_channel: failed.channel,
            context_data: failed.context_data.clone(),
            priority: Priority::High,
            service_instance_id: failed.service_instance_id.clone(),
            event_type: failed.event_type.clone(),
            batchable: false,
            idempotency_key: None,
        };

        let job_id = self.queue.enqueue(request).await?;
        self.store.resolve_failed(id, Utc::now()).await?;

        info!(failed_id = %id, job_id = ?job_id, "Failed notification re-enqueued");
        Ok(job_id)
    }
}
