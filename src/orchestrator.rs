use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    clients::{
        adapter::{AdapterError, ChannelAdapter, OutboundMessage},
        circuit_breaker::CircuitBreaker,
        dedup::{DedupConfig, DedupEngine, DuplicateCheck, hash_context_data},
        preferences::PreferenceGate,
        store::{NotificationStore, PreferenceStore},
    },
    models::{
        attempt::{AttemptStatus, DeliveryAttempt, DeliveryResult, FinalStatus},
        channel::Channel,
        log::{CreateFailedNotification, CreateNotificationLog},
        request::NotificationRequest,
        status::LogStatus,
    },
};

pub const REASON_ALL_OPTED_OUT: &str = "opted out of all channels";
pub const REASON_EVENT_OPTED_OUT: &str = "opted out of event type on every channel";
pub const REASON_DUPLICATE: &str = "duplicate";
pub const REASON_WEBHOOK_DUPLICATE: &str = "duplicate webhook-triggered send";
pub const REASON_NO_CHANNEL_AVAILABLE: &str = "all channels unavailable (circuit open)";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Tries per chain pass on the chat-template channel; other channels get one.
    pub whatsapp_max_attempts: u32,
    pub whatsapp_retry_delay: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            whatsapp_max_attempts: 2,
            whatsapp_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Ordered fallback chain: the default order rotated so `preferred` leads,
/// minus hard opt-outs. Without a preference the default order is used.
pub fn resolve_chain(preferred: Option<Channel>, opted_out: &HashSet<Channel>) -> Vec<Channel> {
    let order = Channel::DEFAULT_ORDER;
    let start = preferred
        .and_then(|channel| order.iter().position(|c| *c == channel))
        .unwrap_or(0);

    order
        .iter()
        .cycle()
        .skip(start)
        .take(order.len())
        .copied()
        .filter(|channel| !opted_out.contains(channel))
        .collect()
}

pub struct DeliveryOrchestrator {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
    breaker: Arc<CircuitBreaker>,
    dedup: DedupEngine,
    preferences: PreferenceGate,
    store: Arc<dyn NotificationStore>,
    settings: OrchestratorSettings,
}

struct ChainOutcome {
    attempts: Vec<DeliveryAttempt>,
    sent_at: Option<DateTime<Utc>>,
}

impl DeliveryOrchestrator {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        preferences: Arc<dyn PreferenceStore>,
        breaker: Arc<CircuitBreaker>,
        dedup_config: DedupConfig,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            adapters: HashMap::new(),
            breaker,
            dedup: DedupEngine::new(Arc::clone(&store), dedup_config),
            preferences: PreferenceGate::new(preferences),
            store,
            settings,
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.adapters.insert(adapter.channel(), adapter);
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn preferences(&self) -> &PreferenceGate {
        &self.preferences
    }

    pub async fn deliver_notification(&self, request: &NotificationRequest) -> DeliveryResult {
        self.deliver_notification_at(request, Utc::now()).await
    }

    /// Runs the fallback chain for one request. Never fails: every outcome,
    /// including persistence errors, ends up in the returned result.
    /// `created_at` is when the notification was first requested.
    pub async fn deliver_notification_at(
        &self,
        request: &NotificationRequest,
        created_at: DateTime<Utc>,
    ) -> DeliveryResult {
        let context_hash = hash_context_data(&request.context_data);

        let opted_out = match self.preferences.hard_opt_outs(&request.user_id).await {
            Ok(opted_out) => opted_out,
            Err(e) => {
                warn!(user_id = %request.user_id, error = %e, "Opt-out lookup failed, assuming none");
                HashSet::new()
            }
        };

        let chain = resolve_chain(request.preferred_channel, &opted_out);
        if chain.is_empty() {
            info!(user_id = %request.user_id, "User opted out of all channels");
            let log_id = self
                .persist_skip(request, &context_hash, created_at, REASON_ALL_OPTED_OUT)
                .await;
            return DeliveryResult {
                attempts: Vec::new(),
                final_status: FinalStatus::Failed,
                notification_log_id: log_id,
            };
        }

        if let Some(reason) = self.duplicate_reason(request, &context_hash).await {
            info!(
                user_id = %request.user_id,
                template_code = %request.template_code,
                reason,
                "Duplicate notification suppressed"
            );
            let log_id = self
                .persist_skip(request, &context_hash, created_at, reason)
                .await;
            return DeliveryResult {
                attempts: Vec::new(),
                final_status: FinalStatus::Skipped,
                notification_log_id: log_id,
            };
        }

        let message = outbound_message(request);
        let outcome = self.run_chain(request, &chain, &message).await;
        self.finish(request, &context_hash, created_at, outcome).await
    }

    async fn duplicate_reason(
        &self,
        request: &NotificationRequest,
        context_hash: &str,
    ) -> Option<&'static str> {
        if let Some(key) = request.idempotency_key.as_deref() {
            match self.dedup.is_webhook_duplicate(key).await {
                Ok(true) => return Some(REASON_WEBHOOK_DUPLICATE),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Webhook dedup check failed, continuing"),
            }
        }

        let check = DuplicateCheck {
            user_id: &request.user_id,
            template_code: &request.template_code,
            service_instance_id: request.service_instance_id.as_deref(),
            context_data_hash: context_hash,
            event_type: request.event_type.as_deref(),
        };

        match self.dedup.is_duplicate(&check).await {
            Ok(true) => Some(REASON_DUPLICATE),
            Ok(false) => None,
            Err(e) => {
                warn!(error = %e, "Dedup check failed, continuing");
                None
            }
        }
    }

    async fn run_chain(
        &self,
        request: &NotificationRequest,
        chain: &[Channel],
        message: &OutboundMessage,
    ) -> ChainOutcome {
        let mut outcome = ChainOutcome {
            attempts: Vec::new(),
            sent_at: None,
        };

        for &channel in chain {
            match self
                .preferences
                .is_permitted(&request.user_id, request.event_type.as_deref(), channel)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    outcome.attempts.push(DeliveryAttempt::unsuccessful(
                        channel,
                        AttemptStatus::OptedOut,
                        "user disabled this event type on channel".to_string(),
                    ));
                    continue;
                }
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Preference lookup failed, permitting");
                }
            }

            let Some(adapter) = self.adapters.get(&channel) else {
                warn!(channel = %channel, "No adapter registered for channel");
                continue;
            };

            // Last gate before the send: this may consume the half-open trial.
            if !self.breaker.is_available(channel) {
                debug!(channel = %channel, "Circuit open, skipping channel");
                continue;
            }

            if self
                .attempt_channel(channel, adapter.as_ref(), message, &mut outcome.attempts)
                .await
            {
                outcome.sent_at = Some(Utc::now());
                break;
            }
        }

        outcome
    }

    /// Returns true once the channel accepted the message.
    async fn attempt_channel(
        &self,
        channel: Channel,
        adapter: &dyn ChannelAdapter,
        message: &OutboundMessage,
        attempts: &mut Vec<DeliveryAttempt>,
    ) -> bool {
        let max_tries = match channel {
            Channel::Whatsapp => self.settings.whatsapp_max_attempts.max(1),
            Channel::Push | Channel::Sms => 1,
        };

        for try_number in 1..=max_tries {
            match adapter.send(message).await {
                Ok(receipt) => {
                    info!(
                        user_id = %message.user_id,
                        channel = %channel,
                        message_id = %receipt.message_id,
                        "Notification sent"
                    );
                    attempts.push(DeliveryAttempt::sent(channel, receipt.message_id));
                    self.breaker.record_success(channel);
                    return true;
                }
                Err(e) if e.is_missing_recipient() => {
                    let status = match &e {
                        AdapterError::NoTokens => AttemptStatus::NoTokens,
                        _ => AttemptStatus::NoPhone,
                    };
                    debug!(user_id = %message.user_id, channel = %channel, "No recipient address");
                    attempts.push(DeliveryAttempt::unsuccessful(channel, status, e.to_string()));
                    return false;
                }
                Err(e) => {
                    warn!(
                        user_id = %message.user_id,
                        channel = %channel,
                        try_number,
                        max_tries,
                        error = %e,
                        "Channel attempt failed"
                    );
                    attempts.push(DeliveryAttempt::unsuccessful(
                        channel,
                        AttemptStatus::Failed,
                        e.to_string(),
                    ));
                    self.breaker.record_failure(channel);

                    if try_number == max_tries {
                        break;
                    }

                    sleep(self.settings.whatsapp_retry_delay).await;

                    // A failed half-open trial re-opens the channel.
                    if !self.breaker.is_available(channel) {
                        debug!(channel = %channel, "Circuit opened mid-channel, stopping retries");
                        break;
                    }
                }
            }
        }

        false
    }

    async fn finish(
        &self,
        request: &NotificationRequest,
        context_hash: &str,
        created_at: DateTime<Utc>,
        outcome: ChainOutcome,
    ) -> DeliveryResult {
        let attempts = outcome.attempts;
        let retry_count = attempts
            .iter()
            .filter(|attempt| attempt.status == AttemptStatus::Failed)
            .count() as i32;

        let successful = attempts
            .iter()
            .find(|attempt| attempt.status == AttemptStatus::Sent);

        if let (Some(sent), Some(sent_at)) = (successful, outcome.sent_at) {
            let log = CreateNotificationLog::new(
                request.user_id.clone(),
                request.template_code.clone(),
                Some(sent.channel),
                LogStatus::Sent,
                context_hash.to_string(),
            )
            .with_external_message_id(sent.message_id.clone())
            .with_correlation(
                request.service_instance_id.clone(),
                request.event_type.clone(),
                request.idempotency_key.clone(),
            )
            .with_retry_count(retry_count)
            .with_timestamps(created_at, Some(sent_at), None);

            let log_id = self.persist_log(log).await;
            return DeliveryResult {
                attempts,
                final_status: FinalStatus::Delivered,
                notification_log_id: log_id,
            };
        }

        if !attempts.is_empty()
            && attempts
                .iter()
                .all(|attempt| attempt.status == AttemptStatus::OptedOut)
        {
            let log_id = self
                .persist_skip(request, context_hash, created_at, REASON_EVENT_OPTED_OUT)
                .await;
            return DeliveryResult {
                attempts,
                final_status: FinalStatus::Failed,
                notification_log_id: log_id,
            };
        }

        let last = attempts.last();
        let channel = last.map(|attempt| attempt.channel);
        let failure_reason = last
            .and_then(|attempt| attempt.error.clone())
            .unwrap_or_else(|| REASON_NO_CHANNEL_AVAILABLE.to_string());

        let log = CreateNotificationLog::new(
            request.user_id.clone(),
            request.template_code.clone(),
            channel,
            LogStatus::Failed,
            context_hash.to_string(),
        )
        .with_correlation(
            request.service_instance_id.clone(),
            request.event_type.clone(),
            request.idempotency_key.clone(),
        )
        .with_failure(failure_reason.clone())
        .with_retry_count(retry_count)
        .with_timestamps(created_at, None, Some(Utc::now()));

        let log_id = self.persist_log(log).await;

        warn!(
            user_id = %request.user_id,
            template_code = %request.template_code,
            attempts = attempts.len(),
            reason = %failure_reason,
            "Delivery chain exhausted"
        );

        let failed = CreateFailedNotification {
            notification_log_id: log_id,
            user_id: request.user_id.clone(),
            template_code: request.template_code.clone(),
            channel,
            context_data: request.context_data.clone(),
            service_instance_id: request.service_instance_id.clone(),
            event_type: request.event_type.clone(),
            failure_reason,
            retry_count,
        };

        if let Err(e) = self.store.insert_failed(failed).await {
            warn!(user_id = %request.user_id, error = %e, "Failed to record failed notification");
        }

        DeliveryResult {
            attempts,
            final_status: FinalStatus::Failed,
            notification_log_id: log_id,
        }
    }

    async fn persist_skip(
        &self,
        request: &NotificationRequest,
        context_hash: &str,
        created_at: DateTime<Utc>,
        reason: &str,
    ) -> Option<Uuid> {
        let log = CreateNotificationLog::new(
            request.user_id.clone(),
            request.template_code.clone(),
            request.preferred_channel,
            LogStatus::Skipped,
            context_hash.to_string(),
        )
        .with_correlation(
            request.service_instance_id.clone(),
            request.event_type.clone(),
            request.idempotency_key.clone(),
        )
        .with_failure(reason.to_string())
        .with_timestamps(created_at, None, None);

        self.persist_log(log).await
    }

    async fn persist_log(&self, log: CreateNotificationLog) -> Option<Uuid> {
        let user_id = log.user_id.clone();
        match self.store.insert_log(log).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to write notification log");
                None
            }
        }
    }
}

fn outbound_message(request: &NotificationRequest) -> OutboundMessage {
    let hint = |key: &str| {
        request
            .context_data
            .get(key)
            .filter(|value| !value.is_empty())
            .cloned()
    };

    OutboundMessage {
        user_id: request.user_id.clone(),
        subject: hint("_title").unwrap_or_else(|| request.template_code.clone()),
        body: hint("_body").unwrap_or_default(),
        context_data: request.context_data.clone(),
        template_name: Some(request.template_code.clone()),
    }
}
