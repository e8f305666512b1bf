#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use delivery_service::{
    clients::{
        adapter::{AdapterError, ChannelAdapter, OutboundMessage, SendReceipt},
        circuit_breaker::CircuitBreaker,
        dedup::DedupConfig,
        memory::MemoryStore,
        store::{JobQueue, NotificationStore},
    },
    models::{
        channel::Channel,
        circuit_breaker::CircuitBreakerConfig,
        log::{
            CreateFailedNotification, CreateNotificationLog, DuplicateQuery, FailedNotification,
            NotificationLog, StatusUpdate,
        },
        message::{DlqMessage, QueuedJob},
        request::{NotificationRequest, QueuePolicy},
    },
    orchestrator::{DeliveryOrchestrator, OrchestratorSettings},
};
use parking_lot::Mutex;
use tokio::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum Outcome {
    Sent(&'static str),
    Fail(&'static str),
    NoRecipient,
}

/// In-process adapter that replays a scripted list of outcomes, then repeats
/// the last one.
pub struct ScriptedAdapter {
    channel: Channel,
    script: Mutex<VecDeque<Outcome>>,
    last: Mutex<Outcome>,
    calls: AtomicU32,
    messages: Mutex<Vec<OutboundMessage>>,
}

impl ScriptedAdapter {
    pub fn new(channel: Channel, script: Vec<Outcome>) -> Arc<Self> {
        let last = script.last().cloned().unwrap_or(Outcome::Fail("unscripted"));
        Arc::new(Self {
            channel,
            script: Mutex::new(script.into()),
            last: Mutex::new(last),
            calls: AtomicU32::new(0),
            messages: Mutex::new(Vec::new()),
        })
    }

    pub fn always(channel: Channel, outcome: Outcome) -> Arc<Self> {
        Self::new(channel, vec![outcome])
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl ChannelAdapter for ScriptedAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.messages.lock().push(message.clone());

        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.last.lock().clone());

        match outcome {
            Outcome::Sent(id) => Ok(SendReceipt {
                message_id: id.to_string(),
            }),
            Outcome::Fail(reason) => Err(AdapterError::Provider(reason.to_string())),
            Outcome::NoRecipient => match self.channel {
                Channel::Push => Err(AdapterError::NoTokens),
                Channel::Whatsapp | Channel::Sms => Err(AdapterError::NoPhone),
            },
        }
    }
}

/// Captures what the queue front-end publishes.
#[derive(Default)]
pub struct RecordingQueue {
    pub published: Mutex<Vec<(QueuedJob, QueuePolicy)>>,
    pub delays: Mutex<Vec<(Uuid, Duration)>>,
    pub dead_letters: Mutex<Vec<DlqMessage>>,
    pub unavailable: std::sync::atomic::AtomicBool,
}

impl RecordingQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn published_jobs(&self) -> Vec<QueuedJob> {
        self.published
            .lock()
            .iter()
            .map(|(job, _)| job.clone())
            .collect()
    }

    pub fn delay_for(&self, job_id: Uuid) -> Option<Duration> {
        self.delays
            .lock()
            .iter()
            .find(|(id, _)| *id == job_id)
            .map(|(_, delay)| *delay)
    }
}

#[async_trait]
impl JobQueue for RecordingQueue {
    async fn publish(&self, job: &QueuedJob, policy: &QueuePolicy) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow!("broker unavailable"));
        }
        self.published.lock().push((job.clone(), policy.clone()));
        Ok(())
    }

    async fn publish_delayed(&self, job: &QueuedJob, policy: &QueuePolicy, delay: Duration) -> Result<()> {
        self.publish(job, policy).await?;
        self.delays.lock().push((job.job_id, delay));
        Ok(())
    }

    async fn publish_dead_letter(&self, message: &DlqMessage) -> Result<()> {
        self.dead_letters.lock().push(message.clone());
        Ok(())
    }
}

/// Notification store whose every call fails.
pub struct BrokenStore;

#[async_trait]
impl NotificationStore for BrokenStore {
    async fn insert_log(&self, _log: CreateNotificationLog) -> Result<Uuid> {
        Err(anyhow!("database down"))
    }

    async fn insert_failed(&self, _failed: CreateFailedNotification) -> Result<Uuid> {
        Err(anyhow!("database down"))
    }

    async fn find_recent_success(&self, _query: &DuplicateQuery) -> Result<bool> {
        Err(anyhow!("database down"))
    }

    async fn find_recent_message_key(&self, _key: &str, _since: DateTime<Utc>) -> Result<bool> {
        Err(anyhow!("database down"))
    }

    async fn update_status(&self, _update: &StatusUpdate) -> Result<bool> {
        Err(anyhow!("database down"))
    }

    async fn logs_between(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<NotificationLog>> {
        Err(anyhow!("database down"))
    }

    async fn get_failed(&self, _id: Uuid) -> Result<Option<FailedNotification>> {
        Err(anyhow!("database down"))
    }

    async fn list_unresolved_failed(&self, _limit: i64) -> Result<Vec<FailedNotification>> {
        Err(anyhow!("database down"))
    }

    async fn resolve_failed(&self, _id: Uuid, _resolved_at: DateTime<Utc>) -> Result<bool> {
        Err(anyhow!("database down"))
    }

    async fn health_check(&self) -> Result<()> {
        Err(anyhow!("database down"))
    }
}

pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        whatsapp_max_attempts: 2,
        whatsapp_retry_delay: Duration::ZERO,
    }
}

pub fn orchestrator_with(
    store: Arc<MemoryStore>,
    breaker: Arc<CircuitBreaker>,
    adapters: &[Arc<ScriptedAdapter>],
) -> DeliveryOrchestrator {
    let mut orchestrator = DeliveryOrchestrator::new(
        store.clone(),
        store,
        breaker,
        DedupConfig::default(),
        fast_settings(),
    );

    for adapter in adapters {
        orchestrator = orchestrator.with_adapter(adapter.clone());
    }

    orchestrator
}

pub fn orchestrator(store: Arc<MemoryStore>, adapters: &[Arc<ScriptedAdapter>]) -> DeliveryOrchestrator {
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
    orchestrator_with(store, breaker, adapters)
}

pub fn context(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

pub fn request(user_id: &str, template_code: &str) -> NotificationRequest {
    NotificationRequest::new(user_id, template_code)
}
