use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::{
    clients::store::{BatchStore, NotificationStore, PreferenceStore, RecipientDirectory},
    models::{
        channel::Channel,
        log::{
            CreateFailedNotification, CreateNotificationLog, DuplicateQuery, FailedNotification,
            NotificationLog, StatusUpdate,
        },
        status::LogStatus,
    },
};

#[derive(Default)]
struct MemoryState {
    logs: Vec<NotificationLog>,
    failed: Vec<FailedNotification>,
    opt_outs: HashMap<String, HashSet<Channel>>,
    categories: HashMap<(String, String, Channel), bool>,
    device_tokens: HashMap<String, Vec<String>>,
    phones: HashMap<String, String>,
}

/// In-process store for local runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logs(&self) -> Vec<NotificationLog> {
        self.state.read().logs.clone()
    }

    pub fn failed_notifications(&self) -> Vec<FailedNotification> {
        self.state.read().failed.clone()
    }

    pub fn set_category(&self, user_id: &str, category: &str, channel: Channel, enabled: bool) {
        self.state.write().categories.insert(
            (user_id.to_string(), category.to_string(), channel),
            enabled,
        );
    }

    pub fn set_device_tokens(&self, user_id: &str, tokens: Vec<String>) {
        self.state
            .write()
            .device_tokens
            .insert(user_id.to_string(), tokens);
    }

    pub fn set_phone(&self, user_id: &str, phone: &str) {
        self.state
            .write()
            .phones
            .insert(user_id.to_string(), phone.to_string());
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn insert_log(&self, log: CreateNotificationLog) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.state.write().logs.push(log.into_log(id));
        Ok(id)
    }

    async fn insert_failed(&self, failed: CreateFailedNotification) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.state.write().failed.push(failed.into_failed(id));
        Ok(id)
    }

    async fn find_recent_success(&self, query: &DuplicateQuery) -> Result<bool> {
        Ok(self.state.read().logs.iter().any(|log| {
            log.user_id == query.user_id
                && log.template_code == query.template_code
                && log.context_data_hash == query.context_data_hash
                && log.status.is_successful()
                && log.created_at >= query.since
                && query
                    .service_instance_id
                    .as_ref()
                    .is_none_or(|id| log.service_instance_id.as_ref() == Some(id))
        }))
    }

    async fn find_recent_message_key(&self, key: &str, since: DateTime<Utc>) -> Result<bool> {
        Ok(self.state.read().logs.iter().any(|log| {
            log.created_at >= since
                && log.status.is_successful()
                && (log.external_message_id.as_deref() == Some(key)
                    || log.idempotency_key.as_deref() == Some(key))
        }))
    }

    async fn update_status(&self, update: &StatusUpdate) -> Result<bool> {
        let mut state = self.state.write();
        let allowed = update.status.predecessors();

        let Some(log) = state.logs.iter_mut().find(|log| {
            log.external_message_id.as_deref() == Some(update.external_message_id.as_str())
                && allowed.contains(&log.status)
        }) else {
            return Ok(false);
        };

        log.status = update.status;
        match update.status {
            LogStatus::Delivered => log.delivered_at = Some(update.timestamp),
            LogStatus::Read => log.read_at = Some(update.timestamp),
            LogStatus::Failed => {
                log.failed_at = Some(update.timestamp);
                log.failure_reason = update.failure_reason.clone();
            }
            LogStatus::Sent | LogStatus::Skipped => {}
        }

        Ok(true)
    }

    async fn logs_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<NotificationLog>> {
        Ok(self
            .state
            .read()
            .logs
            .iter()
            .filter(|log| log.created_at >= start && log.created_at <= end)
            .cloned()
            .collect())
    }

    async fn get_failed(&self, id: Uuid) -> Result<Option<FailedNotification>> {
        Ok(self
            .state
            .read()
            .failed
            .iter()
            .find(|failed| failed.id == id)
            .cloned())
    }

    async fn list_unresolved_failed(&self, limit: i64) -> Result<Vec<FailedNotification>> {
        let mut unresolved: Vec<FailedNotification> = self
            .state
            .read()
            .failed
            .iter()
            .filter(|failed| failed.resolved_at.is_none())
            .cloned()
            .collect();

        unresolved.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        unresolved.truncate(limit.max(0) as usize);
        Ok(unresolved)
    }

    async fn resolve_failed(&self, id: Uuid, resolved_at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.write();
        match state
            .failed
            .iter_mut()
            .find(|failed| failed.id == id && failed.resolved_at.is_none())
        {
            Some(failed) => {
                failed.resolved_at = Some(resolved_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl PreferenceStore for MemoryStore {
    async fn channel_opt_outs(&self, user_id: &str) -> Result<HashSet<Channel>> {
        Ok(self
            .state
            .read()
            .opt_outs
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn category_enabled(
        &self,
        user_id: &str,
        category: &str,
        channel: Channel,
    ) -> Result<Option<bool>> {
        Ok(self
            .state
            .read()
            .categories
            .get(&(user_id.to_string(), category.to_string(), channel))
            .copied())
    }

    async fn set_channel_opt_out(
        &self,
        user_id: &str,
        channel: Channel,
        opted_out: bool,
    ) -> Result<()> {
        let mut state = self.state.write();
        let channels = state.opt_outs.entry(user_id.to_string()).or_default();
        if opted_out {
            channels.insert(channel);
        } else {
            channels.remove(&channel);
        }
        Ok(())
    }
}

#[async_trait]
impl RecipientDirectory for MemoryStore {
    async fn device_tokens(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .read()
            .device_tokens
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn invalidate_device_tokens(&self, user_id: &str, tokens: &[String]) -> Result<()> {
        if let Some(registered) = self.state.write().device_tokens.get_mut(user_id) {
            registered.retain(|token| !tokens.contains(token));
        }
        Ok(())
    }

    async fn phone_number(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self.state.read().phones.get(user_id).cloned())
    }
}

/// In-process batch store; entries expire lazily on access.
#[derive(Default)]
pub struct MemoryBatchStore {
    entries: Mutex<HashMap<String, (String, tokio::time::Instant)>>,
    claims: Mutex<HashMap<String, tokio::time::Instant>>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peek(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > tokio::time::Instant::now())
            .map(|(payload, _)| payload.clone())
    }
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    async fn open_or_update(&self, key: &str, payload: &str, ttl: Duration) -> Result<bool> {
        let now = tokio::time::Instant::now();
        let mut entries = self.entries.lock();

        match entries.get_mut(key) {
            Some((stored, expires_at)) if *expires_at > now => {
                *stored = payload.to_string();
                Ok(false)
            }
            _ => {
                entries.insert(key.to_string(), (payload.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        let now = tokio::time::Instant::now();
        Ok(self
            .entries
            .lock()
            .remove(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(payload, _)| payload))
    }

    async fn claim(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = tokio::time::Instant::now();
        let mut claims = self.claims.lock();

        match claims.get(key) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                claims.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.claims.lock().remove(key);
        Ok(())
    }
}
