use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{
    clients::store::NotificationStore,
    models::{channel::Channel, log::DuplicateQuery, preference::CRITICAL_DEDUP_EVENT_TYPES},
};

const CONTEXT_HASH_LEN: usize = 16;
const NOTIFICATION_HASH_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub default_window: Duration,
    pub critical_window: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            default_window: Duration::minutes(5),
            critical_window: Duration::minutes(1),
        }
    }
}

/// Order-independent digest of the context map.
pub fn hash_context_data(context_data: &HashMap<String, String>) -> String {
    let mut pairs: Vec<(&String, &String)> = context_data.iter().collect();
    pairs.sort();

    let canonical = pairs
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("|");

    let digest = hex::encode(Sha256::digest(canonical.as_bytes()));
    digest[..CONTEXT_HASH_LEN].to_string()
}

pub struct NotificationKey<'a> {
    pub user_id: &'a str,
    pub template_code: &'a str,
    pub channel: Channel,
    pub service_instance_id: Option<&'a str>,
    pub context_data: &'a HashMap<String, String>,
}

/// Identity-scoped digest: differs across users, channels and correlation ids
/// even when the context is identical.
pub fn hash_notification(key: &NotificationKey<'_>) -> String {
    let canonical = [
        key.user_id,
        key.template_code,
        key.channel.as_str(),
        key.service_instance_id.unwrap_or(""),
        hash_context_data(key.context_data).as_str(),
    ]
    .join(":");

    let digest = hex::encode(Sha256::digest(canonical.as_bytes()));
    digest[..NOTIFICATION_HASH_LEN].to_string()
}

pub struct DuplicateCheck<'a> {
    pub user_id: &'a str,
    pub template_code: &'a str,
    pub service_instance_id: Option<&'a str>,
    pub context_data_hash: &'a str,
    pub event_type: Option<&'a str>,
}

pub struct DedupEngine {
    store: Arc<dyn NotificationStore>,
    config: DedupConfig,
}

impl DedupEngine {
    pub fn new(store: Arc<dyn NotificationStore>, config: DedupConfig) -> Self {
        Self { store, config }
    }

    pub fn window_for(&self, event_type: Option<&str>) -> Duration {
        match event_type {
            Some(event) if CRITICAL_DEDUP_EVENT_TYPES.contains(&event) => {
                self.config.critical_window
            }
            _ => self.config.default_window,
        }
    }

    pub async fn is_duplicate(&self, check: &DuplicateCheck<'_>) -> Result<bool> {
        let window = self.window_for(check.event_type);

        let query = DuplicateQuery {
            user_id: check.user_id.to_string(),
            template_code: check.template_code.to_string(),
            service_instance_id: check.service_instance_id.map(str::to_string),
            context_data_hash: check.context_data_hash.to_string(),
            since: Utc::now() - window,
        };

        let duplicate = self.store.find_recent_success(&query).await?;

        debug!(
            user_id = check.user_id,
            template_code = check.template_code,
            window_seconds = window.num_seconds(),
            duplicate,
            "Dedup check completed"
        );

        Ok(duplicate)
    }

    pub async fn is_webhook_duplicate(&self, idempotency_key: &str) -> Result<bool> {
        let since = Utc::now() - self.config.default_window;
        self.store.find_recent_message_key(idempotency_key, since).await
    }
}
