use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    clients::{preferences::PreferenceGate, store::NotificationStore},
    models::{channel::Channel, log::StatusUpdate, status::LogStatus},
};

/// Status callback posted by a channel provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderStatusEvent {
    pub message_id: String,
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// STOP or START keyword parsed by the provider webhook.
#[derive(Debug, Clone, Deserialize)]
pub struct OptOutEvent {
    pub user_id: String,
    #[serde(default, deserialize_with = "crate::models::channel::lenient_channel")]
    pub channel: Option<Channel>,
    #[serde(default)]
    pub resubscribe: bool,
}

pub fn parse_provider_status(status: &str) -> Option<LogStatus> {
    match status.trim().to_lowercase().as_str() {
        "sent" | "accepted" => Some(LogStatus::Sent),
        "delivered" => Some(LogStatus::Delivered),
        "read" | "seen" => Some(LogStatus::Read),
        "failed" | "undelivered" | "rejected" => Some(LogStatus::Failed),
        _ => None,
    }
}

impl ProviderStatusEvent {
    pub fn into_update(self) -> Result<StatusUpdate> {
        let status = parse_provider_status(&self.status)
            .ok_or_else(|| anyhow!("Unsupported provider status '{}'", self.status))?;

        let failure_reason = match status {
            LogStatus::Failed => Some(
                self.error
                    .unwrap_or_else(|| "provider reported failure".to_string()),
            ),
            _ => None,
        };

        Ok(StatusUpdate {
            external_message_id: self.message_id,
            status,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            failure_reason,
        })
    }
}

/// Applies a provider status callback. Returns false when no row moved, which
/// covers unknown message ids and backward transitions such as read to
/// delivered.
pub async fn apply_status_update(
    store: &dyn NotificationStore,
    event: ProviderStatusEvent,
) -> Result<bool> {
    let update = event.into_update()?;

    // Rows are written as sent by the worker, so a sent callback never moves one.
    if update.status == LogStatus::Sent {
        return Ok(false);
    }

    let applied = store.update_status(&update).await?;

    if applied {
        info!(
            external_message_id = %update.external_message_id,
            status = %update.status,
            "Delivery status updated"
        );
    } else {
        warn!(
            external_message_id = %update.external_message_id,
            status = %update.status,
            "Status update ignored"
        );
    }

    Ok(applied)
}

pub async fn record_opt_out(gate: &PreferenceGate, event: OptOutEvent) -> Result<()> {
    let channel = event
        .channel
        .ok_or_else(|| anyhow!("Opt-out requires a known channel"))?;

    if event.user_id.trim().is_empty() {
        return Err(anyhow!("Opt-out requires a user_id"));
    }

    if event.resubscribe {
        gate.record_opt_in(&event.user_id, channel).await?;
        info!(user_id = %event.user_id, channel = %channel, "Channel opt-out cleared");
    } else {
        gate.record_opt_out(&event.user_id, channel).await?;
        info!(user_id = %event.user_id, channel = %channel, "Channel opt-out recorded");
    }

    Ok(())
}
