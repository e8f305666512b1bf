use std::collections::{HashMap, HashSet};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    clients::store::{NotificationStore, PreferenceStore, RecipientDirectory},
    models::{
        channel::Channel,
        log::{
            CreateFailedNotification, CreateNotificationLog, DuplicateQuery, FailedNotification,
            NotificationLog, StatusUpdate,
        },
        status::LogStatus,
    },
};

const SCHEMA: &str = include_str!("../../migrations/0001_notifications.sql");

const LOG_COLUMNS: &str = "id, user_id, template_code, channel, status, context_data_hash, \
     external_message_id, idempotency_key, service_instance_id, event_type, failure_reason, \
     retry_count, created_at, sent_at, delivered_at, read_at, failed_at";

const FAILED_COLUMNS: &str = "id, notification_log_id, user_id, template_code, channel, \
     context_data, service_instance_id, event_type, failure_reason, retry_count, created_at, \
     resolved_at";

pub struct DatabaseClient {
    client: Client,
}

impl DatabaseClient {
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        info!("Connecting to PostgreSQL database");

        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection closed with error");
            }
        });

        info!("PostgreSQL connection established");

        Ok(Self { client })
    }

    pub async fn migrate(&self) -> Result<(), Error> {
        self.client
            .batch_execute(SCHEMA)
            .await
            .map_err(|e| anyhow!("Schema migration failed: {}", e))?;

        info!("Database schema is up to date");
        Ok(())
    }
}

fn parse_channel(value: Option<String>) -> Option<Channel> {
    value.as_deref().and_then(Channel::from_string)
}

fn log_from_row(row: &Row) -> Result<NotificationLog, Error> {
    let status: String = row.try_get("status")?;

    Ok(NotificationLog {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        template_code: row.try_get("template_code")?,
        channel: parse_channel(row.try_get("channel")?),
        status: LogStatus::from_string(&status)
            .ok_or_else(|| anyhow!("Unknown log status '{}'", status))?,
        context_data_hash: row.try_get("context_data_hash")?,
        external_message_id: row.try_get("external_message_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        service_instance_id: row.try_get("service_instance_id")?,
        event_type: row.try_get("event_type")?,
        failure_reason: row.try_get("failure_reason")?,
        retry_count: row.try_get("retry_count")?,
        created_at: row.try_get("created_at")?,
        sent_at: row.try_get("sent_at")?,
        delivered_at: row.try_get("delivered_at")?,
        read_at: row.try_get("read_at")?,
        failed_at: row.try_get("failed_at")?,
    })
}

fn failed_from_row(row: &Row) -> Result<FailedNotification, Error> {
    let context_data: serde_json::Value = row.try_get("context_data")?;

    Ok(FailedNotification {
        id: row.try_get("id")?,
        notification_log_id: row.try_get("notification_log_id")?,
        user_id: row.try_get("user_id")?,
        template_code: row.try_get("template_code")?,
        channel: parse_channel(row.try_get("channel")?),
        context_data: serde_json::from_value::<HashMap<String, String>>(context_data)?,
        service_instance_id: row.try_get("service_instance_id")?,
        event_type: row.try_get("event_type")?,
        failure_reason: row.try_get("failure_reason")?,
        retry_count: row.try_get("retry_count")?,
        created_at: row.try_get("created_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

#[async_trait]
impl NotificationStore for DatabaseClient {
    async fn insert_log(&self, log: CreateNotificationLog) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let status = log.status.as_str();
        let channel = log.channel.map(|c| c.as_str());

        self.client
            .execute(
                r#"
                INSERT INTO notification_logs (
                    id, user_id, template_code, channel, status, context_data_hash,
                    external_message_id, idempotency_key, service_instance_id, event_type,
                    failure_reason, retry_count, created_at, sent_at, failed_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                "#,
                &[
                    &id,
                    &log.user_id,
                    &log.template_code,
                    &channel,
                    &status,
                    &log.context_data_hash,
                    &log.external_message_id,
                    &log.idempotency_key,
                    &log.service_instance_id,
                    &log.event_type,
                    &log.failure_reason,
                    &log.retry_count,
                    &log.created_at,
                    &log.sent_at,
                    &log.failed_at,
                ],
            )
            .await
            .map_err(|e| {
                error!(error = %e, user_id = %log.user_id, "Failed to write notification log");
                anyhow!("Database write failed: {}", e)
            })?;

        debug!(log_id = %id, status, "Notification log written");
        Ok(id)
    }

    async fn insert_failed(&self, failed: CreateFailedNotification) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let channel = failed.channel.map(|c| c.as_str());
        let context_data = serde_json::to_value(&failed.context_data)?;

        self.client
            .execute(
                r#"
                INSERT INTO failed_notifications (
                    id, notification_log_id, user_id, template_code, channel, context_data,
                    service_instance_id, event_type, failure_reason, retry_count
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
                &[
                    &id,
                    &failed.notification_log_id,
                    &failed.user_id,
                    &failed.template_code,
                    &channel,
                    &context_data,
                    &failed.service_instance_id,
                    &failed.event_type,
                    &failed.failure_reason,
                    &failed.retry_count,
                ],
            )
            .await
            .map_err(|e| anyhow!("Failed notification write failed: {}", e))?;

        Ok(id)
    }

    async fn find_recent_success(&self, query: &DuplicateQuery) -> Result<bool> {
        let row = self
            .client
            .query_one(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM notification_logs
                    WHERE user_id = $1
                      AND template_code = $2
                      AND context_data_hash = $3
                      AND status IN ('sent', 'delivered', 'read')
                      AND created_at >= $4
                      AND ($5::TEXT IS NULL OR service_instance_id = $5)
                ) AS duplicate
                "#,
                &[
                    &query.user_id,
                    &query.template_code,
                    &query.context_data_hash,
                    &query.since,
                    &query.service_instance_id,
                ],
            )
            .await?;

        Ok(row.try_get("duplicate")?)
    }

    async fn find_recent_message_key(&self, key: &str, since: DateTime<Utc>) -> Result<bool> {
        let row = self
            .client
            .query_one(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM notification_logs
                    WHERE (external_message_id = $1 OR idempotency_key = $1)
                      AND status IN ('sent', 'delivered', 'read')
                      AND created_at >= $2
                ) AS seen
                "#,
                &[&key, &since],
            )
            .await?;

        Ok(row.try_get("seen")?)
    }

    async fn update_status(&self, update: &StatusUpdate) -> Result<bool> {
        let timestamp_column = match update.status {
            LogStatus::Delivered => "delivered_at",
            LogStatus::Read => "read_at",
            LogStatus::Failed => "failed_at",
            LogStatus::Sent | LogStatus::Skipped => {
                return Err(anyhow!("Status '{}' cannot be set by webhook", update.status));
            }
        };

        let allowed: Vec<&str> = update
            .status
            .predecessors()
            .iter()
            .map(|status| status.as_str())
            .collect();

        let sql = format!(
            "UPDATE notification_logs SET status = $2, {timestamp_column} = $3, \
             failure_reason = COALESCE($4, failure_reason) \
             WHERE external_message_id = $1 AND status = ANY($5)"
        );

        let updated = self
            .client
            .execute(
                sql.as_str(),
                &[
                    &update.external_message_id,
                    &update.status.as_str(),
                    &update.timestamp,
                    &update.failure_reason,
                    &allowed,
                ],
            )
            .await?;

        Ok(updated > 0)
    }

    async fn logs_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<NotificationLog>> {
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM notification_logs \
             WHERE created_at >= $1 AND created_at <= $2 ORDER BY created_at"
        );

        let rows = self.client.query(sql.as_str(), &[&start, &end]).await?;
        rows.iter().map(log_from_row).collect()
    }

    async fn get_failed(&self, id: Uuid) -> Result<Option<FailedNotification>> {
        let sql = format!("SELECT {FAILED_COLUMNS} FROM failed_notifications WHERE id = $1");

        match self.client.query_opt(sql.as_str(), &[&id]).await? {
            Some(row) => Ok(Some(failed_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_unresolved_failed(&self, limit: i64) -> Result<Vec<FailedNotification>> {
        let sql = format!(
            "SELECT {FAILED_COLUMNS} FROM failed_notifications \
             WHERE resolved_at IS NULL ORDER BY created_at DESC LIMIT $1"
        );

        let rows = self.client.query(sql.as_str(), &[&limit]).await?;
        rows.iter().map(failed_from_row).collect()
    }

    async fn resolve_failed(&self, id: Uuid, resolved_at: DateTime<Utc>) -> Result<bool> {
        let updated = self
            .client
            .execute(
                "UPDATE failed_notifications SET resolved_at = $2 \
                 WHERE id = $1 AND resolved_at IS NULL",
                &[&id, &resolved_at],
            )
            .await?;

        Ok(updated > 0)
    }

    async fn health_check(&self) -> Result<()> {
        self.client
            .query_one("SELECT 1", &[])
            .await
            .map_err(|e| anyhow!("Database health check failed: {}", e))?;

        Ok(())
    }
}

#[async_trait]
impl PreferenceStore for DatabaseClient {
    async fn channel_opt_outs(&self, user_id: &str) -> Result<HashSet<Channel>> {
        let rows = self
            .client
            .query(
                "SELECT channel FROM channel_opt_outs WHERE user_id = $1",
                &[&user_id],
            )
            .await?;

        let mut channels = HashSet::new();
        for row in rows {
            let channel: String = row.try_get("channel")?;
            if let Some(channel) = Channel::from_string(&channel) {
                channels.insert(channel);
            }
        }

        Ok(channels)
    }

    async fn category_enabled(
        &self,
        user_id: &str,
        category: &str,
        channel: Channel,
    ) -> Result<Option<bool>> {
        let row = self
            .client
            .query_opt(
                "SELECT enabled FROM notification_preferences \
                 WHERE user_id = $1 AND category = $2 AND channel = $3",
                &[&user_id, &category, &channel.as_str()],
            )
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("enabled")?)),
            None => Ok(None),
        }
    }

    async fn set_channel_opt_out(
        &self,
        user_id: &str,
        channel: Channel,
        opted_out: bool,
    ) -> Result<()> {
        if opted_out {
            self.client
                .execute(
                    "INSERT INTO channel_opt_outs (user_id, channel) VALUES ($1, $2) \
                     ON CONFLICT (user_id, channel) DO NOTHING",
                    &[&user_id, &channel.as_str()],
                )
                .await?;
        } else {
            self.client
                .execute(
                    "DELETE FROM channel_opt_outs WHERE user_id = $1 AND channel = $2",
                    &[&user_id, &channel.as_str()],
                )
                .await?;
        }

        info!(user_id, channel = %channel, opted_out, "Channel opt-out updated");
        Ok(())
    }
}

#[async_trait]
impl RecipientDirectory for DatabaseClient {
    async fn device_tokens(&self, user_id: &str) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT token FROM device_tokens WHERE user_id = $1 AND is_active",
                &[&user_id],
            )
            .await?;

        rows.iter()
            .map(|row| row.try_get::<_, String>("token").map_err(Error::from))
            .collect()
    }

    async fn invalidate_device_tokens(&self, user_id: &str, tokens: &[String]) -> Result<()> {
        let updated = self
            .client
            .execute(
                "UPDATE device_tokens SET is_active = FALSE, updated_at = now() \
                 WHERE user_id = $1 AND token = ANY($2)",
                &[&user_id, &tokens],
            )
            .await?;

        debug!(user_id, invalidated = updated, "Device tokens invalidated");
        Ok(())
    }

    async fn phone_number(&self, user_id: &str) -> Result<Option<String>> {
        let row = self
            .client
            .query_opt(
                "SELECT phone_number FROM user_contacts WHERE user_id = $1",
                &[&user_id],
            )
            .await?;

        match row {
            Some(row) => Ok(row.try_get("phone_number")?),
            None => Ok(None),
        }
    }
}
