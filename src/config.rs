use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;
use tokio::time::Duration;

use crate::{
    clients::dedup::DedupConfig,
    models::{circuit_breaker::CircuitBreakerConfig, retry::RetryConfig},
    orchestrator::OrchestratorSettings,
};

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub rabbitmq_url: String,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(default = "default_failed_queue_name")]
    pub failed_queue_name: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,

    pub redis_url: String,
    #[serde(default = "default_batch_window_seconds")]
    pub batch_window_seconds: u64,

    pub database_url: String,

    pub fcm_project_id: String,
    #[serde(default = "default_fcm_base_url")]
    pub fcm_base_url: String,

    pub whatsapp_api_url: String,
    pub whatsapp_access_token: String,
    #[serde(default = "default_whatsapp_max_attempts")]
    pub whatsapp_max_attempts: u32,
    #[serde(default = "default_whatsapp_retry_delay_ms")]
    pub whatsapp_retry_delay_ms: u64,

    pub sms_gateway_url: String,
    pub sms_api_key: String,
    #[serde(default = "default_sms_sender_id")]
    pub sms_sender_id: String,

    #[serde(default = "default_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_recovery_seconds")]
    pub circuit_breaker_recovery_seconds: u64,

    #[serde(default = "default_dedup_window_seconds")]
    pub dedup_window_seconds: i64,
    #[serde(default = "default_critical_dedup_window_seconds")]
    pub critical_dedup_window_seconds: i64,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: u64,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
}

fn default_queue_name() -> String {
    "notifications".to_string()
}

fn default_failed_queue_name() -> String {
    "notifications.failed".to_string()
}

fn default_prefetch_count() -> u16 {
    10
}

fn default_batch_window_seconds() -> u64 {
    300
}

fn default_fcm_base_url() -> String {
    "https://fcm.googleapis.com".to_string()
}

fn default_whatsapp_max_attempts() -> u32 {
    2
}

fn default_whatsapp_retry_delay_ms() -> u64 {
    1000
}

fn default_sms_sender_id() -> String {
    "NOTIFY".to_string()
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_seconds() -> u64 {
    60
}

fn default_dedup_window_seconds() -> i64 {
    300
}

fn default_critical_dedup_window_seconds() -> i64 {
    60
}

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_initial_retry_delay_ms() -> u64 {
    500
}

fn default_max_retry_delay_ms() -> u64 {
    10_000
}

fn default_retry_backoff_multiplier() -> u64 {
    2
}

fn default_worker_concurrency() -> usize {
    8
}

fn default_server_port() -> u16 {
    8080
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;
        Ok(config)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retry_attempts,
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            recovery_window: Duration::from_secs(self.circuit_breaker_recovery_seconds),
        }
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            default_window: chrono::Duration::seconds(self.dedup_window_seconds),
            critical_window: chrono::Duration::seconds(self.critical_dedup_window_seconds),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            whatsapp_max_attempts: self.whatsapp_max_attempts.max(1),
            whatsapp_retry_delay: Duration::from_millis(self.whatsapp_retry_delay_ms),
        }
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_secs(self.batch_window_seconds)
    }
}
