use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    clients::{
        circuit_breaker::CircuitBreaker, rbmq::RabbitMqClient, redis::RedisClient,
        store::NotificationStore,
    },
    models::{
        channel::Channel,
        health::{HealthCheckResponse, HealthStatus, ServiceHealth},
    },
};

const CRITICAL_CHECKS: [&str; 3] = ["database", "cache_service", "message_broker"];

pub struct HealthChecker {
    store: Arc<dyn NotificationStore>,
    redis: Option<Arc<RedisClient>>,
    broker: Option<Arc<RabbitMqClient>>,
    breaker: Arc<CircuitBreaker>,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn NotificationStore>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            store,
            redis: None,
            broker: None,
            breaker,
        }
    }

    pub fn with_redis(mut self, redis: Arc<RedisClient>) -> Self {
        self.redis = Some(redis);
        self
    }

    pub fn with_broker(mut self, broker: Arc<RabbitMqClient>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = BTreeMap::new();

        checks.insert("database".to_string(), self.check_database().await);

        if let Some(redis) = &self.redis {
            checks.insert("cache_service".to_string(), Self::check_redis(redis).await);
        }

        if let Some(broker) = &self.broker {
            checks.insert("message_broker".to_string(), Self::check_broker(broker));
        }

        let breakers = self.breaker.get_status();
        for channel in Channel::DEFAULT_ORDER {
            let health = match breakers.get(&channel) {
                Some(status) => ServiceHealth::channel(status.is_open, status.failures),
                None => ServiceHealth::channel(false, 0),
            };
            checks.insert(format!("channel_{}", channel), health);
        }

        HealthCheckResponse {
            status: overall_status(&checks),
            timestamp: Utc::now(),
            checks,
        }
    }

    async fn check_database(&self) -> ServiceHealth {
        let start = Instant::now();

        match self.store.health_check().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Database health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                ServiceHealth::unhealthy(format!("Health check query failed: {}", e))
            }
        }
    }

    async fn check_redis(redis: &RedisClient) -> ServiceHealth {
        let start = Instant::now();

        match redis.ping().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Redis health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Redis ping failed");
                ServiceHealth::unhealthy(format!("Ping failed: {}", e))
            }
        }
    }

    fn check_broker(broker: &RabbitMqClient) -> ServiceHealth {
        if broker.is_connected() {
            ServiceHealth::healthy(0)
        } else {
            warn!("RabbitMQ connection lost");
            ServiceHealth::unhealthy("Connection closed".to_string())
        }
    }
}

/// Unhealthy if any dependency is down, degraded if any channel breaker is
/// open, healthy otherwise.
pub fn overall_status(checks: &BTreeMap<String, ServiceHealth>) -> HealthStatus {
    let critical_unhealthy = checks
        .iter()
        .filter(|(name, _)| CRITICAL_CHECKS.contains(&name.as_str()))
        .any(|(_, health)| health.status == HealthStatus::Unhealthy);

    if critical_unhealthy {
        return HealthStatus::Unhealthy;
    }

    if checks
        .values()
        .any(|health| health.status != HealthStatus::Healthy)
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
