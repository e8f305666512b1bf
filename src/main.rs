use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use chrono::Utc;
use delivery_service::{
    api::{self, AppState},
    clients::{
        circuit_breaker::CircuitBreaker, database::DatabaseClient, fcm::FcmClient,
        health::HealthChecker, preferences::PreferenceGate, rbmq::RabbitMqClient,
        redis::RedisClient, sms::SmsClient, store::NotificationStore, whatsapp::WhatsAppClient,
    },
    config::Config,
    metrics::MetricsObserver,
    models::{attempt::FinalStatus, message::QueuedJob},
    orchestrator::DeliveryOrchestrator,
    queue::QueueFrontEnd,
    utils::{init_tracing, retry_with_backoff},
};
use futures_util::StreamExt;
use lapin::message::Delivery;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

struct Worker {
    broker: Arc<RabbitMqClient>,
    queue: Arc<QueueFrontEnd>,
    orchestrator: Arc<DeliveryOrchestrator>,
}

impl Worker {
    async fn handle(&self, delivery: Delivery) -> Result<(), Error> {
        let tag = delivery.delivery_tag;

        let job = match serde_json::from_slice::<QueuedJob>(&delivery.data) {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "Undecodable job, dropping");
                return self.broker.reject(tag, false).await;
            }
        };

        let expired = job.is_expired(Utc::now());

        // Resolving also clears the batch key, so later requests open a new
        // batch even when this job is dead-lettered.
        let job = match self.queue.resolve_batched(job.clone()).await {
            Ok(job) => job,
            Err(e) => {
                self.broker.acknowledge(tag).await?;
                let reason = format!("batch lookup failed: {}", e);
                self.queue.retry_or_dead_letter(job, &reason).await?;
                return Ok(());
            }
        };

        if expired {
            self.queue.dead_letter(job, "job expired before processing").await?;
            return self.broker.acknowledge(tag).await;
        }

        match self.queue.claim_job(&job).await {
            Ok(true) => {}
            Ok(false) => {
                self.broker.acknowledge(tag).await?;
                self.queue
                    .retry_or_dead_letter(job, "identical job already in flight")
                    .await?;
                return Ok(());
            }
            Err(e) => {
                self.broker.acknowledge(tag).await?;
                let reason = format!("job claim failed: {}", e);
                self.queue.retry_or_dead_letter(job, &reason).await?;
                return Ok(());
            }
        }

        let result = self
            .orchestrator
            .deliver_notification_at(&job.request, job.enqueued_at)
            .await;

        match result.final_status {
            FinalStatus::Delivered => info!(job_id = %job.job_id, "Job delivered"),
            FinalStatus::Skipped => info!(job_id = %job.job_id, "Job skipped"),
            FinalStatus::Failed => warn!(
                job_id = %job.job_id,
                attempts = result.attempts.len(),
                "Job exhausted every channel"
            ),
        }

        if let Err(e) = self.queue.release_job(&job).await {
            warn!(job_id = %job.job_id, error = %e, "Failed to release job claim");
        }

        self.broker.acknowledge(tag).await
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    init_tracing();

    let config = Config::load()?;
    let retry_config = config.retry_config();

    let database =
        retry_with_backoff(&retry_config, || DatabaseClient::connect(&config.database_url)).await?;
    database.migrate().await?;
    let database = Arc::new(database);

    let redis = Arc::new(retry_with_backoff(&retry_config, || RedisClient::connect(&config)).await?);
    let broker =
        Arc::new(retry_with_backoff(&retry_config, || RabbitMqClient::connect(&config)).await?);

    let store: Arc<dyn NotificationStore> = database.clone();
    let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker_config()));

    let orchestrator = DeliveryOrchestrator::new(
        store.clone(),
        database.clone(),
        breaker.clone(),
        config.dedup_config(),
        config.orchestrator_settings(),
    )
    .with_adapter(Arc::new(FcmClient::new(&config, database.clone()).await?))
    .with_adapter(Arc::new(WhatsAppClient::new(&config, database.clone())?))
    .with_adapter(Arc::new(SmsClient::new(&config, database.clone())?));
    let orchestrator = Arc::new(orchestrator);

    let queue = Arc::new(QueueFrontEnd::new(
        broker.clone(),
        redis.clone(),
        config.batch_window(),
    ));

    let state = Arc::new(AppState {
        health_checker: HealthChecker::new(store.clone(), breaker.clone())
            .with_redis(redis.clone())
            .with_broker(broker.clone()),
        breaker: breaker.clone(),
        metrics: MetricsObserver::new(store.clone(), queue.clone()),
        queue: queue.clone(),
        store: store.clone(),
        preferences: PreferenceGate::new(database.clone()),
    });

    let port = config.server_port;
    tokio::spawn(async move {
        if let Err(e) = api::run_api_server(state, port).await {
            error!(error = %e, "API server stopped");
        }
    });

    let worker = Arc::new(Worker {
        broker: broker.clone(),
        queue,
        orchestrator,
    });

    let semaphore = Arc::new(Semaphore::new(config.worker_concurrency.max(1)));
    let mut consumer = broker.create_consumer().await?;

    info!(concurrency = config.worker_concurrency, "Worker consuming notifications");

    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                error!(error = %e, "Consumer error");
                continue;
            }
        };

        let permit = semaphore.clone().acquire_owned().await?;
        let worker = worker.clone();

        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = worker.handle(delivery).await {
                error!(error = %e, "Job handling failed");
            }
        });
    }

    warn!("Consumer stream closed");
    Ok(())
}
