use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
};
use tracing::{debug, info};

use crate::{
    clients::store::JobQueue,
    config::Config,
    models::{
        message::{DlqMessage, QueuedJob},
        request::QueuePolicy,
    },
};

const MAX_PRIORITY: i32 = 10;
const DELAY_QUEUE_IDLE_MS: u64 = 60_000;

fn job_properties(job: &QueuedJob, policy: &QueuePolicy) -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(2)
        .with_content_type("application/json".into())
        .with_message_id(job.job_id.to_string().into())
        .with_correlation_id(job.idempotency_key.as_str().into())
        .with_priority(policy.amqp_priority())
}

pub struct RabbitMqClient {
    connection: Connection,
    channel: Channel,
    queue_name: String,
    failed_queue_name: String,
}

impl RabbitMqClient {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        info!("Connecting to RabbitMQ");

        let connection = Connection::connect(&config.rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(|_| anyhow!("Failed to connect to RabbitMQ"))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|_| anyhow!("RabbitMQ channel creation failed"))?;

        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|_| anyhow!("Failed to set up QoS"))?;

        channel
            .queue_declare(
                &config.failed_queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|_| anyhow!("Failed to declare failed queue"))?;

        // No broker-side TTL here: expiry is checked by the worker, so the
        // failed queue only ever holds `DlqMessage` bodies.
        let mut arguments = FieldTable::default();
        arguments.insert("x-max-priority".into(), AMQPValue::LongInt(MAX_PRIORITY));

        channel
            .queue_declare(
                &config.queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|_| anyhow!("Failed to declare notification queue"))?;

        info!(
            queue = %config.queue_name,
            failed_queue = %config.failed_queue_name,
            "RabbitMQ queues declared"
        );

        Ok(Self {
            connection,
            channel,
            queue_name: config.queue_name.clone(),
            failed_queue_name: config.failed_queue_name.clone(),
        })
    }

    /// Holding queue for one delay length. Messages sit out the queue TTL and
    /// are dead-lettered into the main queue. One queue per length keeps a long
    /// delay from blocking a shorter one behind it.
    async fn declare_delay_queue(&self, delay_ms: u64) -> Result<String, Error> {
        let name = format!("{}.delay.{}", self.queue_name, delay_ms);

        let mut arguments = FieldTable::default();
        arguments.insert("x-message-ttl".into(), AMQPValue::LongLongInt(delay_ms as i64));
        arguments.insert(
            "x-expires".into(),
            AMQPValue::LongLongInt((delay_ms * 2 + DELAY_QUEUE_IDLE_MS) as i64),
        );
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString("".into()),
        );
        arguments.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(self.queue_name.as_str().into()),
        );

        self.channel
            .queue_declare(
                &name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|_| anyhow!("Failed to declare delay queue {}", name))?;

        Ok(name)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn create_consumer(&self) -> Result<Consumer, Error> {
        let consumer = self
            .channel
            .basic_consume(
                &self.queue_name,
                "delivery_worker",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|_| anyhow!("Failed to create consumer"))?;

        info!(queue = %self.queue_name, "Consumer created");

        Ok(consumer)
    }

    pub async fn acknowledge(&self, delivery_tag: u64) -> Result<(), Error> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|_| anyhow!("Failed to acknowledge message"))?;

        Ok(())
    }

    pub async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|_| anyhow!("Failed to reject message"))?;

        Ok(())
    }
}

#[async_trait]
impl JobQueue for RabbitMqClient {
    async fn publish(&self, job: &QueuedJob, policy: &QueuePolicy) -> Result<()> {
        let payload = serde_json::to_vec(job)?;

        self.channel
            .basic_publish(
                "",
                &self.queue_name,
                BasicPublishOptions::default(),
                &payload,
                job_properties(job, policy),
            )
            .await
            .map_err(|_| anyhow!("Failed to publish job"))?;

        debug!(job_id = %job.job_id, attempt = job.attempt, "Job published");
        Ok(())
    }

    async fn publish_delayed(
        &self,
        job: &QueuedJob,
        policy: &QueuePolicy,
        delay: Duration,
    ) -> Result<()> {
        let delay_ms = delay.as_millis() as u64;
        if delay_ms == 0 {
            return self.publish(job, policy).await;
        }

        let delay_queue = self.declare_delay_queue(delay_ms).await?;
        let payload = serde_json::to_vec(job)?;

        self.channel
            .basic_publish(
                "",
                &delay_queue,
                BasicPublishOptions::default(),
                &payload,
                job_properties(job, policy),
            )
            .await
            .map_err(|_| anyhow!("Failed to publish delayed job"))?;

        debug!(job_id = %job.job_id, attempt = job.attempt, delay_ms, "Job published with delay");
        Ok(())
    }

    async fn publish_dead_letter(&self, message: &DlqMessage) -> Result<()> {
        let payload = serde_json::to_vec(message)?;

        self.channel
            .basic_publish(
                "",
                &self.failed_queue_name,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(|_| anyhow!("Failed to publish message to dlq"))?;

        Ok(())
    }
}
