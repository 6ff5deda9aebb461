//! RabbitMQ consumer module using lapin.
//!
//! Connects to RabbitMQ, consumes delivery tasks and spawns one async task
//! per message. Each message is acknowledged only after its email was sent.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection, ConnectionProperties,
};
use tracing::{error, info, warn};

use newsletter::delivery::DeliveryWorker;
use newsletter::queue::{delivery_queue_arguments, DeliveryTask, Lease};
use newsletter::util::shutdown_signal;
use newsletter::Config;

/// Ack/nack handle for one broker delivery.
struct AmqpLease {
    channel: Arc<Channel>,
    delivery_tag: u64,
}

#[async_trait]
impl Lease for AmqpLease {
    async fn complete(&self) -> newsletter::Result<()> {
        self.channel
            .basic_ack(self.delivery_tag, BasicAckOptions::default())
            .await
            .context("Failed to ack delivery")?;
        Ok(())
    }

    async fn abandon(&self, requeue: bool) -> newsletter::Result<()> {
        self.channel
            .basic_nack(
                self.delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .context("Failed to nack delivery")?;
        Ok(())
    }
}

/// Run the RabbitMQ consumer.
///
/// This function:
/// 1. Connects to RabbitMQ using the configured URL
/// 2. Sets QoS prefetch to the worker concurrency
/// 3. Declares the delivery queue (idempotent, same arguments as the publisher)
/// 4. Starts consuming messages, spawning a task for each
/// 5. Handles graceful shutdown on SIGINT/SIGTERM
pub async fn run(config: Arc<Config>, worker: Arc<DeliveryWorker>) -> Result<()> {
    let queue = config.delivery_queue.as_str();

    info!(url_length = config.amqp_url.len(), "rabbitmq_connecting");

    let conn = Connection::connect(&config.amqp_url, ConnectionProperties::default())
        .await
        .context("Failed to connect to RabbitMQ")?;

    info!("rabbitmq_connected");

    let channel = conn.create_channel().await.context("Failed to create channel")?;

    let prefetch_count = u16::try_from(config.worker_concurrency).unwrap_or(u16::MAX);
    channel
        .basic_qos(prefetch_count, BasicQosOptions::default())
        .await
        .context("Failed to set QoS")?;

    info!(prefetch_count = prefetch_count, "rabbitmq_qos_set");

    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            delivery_queue_arguments(),
        )
        .await
        .context("Failed to declare queue")?;

    info!(queue = queue, "rabbitmq_queue_declared");

    let mut consumer = channel
        .basic_consume(
            queue,
            "newsletter-worker",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("Failed to start consumer")?;

    info!(queue = queue, "rabbitmq_consumer_started");
    info!("worker_ready");

    let channel = Arc::new(channel);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("worker_stopping");
                break;
            }
            delivery = consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        let delivery_tag = delivery.delivery_tag;
                        let message_id = delivery
                            .properties
                            .message_id()
                            .as_ref()
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "unknown".to_string());

                        info!(
                            queue = queue,
                            message_id = %message_id,
                            delivery_tag = delivery_tag,
                            redelivered = delivery.redelivered,
                            "rabbitmq_task_received"
                        );

                        let lease = AmqpLease {
                            channel: Arc::clone(&channel),
                            delivery_tag,
                        };
                        let worker = Arc::clone(&worker);

                        tokio::spawn(async move {
                            let task: Result<DeliveryTask, _> = serde_json::from_slice(&delivery.data);

                            match task {
                                Ok(task) => {
                                    match worker.process(&task, &lease).await {
                                        Ok(outcome) => info!(
                                            message_id = %message_id,
                                            outcome = ?outcome,
                                            "rabbitmq_task_completed"
                                        ),
                                        Err(e) => warn!(
                                            message_id = %message_id,
                                            retryable = e.is_retryable(),
                                            error = %e,
                                            "rabbitmq_task_failed"
                                        ),
                                    }
                                }
                                Err(e) => {
                                    error!(
                                        message_id = %message_id,
                                        error = %e,
                                        "rabbitmq_task_parse_failed"
                                    );

                                    // Undecodable payloads never become valid; dead-letter them
                                    if let Err(nack_err) = lease.abandon(false).await {
                                        error!(
                                            delivery_tag = delivery_tag,
                                            error = %nack_err,
                                            "rabbitmq_nack_failed"
                                        );
                                    }
                                }
                            }
                        });
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "rabbitmq_delivery_error");
                    }
                    None => {
                        warn!("rabbitmq_consumer_closed");
                        break;
                    }
                }
            }
        }
    }

    info!("worker_shutdown_complete");
    Ok(())
}
