//! Async RabbitMQ publisher for delivery tasks.
//!
//! A single connection and channel are shared across tasks and re-established
//! lazily when the broker drops them.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, QueueDeclareOptions},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::types::{delivery_headers, delivery_queue_arguments, DeliveryTask};
use super::{EnqueueOutcome, TaskQueue};
use crate::error::Result;

/// Async RabbitMQ publisher with connection management.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    url: String,
    queue: String,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
}

impl Publisher {
    /// Create a publisher for `queue` on the broker at `url`. Connects on first use.
    pub fn new(url: String, queue: String) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                url,
                queue,
                connection: RwLock::new(None),
                channel: RwLock::new(None),
            }),
        }
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    /// Ensure we have a valid connection and channel.
    async fn ensure_connected(&self) -> anyhow::Result<Channel> {
        {
            let channel = self.inner.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        // Double-check after acquiring write lock
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        info!("rabbitmq_publisher_connecting");

        let conn = Connection::connect(&self.inner.url, ConnectionProperties::default())
            .await
            .context("Failed to connect to RabbitMQ")?;

        info!("rabbitmq_publisher_connected");

        let ch = conn
            .create_channel()
            .await
            .context("Failed to create channel")?;

        ch.queue_declare(
            &self.inner.queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            delivery_queue_arguments(),
        )
        .await
        .context("Failed to declare delivery queue")?;

        info!(queue = %self.inner.queue, "rabbitmq_queue_declared");

        *connection = Some(conn);
        *channel = Some(ch.clone());

        Ok(ch)
    }

    async fn publish(&self, task: &DeliveryTask) -> anyhow::Result<()> {
        let channel = self.ensure_connected().await?;

        let body = serde_json::to_vec(task).context("Failed to serialize delivery task")?;
        let key = task.dedup_key();
        let message_id = key.to_string();

        channel
            .basic_publish(
                "",
                &self.inner.queue,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into())
                    .with_message_id(message_id.clone().into())
                    .with_headers(delivery_headers(&key)),
            )
            .await
            .context("Failed to publish delivery task")?
            .await
            .context("Failed to confirm publish")?;

        debug!(
            queue = %self.inner.queue,
            message_id = %message_id,
            body_length = body.len(),
            "rabbitmq_delivery_published"
        );

        Ok(())
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_publisher_closed");
    }
}

#[async_trait]
impl TaskQueue for Publisher {
    /// Duplicates are dropped by the broker's dedup plugin without telling the
    /// publisher, so this always reports `Enqueued` on success.
    async fn enqueue(&self, task: &DeliveryTask) -> Result<EnqueueOutcome> {
        self.publish(task).await?;
        Ok(EnqueueOutcome::Enqueued)
    }
}
