//! RabbitMQ-backed job queue.
//!
//! The ingestion queue and its `<name>.dead_letter` companion are declared durable and every
//! message is published persistent with publisher confirms, so `publish` only returns once the
//! broker owns the message. Each consumer gets its own channel with `basic_qos(prefetch)`.
//! Requeueing publishes the updated copy (confirmed) before acknowledging the original, so a
//! crash in between duplicates the message rather than losing it. A delivery dropped without
//! being settled is nacked with `requeue`, which hands it back to the broker for redelivery and
//! frees its prefetch slot.

use super::{DeadLetter, Delivery, JobConsumer, JobMessage, JobQueue, QueueError};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
};
use std::sync::Arc;
use uuid::Uuid;

const PERSISTENT: u8 = 2;

/// Durable queue on an AMQP 0-9-1 broker.
pub struct AmqpQueue {
    connection: Connection,
    publisher: Arc<Channel>,
    queue_name: String,
    dead_letter_name: String,
}

impl AmqpQueue {
    /// Connect to the broker and declare the job and dead-letter queues.
    pub async fn connect(url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let publisher = connection.create_channel().await?;
        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        let dead_letter_name = format!("{queue_name}.dead_letter");
        for name in [queue_name, dead_letter_name.as_str()] {
            declare_durable(&publisher, name).await?;
        }
        tracing::info!(queue = queue_name, "Connected to job broker");

        Ok(Self {
            connection,
            publisher: Arc::new(publisher),
            queue_name: queue_name.to_string(),
            dead_letter_name,
        })
    }
}

async fn declare_durable(channel: &Channel, name: &str) -> Result<(), QueueError> {
    channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

async fn publish_confirmed(
    channel: &Channel,
    routing_key: &str,
    payload: &[u8],
) -> Result<(), QueueError> {
    let confirmation = channel
        .basic_publish(
            "",
            routing_key,
            BasicPublishOptions::default(),
            payload,
            BasicProperties::default()
                .with_delivery_mode(PERSISTENT)
                .with_content_type("application/json".into()),
        )
        .await?
        .await?;
    if confirmation.is_nack() {
        return Err(QueueError::NotConfirmed);
    }
    Ok(())
}

#[async_trait]
impl JobQueue for AmqpQueue {
    async fn publish(&self, message: &JobMessage) -> Result<(), QueueError> {
        let payload = message.to_bytes()?;
        publish_confirmed(&self.publisher, &self.queue_name, &payload).await?;
        tracing::debug!(job_id = %message.job_id, queue = %self.queue_name, "Published job");
        Ok(())
    }

    async fn publish_dead_letter(&self, letter: &DeadLetter) -> Result<(), QueueError> {
        let payload = serde_json::to_vec(letter).map_err(QueueError::Encode)?;
        publish_confirmed(&self.publisher, &self.dead_letter_name, &payload).await
    }

    async fn consumer(&self, prefetch: u16) -> Result<Box<dyn JobConsumer>, QueueError> {
        let channel = self.connection.create_channel().await?;
        channel
            .basic_qos(prefetch.max(1), BasicQosOptions::default())
            .await?;
        let tag = format!("docstream-{}", Uuid::new_v4().simple());
        let consumer = channel
            .basic_consume(
                &self.queue_name,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        tracing::debug!(consumer = %tag, prefetch, "Opened broker consumer");

        Ok(Box::new(AmqpConsumer {
            _channel: channel,
            consumer,
            publisher: self.publisher.clone(),
            queue_name: self.queue_name.clone(),
        }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.connection.close(200, "shutdown").await?;
        tracing::info!("Closed broker connection");
        Ok(())
    }
}

struct AmqpConsumer {
    _channel: Channel,
    consumer: lapin::Consumer,
    publisher: Arc<Channel>,
    queue_name: String,
}

#[async_trait]
impl JobConsumer for AmqpConsumer {
    async fn next_delivery(&mut self) -> Result<Option<Box<dyn Delivery>>, QueueError> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(Box::new(AmqpDelivery {
                inner: delivery,
                settled: false,
                publisher: self.publisher.clone(),
                queue_name: self.queue_name.clone(),
            }))),
            Some(Err(err)) => Err(err.into()),
            None => Ok(None),
        }
    }
}

struct AmqpDelivery {
    inner: lapin::message::Delivery,
    settled: bool,
    publisher: Arc<Channel>,
    queue_name: String,
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn payload(&self) -> &[u8] {
        &self.inner.data
    }

    fn redelivered(&self) -> bool {
        self.inner.redelivered
    }

    async fn ack(&mut self) -> Result<(), QueueError> {
        if self.settled {
            return Err(QueueError::AlreadySettled);
        }
        self.inner.acker.ack(BasicAckOptions::default()).await?;
        self.settled = true;
        Ok(())
    }

    async fn requeue(&mut self, updated: &JobMessage) -> Result<(), QueueError> {
        if self.settled {
            return Err(QueueError::AlreadySettled);
        }
        let payload = updated.to_bytes()?;
        publish_confirmed(&self.publisher, &self.queue_name, &payload).await?;
        self.inner.acker.ack(BasicAckOptions::default()).await?;
        self.settled = true;
        Ok(())
    }
}

impl Drop for AmqpDelivery {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let delivery_tag = self.inner.delivery_tag;
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(delivery_tag, "Unsettled delivery dropped outside the runtime");
            return;
        };
        let acker = self.inner.acker.clone();
        handle.spawn(async move {
            let options = BasicNackOptions {
                requeue: true,
                ..BasicNackOptions::default()
            };
            if let Err(err) = acker.nack(options).await {
                tracing::warn!(delivery_tag, error = %err, "Failed to return unsettled delivery");
            }
        });
    }
}
