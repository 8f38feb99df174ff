//! AMQP implementation of [`DurableQueue`](super::DurableQueue).
//!
//! Two channels share one connection:
//! - the publish channel runs in confirm mode and is guarded by a mutex, so
//!   only one publish-and-confirm unit is in flight at a time;
//! - the fetch channel pulls messages with manual ack. Delivery tags are
//!   channel scoped, acks and releases go through the same channel.

use crate::{
    consts,
    models::queue_message::{QueueMessage, QueuedItem},
};
use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    options::{
        BasicAckOptions, BasicGetOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
};
use std::time::Duration;
use tokio::sync::Mutex;

const PERSISTENT_DELIVERY_MODE: u8 = 2;

pub struct AmqpQueue {
    // kept alive for the channels below
    _connection: Connection,
    publish_channel: Mutex<Channel>,
    fetch_channel: Channel,
    queue_name: String,
    dead_letter_queue_name: String,
    confirm_timeout: Duration,
}

impl AmqpQueue {
    pub async fn connect(
        uri: &str,
        queue_name: &str,
        dead_letter_queue_name: &str,
        confirm_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .context("failed to connect to the AMQP broker")?;

        let publish_channel = connection.create_channel().await?;
        publish_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .context("failed to enable publisher confirms")?;

        for name in [queue_name, dead_letter_queue_name] {
            publish_channel
                .queue_declare(
                    name,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .with_context(|| format!("failed to declare queue {name}"))?;
        }

        let fetch_channel = connection.create_channel().await?;

        tracing::info!(
            queue = queue_name,
            dead_letter_queue = dead_letter_queue_name,
            "connected to AMQP broker"
        );

        Ok(Self {
            _connection: connection,
            publish_channel: Mutex::new(publish_channel),
            fetch_channel,
            queue_name: queue_name.to_string(),
            dead_letter_queue_name: dead_letter_queue_name.to_string(),
            confirm_timeout,
        })
    }

    /// Publishes a persistent message and waits for the broker confirm.
    ///
    /// The deadline covers waiting for the channel too.
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> anyhow::Result<()> {
        let publish_and_confirm = async {
            let channel = self.publish_channel.lock().await;
            let confirm = channel
                .basic_publish(
                    "",
                    routing_key,
                    BasicPublishOptions {
                        mandatory: true,
                        ..Default::default()
                    },
                    payload,
                    BasicProperties::default()
                        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
                        .with_content_type(consts::JSON_CONTENT_TYPE.into()),
                )
                .await?;
            confirm.await
        };

        let confirmation =
            within_confirm_deadline(self.confirm_timeout, routing_key, publish_and_confirm).await?;

        match confirmation {
            Confirmation::Ack(None) => Ok(()),
            Confirmation::Ack(Some(_)) => bail!("publish to {routing_key} was not routed to any queue"),
            Confirmation::Nack(_) => bail!("broker nacked publish to {routing_key}"),
            Confirmation::NotRequested => bail!("publish channel is not in confirm mode"),
        }
    }

    async fn publish_message(&self, routing_key: &str, msg: &QueueMessage) -> anyhow::Result<()> {
        self.publish(routing_key, &msg.encode()?).await
    }

    async fn fill_batch(&self, max: u16, items: &mut Vec<QueuedItem>) -> anyhow::Result<()> {
        self.fetch_channel
            .basic_qos(max, BasicQosOptions::default())
            .await?;

        while items.len() < usize::from(max) {
            let Some(fetched) = self
                .fetch_channel
                .basic_get(&self.queue_name, BasicGetOptions { no_ack: false })
                .await?
            else {
                break;
            };

            let delivery_tag = fetched.delivery.delivery_tag;
            match sort_delivery(delivery_tag, fetched.delivery.data) {
                FetchedDelivery::Ready(item) => items.push(item),
                FetchedDelivery::Undecodable { delivery_tag, raw } => {
                    self.park_undecodable(delivery_tag, &raw).await?
                }
            }
        }

        Ok(())
    }

    /// Moves a poison message to the dead-letter queue byte for byte
    async fn park_undecodable(&self, delivery_tag: u64, raw: &[u8]) -> anyhow::Result<()> {
        if let Err(e) = self.publish(&self.dead_letter_queue_name, raw).await {
            self.requeue(delivery_tag).await;
            return Err(e);
        }

        self.fetch_channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .with_context(|| format!("failed to ack undecodable delivery {delivery_tag}"))
    }

    async fn requeue(&self, delivery_tag: u64) {
        if let Err(e) = self
            .fetch_channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue: true })
            .await
        {
            tracing::error!(delivery_tag, error = %e, "failed to hand delivery back to the queue");
        }
    }
}

/// What a fetched delivery turned out to be
#[derive(Debug)]
pub enum FetchedDelivery {
    Ready(QueuedItem),
    /// Never decodable, parked in the dead-letter queue as received
    Undecodable { delivery_tag: u64, raw: Vec<u8> },
}

/// Bounds one publish, waiting for the channel included, by the confirm timeout
async fn within_confirm_deadline<T, E>(
    deadline: Duration,
    routing_key: &str,
    publish: impl Future<Output = Result<T, E>>,
) -> anyhow::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    tokio::time::timeout(deadline, publish)
        .await
        .map_err(|_| {
            anyhow!(
                "broker did not confirm publish to {routing_key} within {}ms",
                deadline.as_millis()
            )
        })?
        .with_context(|| format!("failed to publish to {routing_key}"))
}

/// Decodes a delivery body, or keeps its exact bytes for the dead-letter queue
pub fn sort_delivery(delivery_tag: u64, raw: Vec<u8>) -> FetchedDelivery {
    match QueueMessage::decode(&raw) {
        Ok(message) => FetchedDelivery::Ready(QueuedItem {
            delivery_tag,
            message,
        }),
        Err(e) => {
            tracing::warn!(
                delivery_tag,
                error = %e,
                "undecodable message, parking it in the dead-letter queue"
            );
            FetchedDelivery::Undecodable { delivery_tag, raw }
        }
    }
}

#[async_trait]
impl super::DurableQueue for AmqpQueue {
    async fn enqueue(&self, msg: &QueueMessage) -> anyhow::Result<()> {
        self.publish_message(&self.queue_name, msg).await
    }

    async fn reenqueue(&self, msg: &QueueMessage) -> anyhow::Result<()> {
        self.publish_message(&self.queue_name, msg).await
    }

    async fn enqueue_to_dead_letter(&self, msg: &QueueMessage) -> anyhow::Result<()> {
        self.publish_message(&self.dead_letter_queue_name, msg).await
    }

    async fn fetch_n(&self, max: u16) -> anyhow::Result<Vec<QueuedItem>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let mut items = Vec::with_capacity(usize::from(max));
        if let Err(e) = self.fill_batch(max, &mut items).await {
            // the fetch channel stays open, anything not handed back stays pending
            for item in &items {
                self.requeue(item.delivery_tag).await;
            }
            return Err(e);
        }

        Ok(items)
    }

    async fn ack_message(&self, delivery_tag: u64) -> anyhow::Result<()> {
        self.fetch_channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .with_context(|| format!("failed to ack delivery {delivery_tag}"))
    }

    async fn release_message(&self, delivery_tag: u64) -> anyhow::Result<()> {
        self.fetch_channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue: true })
            .await
            .with_context(|| format!("failed to release delivery {delivery_tag}"))
    }
}
