//! Forwarding of queued hooks to their downstream services.
//!
//! Every fetched message ends the tick in exactly one place: delivered,
//! back at the tail of the standard queue, in the dead-letter queue, or
//! released untouched to the broker. The original delivery is acked only
//! after the first three outcomes were confirmed by the broker, and it is
//! released only when no copy of it was published.

use crate::{
    auth::token::TokenManager,
    config::AppConfig,
    metric,
    models::queue_message::{QueueMessage, QueuedItem},
    scheduler::{ExclusiveJob, LockLease},
    services::{ImplDurableQueue, ImplHookSender},
};
use async_trait::async_trait;
use derive_more::{Display, Error};
use std::{sync::Arc, time::Duration};

#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub base_url: String,
    pub max_messages_per_tick: u16,
    /// Generic failures that send a message to the dead-letter queue
    pub max_retries: u32,
    /// 401/403 answers that send a message to the dead-letter queue, 0 = never
    pub auth_retry_ceiling: u32,
    pub http_timeout: Duration,
    pub publish_confirm_timeout: Duration,
}

impl DeliverySettings {
    pub fn from_config(app_config: &AppConfig) -> Self {
        Self {
            base_url: app_config.webhook_base_url.clone(),
            max_messages_per_tick: app_config.webhook_max_messages_per_tick,
            max_retries: app_config.webhook_max_retries,
            auth_retry_ceiling: app_config.webhook_auth_retry_ceiling,
            http_timeout: app_config.http_timeout(),
            publish_confirm_timeout: app_config.publish_confirm_timeout(),
        }
    }

    /// Worst case lock time of one item: the request, then the follow-up publish
    pub fn item_budget(&self) -> Duration {
        self.http_timeout + self.publish_confirm_timeout
    }
}

/// How the downstream service answered one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryAttempt {
    Delivered,
    /// 401 or 403, credentials or clocks are off on one side
    Rejected(u16),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Disposition {
    #[display("delivered")]
    Delivered,
    #[display("requeued")]
    Requeued,
    #[display("dead_lettered")]
    DeadLettered,
    #[display("released")]
    Released,
}

#[derive(Debug, Display, Error)]
pub enum SettleError {
    /// No copy was stored, the original is still the only one
    #[display("follow-up publish failed: {_0}")]
    Publish(#[error(not(source))] String),
    /// The outcome is stored, only the original could not be acked
    #[display("ack failed after the message was settled: {_0}")]
    Ack(#[error(not(source))] String),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub delivered: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    pub released: usize,
}

impl BatchSummary {
    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Delivered => self.delivered += 1,
            Disposition::Requeued => self.requeued += 1,
            Disposition::DeadLettered => self.dead_lettered += 1,
            Disposition::Released => self.released += 1,
        }
    }
}

pub struct DeliveryJob {
    queue: ImplDurableQueue,
    sender: ImplHookSender,
    token_manager: Arc<TokenManager>,
    settings: DeliverySettings,
}

impl DeliveryJob {
    pub fn new(
        queue: ImplDurableQueue,
        sender: ImplHookSender,
        token_manager: Arc<TokenManager>,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            queue,
            sender,
            token_manager,
            settings,
        }
    }

    fn delivery_url(&self, service_name: &str) -> String {
        format!(
            "{base}/{service_name}",
            base = self.settings.base_url.trim_end_matches('/')
        )
    }

    /// Drains one batch in fetch order.
    ///
    /// Items left once the lease cannot cover another request and its
    /// follow-up publish are released, so a second instance taking over the
    /// lock cannot deliver them twice.
    pub async fn deliver_batch(&self, lease: &LockLease) -> anyhow::Result<BatchSummary> {
        let items = self
            .queue
            .fetch_n(self.settings.max_messages_per_tick)
            .await?;
        let mut summary = BatchSummary::default();
        let mut items = items.into_iter();

        while let Some(item) = items.next() {
            if !lease.has_time_for(self.settings.item_budget()) {
                let remaining: Vec<QueuedItem> =
                    std::iter::once(item).chain(items.by_ref()).collect();
                tracing::warn!(
                    remaining = remaining.len(),
                    "lock lease almost over, releasing the rest of the batch"
                );
                for item in remaining {
                    self.release(item.delivery_tag, &mut summary).await;
                }
                break;
            }

            let delivery_tag = item.delivery_tag;
            match self.process(item).await {
                Ok(disposition) => summary.record(disposition),
                Err(SettleError::Publish(e)) => {
                    tracing::error!(delivery_tag, error = %e, "delivery could not be settled");
                    self.release(delivery_tag, &mut summary).await;
                }
                // releasing now would put a second copy next to the stored one
                Err(e @ SettleError::Ack(_)) => {
                    tracing::error!(delivery_tag, error = %e, "settled delivery left unacked");
                }
            }
        }

        Ok(summary)
    }

    async fn release(&self, delivery_tag: u64, summary: &mut BatchSummary) {
        match self.queue.release_message(delivery_tag).await {
            Ok(()) => {
                metric::incr_delivery_outcome_statds(&Disposition::Released.to_string());
                summary.record(Disposition::Released);
            }
            // rejects only fail on a closed channel, the broker requeues its unacked messages
            Err(e) => tracing::error!(delivery_tag, error = %e, "failed to release message"),
        }
    }

    /// Sends one message and settles it.
    ///
    /// [`SettleError::Publish`] means nothing was stored and the original
    /// was not acked. [`SettleError::Ack`] means the outcome is stored but the
    /// original is still pending.
    pub async fn process(&self, item: QueuedItem) -> Result<Disposition, SettleError> {
        let QueuedItem {
            delivery_tag,
            mut message,
        } = item;

        let disposition = match self.attempt(&message).await {
            DeliveryAttempt::Delivered => Disposition::Delivered,
            DeliveryAttempt::Rejected(status) => {
                tracing::warn!(
                    message_id = %message.id,
                    service_name = %message.service_name,
                    status,
                    "delivery rejected by receiver"
                );
                self.settle_rejected(&mut message)
                    .await
                    .map_err(|e| SettleError::Publish(e.to_string()))?
            }
            DeliveryAttempt::Failed(reason) => {
                tracing::warn!(
                    message_id = %message.id,
                    service_name = %message.service_name,
                    failed_count = message.failed_count,
                    reason = %reason,
                    "delivery failed"
                );
                self.settle_failed(&mut message)
                    .await
                    .map_err(|e| SettleError::Publish(e.to_string()))?
            }
        };

        self.queue
            .ack_message(delivery_tag)
            .await
            .map_err(|e| SettleError::Ack(e.to_string()))?;

        tracing::info!(
            message_id = %message.id,
            service_name = %message.service_name,
            disposition = %disposition,
            "delivery settled"
        );
        metric::incr_delivery_outcome_statds(&disposition.to_string());

        Ok(disposition)
    }

    async fn settle_rejected(&self, message: &mut QueueMessage) -> anyhow::Result<Disposition> {
        let ceiling = self.settings.auth_retry_ceiling;
        if ceiling > 0 && message.record_auth_failure() >= ceiling {
            self.queue.enqueue_to_dead_letter(message).await?;
            return Ok(Disposition::DeadLettered);
        }

        self.queue.reenqueue(message).await?;
        Ok(Disposition::Requeued)
    }

    async fn settle_failed(&self, message: &mut QueueMessage) -> anyhow::Result<Disposition> {
        if message.record_failure() >= self.settings.max_retries {
            self.queue.enqueue_to_dead_letter(message).await?;
            return Ok(Disposition::DeadLettered);
        }

        self.queue.reenqueue(message).await?;
        Ok(Disposition::Requeued)
    }

    pub async fn attempt(&self, message: &QueueMessage) -> DeliveryAttempt {
        let token = match self.token_manager.create_token(&message.service_name) {
            Ok(token) => token,
            Err(e) => return DeliveryAttempt::Failed(e.to_string()),
        };

        let url = self.delivery_url(&message.service_name);
        match self.sender.post_json(&url, &token, &message.body).await {
            Ok(status) if (200..300).contains(&status) => DeliveryAttempt::Delivered,
            Ok(status @ (401 | 403)) => DeliveryAttempt::Rejected(status),
            Ok(status) => DeliveryAttempt::Failed(format!("receiver answered {status}")),
            Err(e) => DeliveryAttempt::Failed(e.to_string()),
        }
    }
}

#[async_trait]
impl ExclusiveJob for DeliveryJob {
    fn name(&self) -> &str {
        "webhook_delivery"
    }

    async fn run_exclusive(&self, lease: &LockLease) -> anyhow::Result<()> {
        let summary = self.deliver_batch(lease).await?;

        tracing::info!(
            delivered = summary.delivered,
            requeued = summary.requeued,
            dead_lettered = summary.dead_lettered,
            released = summary.released,
            "delivery tick finished"
        );

        Ok(())
    }
}
