pub mod broker;
pub mod dispatcher;
pub mod lock;
#[cfg(test)]
pub mod memory;
pub mod rate_limit;

use crate::models::queue_message::{QueueMessage, QueuedItem};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};

/// Broker-backed standard and dead-letter queues.
///
/// Every publish returns only once the broker confirmed it, an `Err` means
/// the caller cannot assume the message was stored.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DurableQueue: Send + Sync {
    async fn enqueue(&self, msg: &QueueMessage) -> anyhow::Result<()>;

    /// Puts a (possibly updated) message back at the tail of the standard queue
    async fn reenqueue(&self, msg: &QueueMessage) -> anyhow::Result<()>;

    async fn enqueue_to_dead_letter(&self, msg: &QueueMessage) -> anyhow::Result<()>;

    /// Takes up to `max` messages without acking them.
    /// Undecodable bodies are moved to the dead-letter queue and skipped.
    /// On `Err` every message taken so far is handed back to the queue.
    async fn fetch_n(&self, max: u16) -> anyhow::Result<Vec<QueuedItem>>;

    async fn ack_message(&self, delivery_tag: u64) -> anyhow::Result<()>;

    /// Hands an unprocessed message back to the broker untouched
    async fn release_message(&self, delivery_tag: u64) -> anyhow::Result<()>;
}

/// Cluster-wide mutual exclusion with TTL auto-release.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Locker: Send + Sync {
    /// Returns the holder token, or `None` when somebody else holds `key`.
    /// Never waits for the lock.
    async fn try_lock(&self, key: &str, ttl: Duration) -> anyhow::Result<Option<String>>;

    /// Releases `key` only if `token` still identifies the holder
    async fn unlock(&self, key: &str, token: &str) -> anyhow::Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HookSender: Send + Sync {
    /// Posts a JSON body with a bearer token and returns the response status
    async fn post_json(&self, url: &str, bearer_token: &str, body: &[u8]) -> anyhow::Result<u16>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Throttled { retry_after: Duration },
}

#[cfg_attr(test, mockall::automock)]
pub trait RateLimiter: Send + Sync {
    fn check(&self, key: &str) -> RateLimitDecision;
}

pub type ImplDurableQueue = Arc<dyn DurableQueue>;
pub type ImplLocker = Arc<dyn Locker>;
pub type ImplHookSender = Arc<dyn HookSender>;
pub type ImplRateLimiter = Arc<dyn RateLimiter>;
