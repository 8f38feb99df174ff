//! In-process stand-ins for the broker and the lock store, used by tests
//! that need real queue and lock semantics instead of call expectations.

use super::broker::{FetchedDelivery, sort_delivery};
use crate::models::queue_message::{QueueMessage, QueuedItem};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};
use uuid::Uuid;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Vec<u8>>,
    dead_letter: Vec<Vec<u8>>,
    unacked: HashMap<u64, Vec<u8>>,
    next_tag: u64,
}

#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    fetch_calls: AtomicUsize,
    reject_publishes: AtomicBool,
}

impl MemoryQueue {
    pub fn push_raw(&self, raw: &[u8]) {
        self.state.lock().unwrap().ready.push_back(raw.to_vec());
    }

    /// Makes every following publish fail as an unconfirmed write would
    pub fn reject_publishes(&self, reject: bool) {
        self.reject_publishes.store(reject, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn ready_messages(&self) -> Vec<QueueMessage> {
        let state = self.state.lock().unwrap();
        state
            .ready
            .iter()
            .map(|raw| QueueMessage::decode(raw).unwrap())
            .collect()
    }

    pub fn ready_len(&self) -> usize {
        self.state.lock().unwrap().ready.len()
    }

    pub fn dead_letter_raw(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().dead_letter.clone()
    }

    pub fn dead_letter_messages(&self) -> Vec<QueueMessage> {
        self.dead_letter_raw()
            .iter()
            .map(|raw| QueueMessage::decode(raw).unwrap())
            .collect()
    }

    pub fn unacked_count(&self) -> usize {
        self.state.lock().unwrap().unacked.len()
    }

    fn publish(&self, raw: Vec<u8>, dead_letter: bool) -> anyhow::Result<()> {
        if self.reject_publishes.load(Ordering::SeqCst) {
            bail!("broker nacked publish");
        }

        let mut state = self.state.lock().unwrap();
        if dead_letter {
            state.dead_letter.push(raw);
        } else {
            state.ready.push_back(raw);
        }
        Ok(())
    }
}

#[async_trait]
impl super::DurableQueue for MemoryQueue {
    async fn enqueue(&self, msg: &QueueMessage) -> anyhow::Result<()> {
        self.publish(msg.encode()?, false)
    }

    async fn reenqueue(&self, msg: &QueueMessage) -> anyhow::Result<()> {
        self.publish(msg.encode()?, false)
    }

    async fn enqueue_to_dead_letter(&self, msg: &QueueMessage) -> anyhow::Result<()> {
        self.publish(msg.encode()?, true)
    }

    async fn fetch_n(&self, max: u16) -> anyhow::Result<Vec<QueuedItem>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let rejecting = self.reject_publishes.load(Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let mut items: Vec<QueuedItem> = Vec::new();
        while items.len() < usize::from(max) {
            let Some(raw) = state.ready.pop_front() else {
                break;
            };

            state.next_tag += 1;
            let delivery_tag = state.next_tag;
            match sort_delivery(delivery_tag, raw.clone()) {
                FetchedDelivery::Ready(item) => {
                    state.unacked.insert(delivery_tag, raw);
                    items.push(item);
                }
                FetchedDelivery::Undecodable { raw, .. } if rejecting => {
                    // parking failed, everything goes back in its original order
                    state.ready.push_front(raw);
                    for item in items.iter().rev() {
                        if let Some(taken) = state.unacked.remove(&item.delivery_tag) {
                            state.ready.push_front(taken);
                        }
                    }
                    bail!("broker nacked publish");
                }
                FetchedDelivery::Undecodable { raw, .. } => state.dead_letter.push(raw),
            }
        }

        Ok(items)
    }

    async fn ack_message(&self, delivery_tag: u64) -> anyhow::Result<()> {
        self.state
            .lock()
            .unwrap()
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or_else(|| anyhow!("unknown delivery tag {delivery_tag}"))
    }

    async fn release_message(&self, delivery_tag: u64) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let raw = state
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| anyhow!("unknown delivery tag {delivery_tag}"))?;
        state.ready.push_front(raw);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryLocker {
    locks: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLocker {
    pub fn holder(&self, key: &str) -> Option<String> {
        let locks = self.locks.lock().unwrap();
        locks
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(token, _)| token.clone())
    }
}

#[async_trait]
impl super::Locker for MemoryLocker {
    async fn try_lock(&self, key: &str, ttl: Duration) -> anyhow::Result<Option<String>> {
        let mut locks = self.locks.lock().unwrap();
        let now = Instant::now();

        if locks
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at > now)
        {
            return Ok(None);
        }

        let token = Uuid::new_v4().to_string();
        locks.insert(key.to_string(), (token.clone(), now + ttl));
        Ok(Some(token))
    }

    async fn unlock(&self, key: &str, token: &str) -> anyhow::Result<()> {
        let mut locks = self.locks.lock().unwrap();
        if locks.get(key).is_some_and(|(holder, _)| holder == token) {
            locks.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{DurableQueue, Locker};

    #[ntex::test]
    async fn test_poison_message_is_dead_lettered_untouched() {
        let queue = MemoryQueue::default();
        let good = QueueMessage::new("billing", "POST", b"{}".to_vec());
        queue.push_raw(b"\x00garbage");
        queue.enqueue(&good).await.unwrap();

        let items = queue.fetch_n(10).await.unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].message, good);
        assert_eq!(queue.dead_letter_raw(), vec![b"\x00garbage".to_vec()]);
    }

    #[ntex::test]
    async fn test_failed_parking_hands_whole_batch_back() {
        let queue = MemoryQueue::default();
        let good = QueueMessage::new("billing", "POST", b"{}".to_vec());
        queue.enqueue(&good).await.unwrap();
        queue.push_raw(b"\x00garbage");
        queue.reject_publishes(true);

        assert!(queue.fetch_n(10).await.is_err());

        assert_eq!(queue.unacked_count(), 0);
        assert_eq!(queue.ready_len(), 2);
        assert!(queue.dead_letter_raw().is_empty());
    }

    #[ntex::test]
    async fn test_fetch_respects_max() {
        let queue = MemoryQueue::default();
        for _ in 0..5 {
            queue
                .enqueue(&QueueMessage::new("billing", "POST", b"{}".to_vec()))
                .await
                .unwrap();
        }

        assert_eq!(queue.fetch_n(3).await.unwrap().len(), 3);
        assert_eq!(queue.ready_messages().len(), 2);
        assert_eq!(queue.unacked_count(), 3);
    }

    #[ntex::test]
    async fn test_stale_token_cannot_unlock() {
        let locker = MemoryLocker::default();
        let stale = locker
            .try_lock("k", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let current = locker
            .try_lock("k", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        locker.unlock("k", &stale).await.unwrap();

        assert_eq!(locker.holder("k"), Some(current.clone()));
        assert_eq!(locker.try_lock("k", Duration::from_secs(30)).await.unwrap(), None);

        locker.unlock("k", &current).await.unwrap();
        assert_eq!(locker.holder("k"), None);
    }
}
