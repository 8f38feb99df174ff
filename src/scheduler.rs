//! Periodic jobs that must run on at most one process at a time.
//!
//! Each tick tries a distributed lock sized to expire just before the next
//! tick. A busy lock means another process owns this tick and it is
//! skipped. The lock is released when the job returns, whatever the result.

use crate::{consts, metric, services::ImplLocker};
use async_trait::async_trait;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{sync::watch, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Proof of holding the lock for one tick
#[derive(Debug, Clone)]
pub struct LockLease {
    pub key: String,
    pub token: String,
    pub expires_at: Instant,
}

impl LockLease {
    /// Whether an operation lasting `duration` would finish before the lock expires
    pub fn has_time_for(&self, duration: Duration) -> bool {
        Instant::now() + duration < self.expires_at
    }
}

#[async_trait]
pub trait ExclusiveJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run_exclusive(&self, lease: &LockLease) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Completed,
    Failed,
    Skipped,
}

pub struct ExclusivePeriodicTask {
    interval: Duration,
    lock_key: String,
    locker: ImplLocker,
}

impl ExclusivePeriodicTask {
    pub fn new(interval: Duration, lock_key: &str, locker: ImplLocker) -> Self {
        Self {
            interval,
            lock_key: lock_key.to_string(),
            locker,
        }
    }

    /// Time left until the tick after `tick_started`, minus a safety margin
    pub fn lock_ttl(&self, tick_started: Instant, now: Instant) -> Duration {
        (tick_started + self.interval)
            .saturating_duration_since(now)
            .saturating_sub(consts::LOCK_TTL_MARGIN)
            .max(consts::MIN_LOCK_TTL)
    }

    pub async fn tick<J: ExclusiveJob + ?Sized>(&self, job: &J, tick_started: Instant) -> TickOutcome {
        let acquired_at = Instant::now();
        let ttl = self.lock_ttl(tick_started, acquired_at);

        let token = match self.locker.try_lock(&self.lock_key, ttl).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                tracing::debug!(job = job.name(), "lock held by another instance, skipping tick");
                metric::incr_worker_tick_statds("skipped");
                return TickOutcome::Skipped;
            }
            Err(e) => {
                tracing::warn!(job = job.name(), error = %e, "lock store unavailable, skipping tick");
                metric::incr_worker_tick_statds("skipped");
                return TickOutcome::Skipped;
            }
        };

        let lease = LockLease {
            key: self.lock_key.clone(),
            token,
            expires_at: acquired_at + ttl,
        };

        let outcome = match job.run_exclusive(&lease).await {
            Ok(()) => TickOutcome::Completed,
            Err(e) => {
                tracing::error!(job = job.name(), error = %e, "exclusive job failed");
                TickOutcome::Failed
            }
        };

        if let Err(e) = self.locker.unlock(&lease.key, &lease.token).await {
            // the TTL frees it anyway
            tracing::warn!(job = job.name(), error = %e, "failed to release lock");
        }

        metric::incr_worker_tick_statds(match outcome {
            TickOutcome::Completed => "completed",
            _ => "failed",
        });
        outcome
    }

    /// Ticks until `stop` turns true or `cancel` fires.
    ///
    /// Both are checked between ticks only, a tick in progress always
    /// runs to the end.
    pub async fn run<J: ExclusiveJob + ?Sized>(
        self,
        job: Arc<J>,
        mut stop: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) {
        if *stop.borrow() {
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            job = job.name(),
            interval_secs = self.interval.as_secs(),
            "periodic task started"
        );

        loop {
            let tick_started = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
                instant = ticker.tick() => instant.into_std(),
            };

            self.tick(job.as_ref(), tick_started)
                .instrument(logfire::span!("exclusive_tick"))
                .await;
        }

        tracing::info!(job = job.name(), "periodic task stopped");
    }
}
