//! Redis implementation of [`Locker`](super::Locker).
//!
//! Acquire is a single `SET key token NX PX ttl`. Release is a
//! compare-and-delete script, so a holder whose lock expired and was taken
//! by another process cannot delete the new holder's lock.

use anyhow::Context;
use async_trait::async_trait;
use redis::{Script, aio::ConnectionManager};
use std::time::Duration;
use uuid::Uuid;

const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

pub struct RedisLocker {
    connection: ConnectionManager,
    unlock_script: Script,
}

impl RedisLocker {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let connection = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;

        Ok(Self {
            connection,
            unlock_script: Script::new(UNLOCK_SCRIPT),
        })
    }
}

/// PX takes whole milliseconds and rejects 0
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl super::Locker for RedisLocker {
    async fn try_lock(&self, key: &str, ttl: Duration) -> anyhow::Result<Option<String>> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.connection.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to acquire lock {key}"))?;

        Ok(reply.map(|_| token))
    }

    async fn unlock(&self, key: &str, token: &str) -> anyhow::Result<()> {
        let mut conn = self.connection.clone();

        let released: i64 = self
            .unlock_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("failed to release lock {key}"))?;

        if released == 0 {
            tracing::debug!(key, "lock already expired or owned by another holder");
        }

        Ok(())
    }
}
