use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::error::CacheError;

/// Key of the hash holding a poll's option -> count mapping.
pub fn vote_table_key(poll_id: Uuid) -> String {
    format!("poll:{poll_id}:votes")
}

/// Companion lock key, scoped to counter table initialization only.
pub fn vote_table_lock_key(poll_id: Uuid) -> String {
    format!("poll:{poll_id}:votes:lock")
}

/// Fast key-value store holding the materialized vote counts per poll.
/// Rebuildable at any time from the authoritative store.
#[async_trait]
pub trait CounterCache: Send + Sync {
    async fn table_exists(&self, poll_id: Uuid) -> Result<bool, CacheError>;

    /// Full counter table, ordered by option id.
    async fn read_counts(&self, poll_id: Uuid) -> Result<Vec<(Uuid, i64)>, CacheError>;

    /// Replace the whole counter table in one atomic operation.
    async fn write_counts(&self, poll_id: Uuid, counts: &[(Uuid, i64)]) -> Result<(), CacheError>;

    /// Apply a compensating delta as one batched atomic operation: decrement
    /// the removed option (if a prior vote existed) and increment the added one.
    async fn apply_delta(
        &self,
        poll_id: Uuid,
        removed: Option<Uuid>,
        added: Uuid,
    ) -> Result<(), CacheError>;

    /// Try to take the initialization lock. `token` identifies the would-be
    /// holder; the lock expires after `ttl` so a crashed holder cannot wedge
    /// future callers. Returns whether the lock was acquired.
    async fn try_lock(
        &self,
        poll_id: Uuid,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    /// Release the initialization lock, but only if `token` still matches the
    /// current holder. Returns whether anything was released.
    async fn unlock(&self, poll_id: Uuid, token: &str) -> Result<bool, CacheError>;
}

const UNLOCK_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

pub struct ValkeyCounterCache {
    conn: ConnectionManager,
    unlock_script: redis::Script,
}

impl ValkeyCounterCache {
    pub fn new(conn: ConnectionManager) -> Self {
        ValkeyCounterCache {
            conn,
            unlock_script: redis::Script::new(UNLOCK_SCRIPT),
        }
    }
}

#[async_trait]
impl CounterCache for ValkeyCounterCache {
    async fn table_exists(&self, poll_id: Uuid) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(vote_table_key(poll_id)).await?;
        Ok(exists)
    }

    async fn read_counts(&self, poll_id: Uuid) -> Result<Vec<(Uuid, i64)>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, i64> = conn.hgetall(vote_table_key(poll_id)).await?;

        let mut counts = Vec::with_capacity(raw.len());
        for (field, count) in raw {
            let option_id = field
                .parse::<Uuid>()
                .map_err(|_| CacheError::Corrupt(field))?;
            counts.push((option_id, count));
        }
        counts.sort_by_key(|(option_id, _)| *option_id);
        Ok(counts)
    }

    async fn write_counts(&self, poll_id: Uuid, counts: &[(Uuid, i64)]) -> Result<(), CacheError> {
        let key = vote_table_key(poll_id);
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(&key).ignore();
        for (option_id, count) in counts {
            pipe.hset(&key, option_id.to_string(), *count).ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn apply_delta(
        &self,
        poll_id: Uuid,
        removed: Option<Uuid>,
        added: Uuid,
    ) -> Result<(), CacheError> {
        let key = vote_table_key(poll_id);
        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(removed) = removed {
            pipe.hincr(&key, removed.to_string(), -1).ignore();
        }
        pipe.hincr(&key, added.to_string(), 1).ignore();

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn try_lock(
        &self,
        poll_id: Uuid,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(vote_table_lock_key(poll_id))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    async fn unlock(&self, poll_id: Uuid, token: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .unlock_script
            .key(vote_table_lock_key(poll_id))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }
}

pub async fn init_valkey(valkey_url: &str) -> Result<ConnectionManager, redis::RedisError> {
    let client = redis::Client::open(valkey_url)?;
    client.get_connection_manager().await
}
