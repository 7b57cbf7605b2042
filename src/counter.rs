use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::CounterCache;
use crate::db::PollStore;
use crate::error::CacheError;

/// Expiry on the initialization lock. A holder that crashes mid-populate
/// stops blocking everyone else once this elapses.
const LOCK_TTL: Duration = Duration::from_secs(10);

/// How long a loser waits before re-checking whether the winner finished.
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Ceiling on lock-acquisition attempts before we give up and report the
/// cache unavailable instead of spinning forever.
const MAX_ATTEMPTS: u32 = 20;

/// Make sure the poll's counter table exists in the cache, populating it from
/// the authoritative store on exactly one caller's effort.
///
/// The hot path is a single lock-free existence check. On a cold poll, callers
/// race for a token-holding lock; the winner double-checks existence, writes
/// the full zero-filled table in one operation and releases the lock it (and
/// only it) acquired. Losers sleep, re-check existence and retry until the
/// table appears or the attempt ceiling is hit.
pub async fn ensure_vote_table(
    poll_id: Uuid,
    store: &dyn PollStore,
    cache: &dyn CounterCache,
) -> Result<(), CacheError> {
    if cache.table_exists(poll_id).await? {
        return Ok(());
    }

    let token = Uuid::new_v4().to_string();

    for attempt in 0..MAX_ATTEMPTS {
        if cache.try_lock(poll_id, &token, LOCK_TTL).await? {
            let result = populate_if_absent(poll_id, store, cache).await;

            // Token-matched release: only the holder can free the lock, and a
            // TTL-expired lock that someone else re-acquired stays theirs.
            match cache.unlock(poll_id, &token).await {
                Ok(false) => warn!(%poll_id, "init lock expired before release"),
                Err(e) => warn!(%poll_id, error = %e, "failed to release init lock"),
                Ok(true) => {}
            }
            return result;
        }

        // Lost the race. Never touch the lock; wait for the winner instead.
        debug!(%poll_id, attempt, "waiting for counter table initialization");
        tokio::time::sleep(RETRY_DELAY).await;
        if cache.table_exists(poll_id).await? {
            return Ok(());
        }
    }

    warn!(%poll_id, "counter table initialization retries exhausted");
    Err(CacheError::Unavailable)
}

async fn populate_if_absent(
    poll_id: Uuid,
    store: &dyn PollStore,
    cache: &dyn CounterCache,
) -> Result<(), CacheError> {
    // Double check: the table may have appeared between the first existence
    // check and winning the lock.
    if cache.table_exists(poll_id).await? {
        return Ok(());
    }

    let counts = store.read_vote_counts(poll_id).await?;
    cache.write_counts(poll_id, &counts).await?;
    debug!(%poll_id, options = counts.len(), "counter table populated");
    Ok(())
}
