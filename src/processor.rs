use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::CounterCache;
use crate::counter::ensure_vote_table;
use crate::db::PollStore;
use crate::error::{CacheError, StoreError};
use crate::events::{EventConsumer, VoteEvent};
use crate::notify::{ChangeNotification, NotificationPublisher};

/// Attempts at the cache write after the store transaction has committed.
/// The two stores drift if this is dropped silently, so exhausting the
/// retries leaves the event unacknowledged for redelivery.
const CACHE_WRITE_ATTEMPTS: u32 = 3;
const CACHE_WRITE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Pause after a failed event before re-reading the log, so a struggling
/// backend is not hammered.
const FAILURE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

enum CacheWrite {
    /// Overwrite the whole table with counts re-derived from the store.
    Overwrite(Vec<(Uuid, i64)>),
    /// Compensating delta: decrement the replaced option, increment the new.
    Delta { removed: Option<Uuid> },
}

/// Turns the at-least-once vote event stream into consistent aggregate
/// counters: authoritative write, compensating cache delta, then one full
/// snapshot notification per event.
pub struct VoteProcessor {
    store: Arc<dyn PollStore>,
    cache: Arc<dyn CounterCache>,
    publisher: Arc<dyn NotificationPublisher>,
    commit_interval: Duration,
}

impl VoteProcessor {
    pub fn new(
        store: Arc<dyn PollStore>,
        cache: Arc<dyn CounterCache>,
        publisher: Arc<dyn NotificationPublisher>,
        commit_interval: Duration,
    ) -> Self {
        VoteProcessor {
            store,
            cache,
            publisher,
            commit_interval,
        }
    }

    /// Consume the event log until the task is cancelled. Progress is
    /// committed periodically, not per message. A failed event stops the
    /// current batch (per-poll delivery order must hold) and rewinds the
    /// consumer so the uncommitted tail is redelivered.
    pub async fn run(&self, mut consumer: Box<dyn EventConsumer>) {
        info!("vote processor started");
        let mut last_commit = Instant::now();

        loop {
            let batch = match consumer.next_batch().await {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, "failed to read vote events");
                    tokio::time::sleep(FAILURE_BACKOFF).await;
                    continue;
                }
            };

            for logged in batch {
                match self.process_vote(&logged.event).await {
                    Ok(()) => consumer.mark_processed(&logged.entry_id),
                    Err(e) => {
                        error!(
                            entry_id = %logged.entry_id,
                            poll_id = %logged.event.poll_id,
                            error = %e,
                            "vote processing failed, event will be redelivered"
                        );
                        // Later events for the same poll must not overtake
                        // this one.
                        commit_progress(consumer.as_mut()).await;
                        consumer.rewind();
                        tokio::time::sleep(FAILURE_BACKOFF).await;
                        break;
                    }
                }
            }

            if last_commit.elapsed() >= self.commit_interval {
                commit_progress(consumer.as_mut()).await;
                last_commit = Instant::now();
            }
        }
    }

    /// Process one vote event end to end.
    ///
    /// Replays are detected by their signature: the store transaction reports
    /// the replaced vote pointing at the very option being voted for. The
    /// compensating delta would then be a net zero even if the original delta
    /// was lost in a crash window, so instead of trusting the cache we
    /// re-derive absolute counts from the store and overwrite the table. A
    /// genuine re-vote for the same option takes the same (slightly costlier,
    /// always safe) path.
    pub async fn process_vote(&self, event: &VoteEvent) -> Result<(), ProcessError> {
        ensure_vote_table(event.poll_id, self.store.as_ref(), self.cache.as_ref()).await?;

        let previous = self
            .store
            .write_vote_transaction(event.poll_id, event.user_id, event.option_id)
            .await?;

        let write = if previous == Some(event.option_id) {
            debug!(poll_id = %event.poll_id, user_id = %event.user_id,
                   "same-option replace, re-deriving counts from store");
            CacheWrite::Overwrite(self.store.read_vote_counts(event.poll_id).await?)
        } else {
            CacheWrite::Delta { removed: previous }
        };
        self.apply_cache_write(event, write).await?;

        // Always publish the complete current state, never the delta.
        let table = self.cache.read_counts(event.poll_id).await?;
        let notification = ChangeNotification::new(event.poll_id, table);
        if let Err(e) = self.publisher.publish(&notification).await {
            // Fire and forget: subscribers recover via the next snapshot.
            warn!(poll_id = %event.poll_id, error = %e, "failed to publish poll update");
        }

        Ok(())
    }

    /// The store transaction has already committed when this runs, so a
    /// transient cache failure must not be dropped on the floor: retry a few
    /// times, then surface the error so the event stays unacknowledged.
    async fn apply_cache_write(
        &self,
        event: &VoteEvent,
        write: CacheWrite,
    ) -> Result<(), CacheError> {
        let mut last_error = None;
        for attempt in 1..=CACHE_WRITE_ATTEMPTS {
            let result = match &write {
                CacheWrite::Overwrite(counts) => {
                    self.cache.write_counts(event.poll_id, counts).await
                }
                CacheWrite::Delta { removed } => {
                    self.cache
                        .apply_delta(event.poll_id, *removed, event.option_id)
                        .await
                }
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        poll_id = %event.poll_id,
                        attempt,
                        error = %e,
                        "cache write after committed store mutation failed"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(CACHE_WRITE_RETRY_DELAY).await;
                }
            }
        }
        Err(last_error.unwrap_or(CacheError::Unavailable))
    }
}

async fn commit_progress(consumer: &mut dyn EventConsumer) {
    if let Err(e) = consumer.commit().await {
        warn!(error = %e, "failed to commit event log progress");
    }
}
