use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::EventLogError;

pub const VOTE_EVENT_STREAM: &str = "vote-events";
pub const CONSUMER_GROUP: &str = "vote-event-processor";

/// One vote submission, produced exactly once per HTTP request and consumed
/// at least once by the processor. `poll_id` is the ordering key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteEvent {
    pub poll_id: Uuid,
    pub user_id: Uuid,
    pub option_id: Uuid,
    pub received_at: DateTime<Utc>,
}

/// A vote event together with its position in the log, so the consumer can
/// acknowledge it after processing.
#[derive(Debug, Clone)]
pub struct LoggedVote {
    pub entry_id: String,
    pub event: VoteEvent,
}

#[async_trait]
pub trait EventProducer: Send + Sync {
    async fn send(&self, event: &VoteEvent) -> Result<(), EventLogError>;
}

/// At-least-once consumer over the ordered vote event log.
///
/// Delivered entries stay pending until `mark_processed` + `commit`; progress
/// is committed periodically rather than per message, so redelivery after a
/// crash (or after `rewind`) is expected and must be handled idempotently
/// downstream.
#[async_trait]
pub trait EventConsumer: Send {
    /// Next batch of events, blocking with a bounded timeout. An empty batch
    /// just means the timeout elapsed.
    async fn next_batch(&mut self) -> Result<Vec<LoggedVote>, EventLogError>;

    /// Mark an entry as processed; it is acknowledged on the next `commit`.
    fn mark_processed(&mut self, entry_id: &str);

    /// Acknowledge everything marked since the last commit.
    async fn commit(&mut self) -> Result<(), EventLogError>;

    /// Re-deliver everything delivered but not yet committed, oldest first.
    fn rewind(&mut self);
}

pub struct StreamEventProducer {
    conn: ConnectionManager,
}

impl StreamEventProducer {
    pub fn new(conn: ConnectionManager) -> Self {
        StreamEventProducer { conn }
    }
}

#[async_trait]
impl EventProducer for StreamEventProducer {
    async fn send(&self, event: &VoteEvent) -> Result<(), EventLogError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();
        let _: String = conn
            .xadd(
                VOTE_EVENT_STREAM,
                "*",
                &[
                    ("poll_id", event.poll_id.to_string().as_str()),
                    ("payload", payload.as_str()),
                ],
            )
            .await?;
        Ok(())
    }
}

pub struct StreamEventConsumer {
    conn: ConnectionManager,
    consumer_name: String,
    /// While false we read our own pending-entries backlog (entries delivered
    /// before a crash or rewind but never acknowledged) instead of new ones.
    backlog_drained: bool,
    marked: Vec<String>,
}

impl StreamEventConsumer {
    /// Creates the consumer group if it does not exist yet and starts reading
    /// from this consumer's un-acknowledged backlog.
    pub async fn new(
        conn: ConnectionManager,
        consumer_name: impl Into<String>,
    ) -> Result<Self, EventLogError> {
        let mut setup = conn.clone();
        let created: redis::RedisResult<()> = setup
            .xgroup_create_mkstream(VOTE_EVENT_STREAM, CONSUMER_GROUP, "0")
            .await;
        if let Err(e) = created {
            if e.code() != Some("BUSYGROUP") {
                return Err(e.into());
            }
        }

        Ok(StreamEventConsumer {
            conn,
            consumer_name: consumer_name.into(),
            backlog_drained: false,
            marked: Vec::new(),
        })
    }

    fn decode(entry: &redis::streams::StreamId) -> Option<VoteEvent> {
        let payload = entry.map.get("payload")?;
        let raw: String = redis::from_redis_value(payload).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// A backlog read returns every delivered-but-unacknowledged entry,
    /// including ones already processed and marked but not yet committed.
    /// Those must not be handed out again: replaying them repeats store
    /// writes and notifications until the next commit shrinks the backlog.
    fn collect_batch(
        reply: StreamReadReply,
        reading_backlog: bool,
        marked: &mut Vec<String>,
    ) -> Vec<LoggedVote> {
        let mut batch = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                if reading_backlog && marked.contains(&entry.id) {
                    continue;
                }
                match Self::decode(&entry) {
                    Some(event) => batch.push(LoggedVote {
                        entry_id: entry.id,
                        event,
                    }),
                    None => {
                        // One bad entry must not stall the log; skip it.
                        warn!(entry_id = %entry.id, "skipping malformed vote event");
                        marked.push(entry.id);
                    }
                }
            }
        }
        batch
    }
}

#[async_trait]
impl EventConsumer for StreamEventConsumer {
    async fn next_batch(&mut self) -> Result<Vec<LoggedVote>, EventLogError> {
        let id = if self.backlog_drained { ">" } else { "0" };
        let options = StreamReadOptions::default()
            .group(CONSUMER_GROUP, &self.consumer_name)
            .block(1000)
            .count(16);

        let mut conn = self.conn.clone();
        let reply: StreamReadReply = conn
            .xread_options(&[VOTE_EVENT_STREAM], &[id], &options)
            .await?;

        let batch = Self::collect_batch(reply, !self.backlog_drained, &mut self.marked);

        if !self.backlog_drained && batch.is_empty() {
            self.backlog_drained = true;
        }
        Ok(batch)
    }

    fn mark_processed(&mut self, entry_id: &str) {
        self.marked.push(entry_id.to_string());
    }

    async fn commit(&mut self) -> Result<(), EventLogError> {
        if self.marked.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(VOTE_EVENT_STREAM, CONSUMER_GROUP, &self.marked)
            .await?;
        self.marked.clear();
        Ok(())
    }

    fn rewind(&mut self) {
        self.backlog_drained = false;
    }
}
