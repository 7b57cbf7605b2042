use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PubSubError;

/// Channel carrying a poll's change notifications, derived deterministically
/// from the poll id.
pub fn poll_update_topic(poll_id: Uuid) -> String {
    format!("poll:{poll_id}:updates")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteCount {
    pub option_id: Uuid,
    pub count: i64,
}

/// Full snapshot of a poll's counter table, emitted after every processed
/// vote. Never a delta: late or duplicate listeners always see a consistent
/// complete state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub poll_id: Uuid,
    pub vote_counts: Vec<VoteCount>,
}

impl ChangeNotification {
    pub fn new(poll_id: Uuid, counts: Vec<(Uuid, i64)>) -> Self {
        ChangeNotification {
            poll_id,
            vote_counts: counts
                .into_iter()
                .map(|(option_id, count)| VoteCount { option_id, count })
                .collect(),
        }
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Best-effort, fire-and-forget publication. Missed notifications are fine:
/// a new subscriber gets a fresh snapshot on connect and an existing one
/// catches up on the next message.
#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    async fn publish(&self, notification: &ChangeNotification) -> Result<(), PubSubError>;
}

pub struct ValkeyNotificationPublisher {
    conn: ConnectionManager,
}

impl ValkeyNotificationPublisher {
    pub fn new(conn: ConnectionManager) -> Self {
        ValkeyNotificationPublisher { conn }
    }
}

#[async_trait]
impl NotificationPublisher for ValkeyNotificationPublisher {
    async fn publish(&self, notification: &ChangeNotification) -> Result<(), PubSubError> {
        let payload = serde_json::to_string(notification)
            .map_err(|e| PubSubError::Backend(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .publish(poll_update_topic(notification.poll_id), payload)
            .await?;
        Ok(())
    }
}
