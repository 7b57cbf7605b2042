use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PubSubError;
use crate::notify::{ChangeNotification, poll_update_topic};
use crate::pubsub::{SubscriptionSink, SubscriptionStream};

/// Sleep while no channel is subscribed; the underlying receive primitive is
/// not meant to be driven with zero subscriptions.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Bounded receive timeout, so the listener periodically re-checks whether
/// any channel is still subscribed.
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause before retrying after a transient receive error (e.g. the race right
/// after the last unsubscribe).
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// The set of per-poll channels currently held open on the shared connection.
///
/// Membership transitions are explicit: the first interested client triggers
/// a subscribe, the last departing one an unsubscribe. All mutations happen
/// under the fan-out manager's registry lock, which owns this value.
pub struct ChannelSet {
    sink: Box<dyn SubscriptionSink>,
    subscribed: HashSet<Uuid>,
    active: Arc<AtomicUsize>,
}

impl ChannelSet {
    pub fn new(sink: Box<dyn SubscriptionSink>) -> Self {
        ChannelSet {
            sink,
            subscribed: HashSet::new(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared with the listener loop so it knows whether to idle or receive.
    pub fn active_handle(&self) -> Arc<AtomicUsize> {
        self.active.clone()
    }

    pub fn is_subscribed(&self, poll_id: Uuid) -> bool {
        self.subscribed.contains(&poll_id)
    }

    /// Subscribe the poll's channel if this is its first interested client.
    pub async fn ensure_subscribed(&mut self, poll_id: Uuid) -> Result<(), PubSubError> {
        if self.subscribed.contains(&poll_id) {
            return Ok(());
        }
        let topic = poll_update_topic(poll_id);
        self.sink.subscribe(&topic).await?;
        self.subscribed.insert(poll_id);
        self.active.store(self.subscribed.len(), Ordering::Release);
        info!(%topic, "subscribed to poll update channel");
        Ok(())
    }

    /// Drop the poll's channel once its last client is gone.
    pub async fn release(&mut self, poll_id: Uuid) -> Result<(), PubSubError> {
        if !self.subscribed.remove(&poll_id) {
            return Ok(());
        }
        self.active.store(self.subscribed.len(), Ordering::Release);
        let topic = poll_update_topic(poll_id);
        self.sink.unsubscribe(&topic).await?;
        info!(%topic, "unsubscribed from poll update channel");
        Ok(())
    }

    /// Best-effort teardown of every channel; failures are logged, not
    /// retried, since the process is going away anyway.
    pub async fn unsubscribe_all(&mut self) {
        for poll_id in std::mem::take(&mut self.subscribed) {
            let topic = poll_update_topic(poll_id);
            if let Err(e) = self.sink.unsubscribe(&topic).await {
                warn!(%topic, error = %e, "failed to unsubscribe during shutdown");
            }
        }
        self.active.store(0, Ordering::Release);
    }
}

/// Single background loop owning exclusive read access to the shared
/// subscription connection. Each parsed notification is handed to `dispatch`
/// (the fan-out manager's broadcast); nothing else ever reads the stream.
pub async fn run_listener<F, Fut>(
    mut stream: Box<dyn SubscriptionStream>,
    active: Arc<AtomicUsize>,
    mut dispatch: F,
) where
    F: FnMut(ChangeNotification) -> Fut,
    Fut: Future<Output = bool>,
{
    info!("pubsub listener started");

    loop {
        if active.load(Ordering::Acquire) == 0 {
            tokio::time::sleep(IDLE_POLL).await;
            continue;
        }

        let message = match stream.next_message(RECV_TIMEOUT).await {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(e) => {
                // Includes the not-subscribed race right after an unsubscribe;
                // treat as retryable.
                warn!(error = %e, "pubsub receive failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
        };

        let notification = match ChangeNotification::from_payload(&message.payload) {
            Ok(notification) => notification,
            Err(e) => {
                // One bad message must not take down the channel.
                warn!(topic = %message.topic, error = %e, "skipping malformed notification");
                continue;
            }
        };

        debug!(
            poll_id = %notification.poll_id,
            counts = notification.vote_counts.len(),
            "dispatching poll update"
        );
        if !dispatch(notification).await {
            break;
        }
    }

    info!("pubsub listener stopped");
}
