use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::FanoutError;
use crate::multiplexer::{ChannelSet, run_listener};
use crate::notify::ChangeNotification;
use crate::pubsub::PubSubTransport;

#[derive(Debug, Clone)]
pub struct FanoutLimits {
    pub max_connections_total: usize,
    pub max_connections_per_user: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Connected,
    ShuttingDown,
    Stopped,
}

struct ClientSlot {
    user_id: Option<Uuid>,
    tx: Arc<watch::Sender<Option<ChangeNotification>>>,
}

/// Everything the registry lock guards: admission checks and membership
/// changes have to be atomic together, so this is one coarse structure under
/// one mutex rather than finer-grained state.
struct Registry {
    lifecycle: Lifecycle,
    next_client_id: u64,
    clients: HashMap<Uuid, HashMap<u64, ClientSlot>>,
    user_connections: HashMap<Uuid, usize>,
    channels: Option<ChannelSet>,
    listener: Option<JoinHandle<()>>,
}

impl Registry {
    fn new() -> Self {
        Registry {
            lifecycle: Lifecycle::Uninitialized,
            next_client_id: 0,
            clients: HashMap::new(),
            user_connections: HashMap::new(),
            channels: None,
            listener: None,
        }
    }

    fn total_clients(&self) -> usize {
        self.clients.values().map(|poll| poll.len()).sum()
    }

    /// Remove one subscription and decrement its user's connection count.
    /// Safe to call for ids that are already gone.
    fn remove_slot(&mut self, poll_id: Uuid, client_id: u64) -> Option<ClientSlot> {
        let slot = self.clients.get_mut(&poll_id)?.remove(&client_id)?;
        if let Some(user_id) = slot.user_id {
            if let Some(count) = self.user_connections.get_mut(&user_id) {
                *count -= 1;
                if *count == 0 {
                    self.user_connections.remove(&user_id);
                }
            }
        }
        Some(slot)
    }

    fn poll_is_empty(&self, poll_id: Uuid) -> bool {
        self.clients.get(&poll_id).is_none_or(|poll| poll.is_empty())
    }
}

/// Single-slot, latest-wins delivery target for one client. Rapid bursts of
/// notifications collapse to the most recent one; the consumer never sees
/// more than one pending update.
pub struct ClientMailbox {
    poll_id: Uuid,
    user_id: Option<Uuid>,
    client_id: u64,
    rx: watch::Receiver<Option<ChangeNotification>>,
}

impl ClientMailbox {
    pub fn poll_id(&self) -> Uuid {
        self.poll_id
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.user_id
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Wait for the next notification. Returns `None` once the subscription
    /// has been removed (unsubscribe, dead-client cleanup or shutdown).
    pub async fn next_update(&mut self) -> Option<ChangeNotification> {
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            if let Some(notification) = self.rx.borrow_and_update().clone() {
                return Some(notification);
            }
        }
    }
}

struct FanoutInner {
    limits: FanoutLimits,
    transport: Arc<dyn PubSubTransport>,
    registry: Mutex<Registry>,
}

/// Tracks live client subscriptions per poll and per user, enforces
/// admission limits, and fans incoming notifications out into per-client
/// mailboxes. Holds the shared subscription connection (via [`ChannelSet`])
/// and the multiplexer's listener task, both started lazily on the first
/// subscribe.
#[derive(Clone)]
pub struct FanoutManager {
    inner: Arc<FanoutInner>,
}

impl FanoutManager {
    pub fn new(transport: Arc<dyn PubSubTransport>, limits: FanoutLimits) -> Self {
        FanoutManager {
            inner: Arc::new(FanoutInner {
                limits,
                transport,
                registry: Mutex::new(Registry::new()),
            }),
        }
    }

    /// Register a client for a poll's updates and return its mailbox.
    ///
    /// Admission checks and registration happen atomically under the registry
    /// lock: a rejected subscription leaves no partial state behind. The
    /// poll's first subscriber triggers the channel subscribe on the shared
    /// connection.
    pub async fn subscribe(
        &self,
        poll_id: Uuid,
        user_id: Option<Uuid>,
    ) -> Result<ClientMailbox, FanoutError> {
        let mut registry = self.inner.registry.lock().await;

        match registry.lifecycle {
            Lifecycle::ShuttingDown | Lifecycle::Stopped => return Err(FanoutError::ShutDown),
            Lifecycle::Uninitialized => self.connect(&mut registry).await?,
            Lifecycle::Connected => {}
        }

        if registry.total_clients() >= self.inner.limits.max_connections_total {
            return Err(FanoutError::GlobalCapacity(
                self.inner.limits.max_connections_total,
            ));
        }
        if let Some(user_id) = user_id {
            let current = registry.user_connections.get(&user_id).copied().unwrap_or(0);
            if current >= self.inner.limits.max_connections_per_user {
                return Err(FanoutError::UserCapacity(
                    self.inner.limits.max_connections_per_user,
                ));
            }
        }

        let (tx, rx) = watch::channel(None);
        let client_id = registry.next_client_id;
        registry.next_client_id += 1;

        registry.clients.entry(poll_id).or_default().insert(
            client_id,
            ClientSlot {
                user_id,
                tx: Arc::new(tx),
            },
        );
        if let Some(user_id) = user_id {
            *registry.user_connections.entry(user_id).or_insert(0) += 1;
        }

        if let Some(channels) = registry.channels.as_mut() {
            if let Err(e) = channels.ensure_subscribed(poll_id).await {
                // No partial registration on failure.
                registry.remove_slot(poll_id, client_id);
                if registry.poll_is_empty(poll_id) {
                    registry.clients.remove(&poll_id);
                }
                return Err(e.into());
            }
        }

        debug!(
            %poll_id,
            ?user_id,
            clients = registry.clients.get(&poll_id).map_or(0, |p| p.len()),
            "client subscribed"
        );

        Ok(ClientMailbox {
            poll_id,
            user_id,
            client_id,
            rx,
        })
    }

    /// Remove one subscription. Idempotent: calling it for a client that was
    /// never registered (or already cleaned up) is a no-op. The poll's last
    /// departing client releases the channel on the shared connection.
    pub async fn unsubscribe(&self, poll_id: Uuid, client_id: u64) {
        let mut registry = self.inner.registry.lock().await;
        if registry.remove_slot(poll_id, client_id).is_none() {
            return;
        }
        release_if_empty(&mut registry, poll_id).await;
        debug!(%poll_id, client_id, "client unsubscribed");
    }

    /// Deliver a notification to every subscriber of its poll.
    pub async fn broadcast(&self, notification: ChangeNotification) {
        self.inner.broadcast(notification).await;
    }

    /// Stop the listener, unsubscribe every channel, drop the shared
    /// connection and clear all registry state. Terminal: the manager
    /// rejects new subscriptions afterwards.
    pub async fn shutdown(&self) {
        let mut registry = self.inner.registry.lock().await;
        if registry.lifecycle == Lifecycle::Stopped {
            return;
        }
        registry.lifecycle = Lifecycle::ShuttingDown;
        info!("shutting down fan-out manager");

        if let Some(listener) = registry.listener.take() {
            listener.abort();
        }
        if let Some(mut channels) = registry.channels.take() {
            channels.unsubscribe_all().await;
            // Dropping the ChannelSet drops the sink half and with it the
            // shared connection.
        }
        registry.clients.clear();
        registry.user_connections.clear();
        registry.lifecycle = Lifecycle::Stopped;
        info!("fan-out manager stopped");
    }

    /// Whether the poll's channel is currently held open on the shared
    /// connection.
    pub async fn is_channel_subscribed(&self, poll_id: Uuid) -> bool {
        let registry = self.inner.registry.lock().await;
        registry
            .channels
            .as_ref()
            .is_some_and(|channels| channels.is_subscribed(poll_id))
    }

    pub async fn total_clients(&self) -> usize {
        self.inner.registry.lock().await.total_clients()
    }

    /// Establish the shared connection and start the listener loop. Called
    /// exactly once, lazily, from the first subscribe.
    async fn connect(&self, registry: &mut Registry) -> Result<(), FanoutError> {
        let (sink, stream) = self.inner.transport.connect().await?;
        let channels = ChannelSet::new(sink);
        let active = channels.active_handle();

        let weak = Arc::downgrade(&self.inner);
        let dispatch = move |notification: ChangeNotification| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => {
                        inner.broadcast(notification).await;
                        true
                    }
                    None => false,
                }
            }
        };

        registry.listener = Some(tokio::spawn(run_listener(stream, active, dispatch)));
        registry.channels = Some(channels);
        registry.lifecycle = Lifecycle::Connected;
        info!("fan-out manager connected to notification transport");
        Ok(())
    }
}

impl FanoutInner {
    async fn broadcast(&self, notification: ChangeNotification) {
        let poll_id = notification.poll_id;

        // Snapshot under the lock, deliver outside it: a slow client must not
        // stall admission or other broadcasts.
        let targets: Vec<(u64, Arc<watch::Sender<Option<ChangeNotification>>>)> = {
            let registry = self.registry.lock().await;
            match registry.clients.get(&poll_id) {
                Some(poll) => poll
                    .iter()
                    .map(|(client_id, slot)| (*client_id, slot.tx.clone()))
                    .collect(),
                None => {
                    debug!(%poll_id, "no clients for poll, skipping broadcast");
                    return;
                }
            }
        };

        let mut dead = Vec::new();
        for (client_id, tx) in targets {
            // A full mailbox is simply overwritten: intermediate states are
            // intentionally lossy, the newest snapshot always wins.
            if tx.send(Some(notification.clone())).is_err() {
                dead.push(client_id);
            }
        }

        if !dead.is_empty() {
            warn!(%poll_id, dead = dead.len(), "removing dead client mailboxes");
            let mut registry = self.registry.lock().await;
            for client_id in dead {
                registry.remove_slot(poll_id, client_id);
            }
            release_if_empty(&mut registry, poll_id).await;
        }
    }
}

async fn release_if_empty(registry: &mut Registry, poll_id: Uuid) {
    if !registry.poll_is_empty(poll_id) {
        return;
    }
    registry.clients.remove(&poll_id);
    if let Some(channels) = registry.channels.as_mut() {
        if let Err(e) = channels.release(poll_id).await {
            warn!(%poll_id, error = %e, "failed to release poll channel");
        }
    }
}
