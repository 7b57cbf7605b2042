#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use pollstream::db::{Permission, PollStore};
use pollstream::cache::CounterCache;
use pollstream::error::{CacheError, EventLogError, PubSubError, StoreError};
use pollstream::events::{EventConsumer, EventProducer, LoggedVote, VoteEvent};
use pollstream::notify::{ChangeNotification, NotificationPublisher, poll_update_topic};
use pollstream::pubsub::{PubSubTransport, RawMessage, SubscriptionSink, SubscriptionStream};

pub fn vote_event(poll_id: Uuid, user_id: Uuid, option_id: Uuid) -> VoteEvent {
    VoteEvent {
        poll_id,
        user_id,
        option_id,
        received_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Authoritative store fake
// ---------------------------------------------------------------------------

struct StoreState {
    // poll -> ordered option ids
    polls: HashMap<Uuid, Vec<Uuid>>,
    closed: HashSet<Uuid>,
    // (poll, user) -> option
    votes: HashMap<(Uuid, Uuid), Uuid>,
}

#[derive(Clone)]
pub struct MemoryPollStore {
    state: Arc<Mutex<StoreState>>,
    /// Simulated query latency, to widen race windows in init tests.
    pub read_delay: Duration,
    reads: Arc<AtomicUsize>,
}

impl MemoryPollStore {
    pub fn new() -> Self {
        MemoryPollStore {
            state: Arc::new(Mutex::new(StoreState {
                polls: HashMap::new(),
                closed: HashSet::new(),
                votes: HashMap::new(),
            })),
            read_delay: Duration::ZERO,
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    pub fn add_poll(&self, options: usize) -> (Uuid, Vec<Uuid>) {
        let poll_id = Uuid::new_v4();
        let mut option_ids: Vec<Uuid> = (0..options).map(|_| Uuid::new_v4()).collect();
        option_ids.sort();
        self.state
            .lock()
            .unwrap()
            .polls
            .insert(poll_id, option_ids.clone());
        (poll_id, option_ids)
    }

    pub fn close_poll(&self, poll_id: Uuid) {
        self.state.lock().unwrap().closed.insert(poll_id);
    }

    /// How many times the full counter read ran (one expected per cold poll).
    pub fn count_reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PollStore for MemoryPollStore {
    async fn authorize(
        &self,
        _user_id: Option<Uuid>,
        poll_id: Uuid,
        permission: Permission,
        _at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let state = self.state.lock().unwrap();
        if !state.polls.contains_key(&poll_id) {
            return Ok(false);
        }
        Ok(match permission {
            Permission::View => true,
            Permission::Vote => !state.closed.contains(&poll_id),
        })
    }

    async fn read_vote_counts(&self, poll_id: Uuid) -> Result<Vec<(Uuid, i64)>, StoreError> {
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
        self.reads.fetch_add(1, Ordering::SeqCst);

        let state = self.state.lock().unwrap();
        let options = state
            .polls
            .get(&poll_id)
            .ok_or_else(|| StoreError::Backend(format!("no poll {poll_id}")))?;

        Ok(options
            .iter()
            .map(|option_id| {
                let count = state
                    .votes
                    .iter()
                    .filter(|((p, _), o)| *p == poll_id && **o == *option_id)
                    .count() as i64;
                (*option_id, count)
            })
            .collect())
    }

    async fn write_vote_transaction(
        &self,
        poll_id: Uuid,
        user_id: Uuid,
        option_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        let mut state = self.state.lock().unwrap();
        Ok(state.votes.insert((poll_id, user_id), option_id))
    }

    async fn option_belongs_to_poll(
        &self,
        poll_id: Uuid,
        option_id: Uuid,
    ) -> Result<bool, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .polls
            .get(&poll_id)
            .is_some_and(|options| options.contains(&option_id)))
    }
}

// ---------------------------------------------------------------------------
// Counter cache fake
// ---------------------------------------------------------------------------

struct CacheState {
    tables: HashMap<Uuid, HashMap<Uuid, i64>>,
    locks: HashMap<Uuid, (String, Instant)>,
}

#[derive(Clone)]
pub struct MemoryCounterCache {
    state: Arc<Mutex<CacheState>>,
}

impl MemoryCounterCache {
    pub fn new() -> Self {
        MemoryCounterCache {
            state: Arc::new(Mutex::new(CacheState {
                tables: HashMap::new(),
                locks: HashMap::new(),
            })),
        }
    }

    pub fn lock_holder(&self, poll_id: Uuid) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.locks.get(&poll_id).map(|(token, _)| token.clone())
    }
}

#[async_trait]
impl CounterCache for MemoryCounterCache {
    async fn table_exists(&self, poll_id: Uuid) -> Result<bool, CacheError> {
        Ok(self.state.lock().unwrap().tables.contains_key(&poll_id))
    }

    async fn read_counts(&self, poll_id: Uuid) -> Result<Vec<(Uuid, i64)>, CacheError> {
        let state = self.state.lock().unwrap();
        let mut counts: Vec<(Uuid, i64)> = state
            .tables
            .get(&poll_id)
            .map(|table| table.iter().map(|(k, v)| (*k, *v)).collect())
            .unwrap_or_default();
        counts.sort_by_key(|(option_id, _)| *option_id);
        Ok(counts)
    }

    async fn write_counts(&self, poll_id: Uuid, counts: &[(Uuid, i64)]) -> Result<(), CacheError> {
        let mut state = self.state.lock().unwrap();
        // Like the hash-based backend: writing zero fields leaves no key.
        if counts.is_empty() {
            state.tables.remove(&poll_id);
        } else {
            state
                .tables
                .insert(poll_id, counts.iter().copied().collect());
        }
        Ok(())
    }

    async fn apply_delta(
        &self,
        poll_id: Uuid,
        removed: Option<Uuid>,
        added: Uuid,
    ) -> Result<(), CacheError> {
        let mut state = self.state.lock().unwrap();
        let table = state.tables.entry(poll_id).or_default();
        if let Some(removed) = removed {
            *table.entry(removed).or_insert(0) -= 1;
        }
        *table.entry(added).or_insert(0) += 1;
        Ok(())
    }

    async fn try_lock(
        &self,
        poll_id: Uuid,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut state = self.state.lock().unwrap();
        match state.locks.get(&poll_id) {
            Some((_, expires)) if *expires > Instant::now() => Ok(false),
            _ => {
                state
                    .locks
                    .insert(poll_id, (token.to_string(), Instant::now() + ttl));
                Ok(true)
            }
        }
    }

    async fn unlock(&self, poll_id: Uuid, token: &str) -> Result<bool, CacheError> {
        let mut state = self.state.lock().unwrap();
        match state.locks.get(&poll_id) {
            Some((held, _)) if held == token => {
                state.locks.remove(&poll_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Notification transport fake
// ---------------------------------------------------------------------------

/// In-memory stand-in for the pub/sub transport: one broadcast bus, with the
/// subscribed-topic set shared between sink and stream halves so the stream
/// only yields messages for held channels.
#[derive(Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<RawMessage>,
    topics: Arc<Mutex<HashSet<String>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        MemoryBus {
            tx,
            topics: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn publish_raw(&self, topic: &str, payload: Vec<u8>) {
        // No receivers is fine; the transport is fire-and-forget.
        let _ = self.tx.send(RawMessage {
            topic: topic.to_string(),
            payload,
        });
    }

    pub fn is_topic_subscribed(&self, poll_id: Uuid) -> bool {
        self.topics
            .lock()
            .unwrap()
            .contains(&poll_update_topic(poll_id))
    }
}

#[async_trait]
impl PubSubTransport for MemoryBus {
    async fn connect(
        &self,
    ) -> Result<(Box<dyn SubscriptionSink>, Box<dyn SubscriptionStream>), PubSubError> {
        Ok((
            Box::new(MemorySink {
                topics: self.topics.clone(),
            }),
            Box::new(MemoryStream {
                rx: self.tx.subscribe(),
                topics: self.topics.clone(),
            }),
        ))
    }
}

#[async_trait]
impl NotificationPublisher for MemoryBus {
    async fn publish(&self, notification: &ChangeNotification) -> Result<(), PubSubError> {
        let payload = serde_json::to_vec(notification)
            .map_err(|e| PubSubError::Backend(e.to_string()))?;
        self.publish_raw(&poll_update_topic(notification.poll_id), payload);
        Ok(())
    }
}

struct MemorySink {
    topics: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl SubscriptionSink for MemorySink {
    async fn subscribe(&mut self, topic: &str) -> Result<(), PubSubError> {
        self.topics.lock().unwrap().insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), PubSubError> {
        self.topics.lock().unwrap().remove(topic);
        Ok(())
    }
}

struct MemoryStream {
    rx: broadcast::Receiver<RawMessage>,
    topics: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl SubscriptionStream for MemoryStream {
    async fn next_message(&mut self, wait: Duration) -> Result<Option<RawMessage>, PubSubError> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.rx.recv()).await {
                Err(_) => return Ok(None),
                Ok(Ok(message)) => {
                    if self.topics.lock().unwrap().contains(&message.topic) {
                        return Ok(Some(message));
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(PubSubError::ConnectionLost);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Event log fake
// ---------------------------------------------------------------------------

struct LogState {
    queue: VecDeque<LoggedVote>,
    /// Delivered but not yet acknowledged, in delivery order.
    pending: Vec<LoggedVote>,
    next_id: u64,
}

#[derive(Clone)]
pub struct MemoryEventLog {
    state: Arc<Mutex<LogState>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        MemoryEventLog {
            state: Arc::new(Mutex::new(LogState {
                queue: VecDeque::new(),
                pending: Vec::new(),
                next_id: 0,
            })),
        }
    }

    pub fn consumer(&self) -> MemoryEventConsumer {
        MemoryEventConsumer {
            state: self.state.clone(),
            marked: Vec::new(),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }
}

#[async_trait]
impl EventProducer for MemoryEventLog {
    async fn send(&self, event: &VoteEvent) -> Result<(), EventLogError> {
        let mut state = self.state.lock().unwrap();
        let entry_id = format!("{}-0", state.next_id);
        state.next_id += 1;
        state.queue.push_back(LoggedVote {
            entry_id,
            event: event.clone(),
        });
        Ok(())
    }
}

pub struct MemoryEventConsumer {
    state: Arc<Mutex<LogState>>,
    marked: Vec<String>,
}

#[async_trait]
impl EventConsumer for MemoryEventConsumer {
    async fn next_batch(&mut self) -> Result<Vec<LoggedVote>, EventLogError> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.queue.is_empty() {
                let batch: Vec<LoggedVote> = state.queue.drain(..).collect();
                state.pending.extend(batch.iter().cloned());
                return Ok(batch);
            }
        }
        // Emulate a bounded blocking read on an empty log.
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(Vec::new())
    }

    fn mark_processed(&mut self, entry_id: &str) {
        self.marked.push(entry_id.to_string());
    }

    async fn commit(&mut self) -> Result<(), EventLogError> {
        let mut state = self.state.lock().unwrap();
        state
            .pending
            .retain(|logged| !self.marked.contains(&logged.entry_id));
        self.marked.clear();
        Ok(())
    }

    fn rewind(&mut self) {
        let mut state = self.state.lock().unwrap();
        let redeliver: Vec<LoggedVote> = state.pending.drain(..).collect();
        for logged in redeliver.into_iter().rev() {
            state.queue.push_front(logged);
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Poll `f` until it yields a value or the timeout elapses.
pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

pub fn counts_of(notification: &ChangeNotification) -> Vec<(Uuid, i64)> {
    notification
        .vote_counts
        .iter()
        .map(|vc| (vc.option_id, vc.count))
        .collect()
}
