//! Topic state machine.
//!
//! Each topic runs as one tokio task that exclusively owns the sequence
//! number, the current value, the delta history and the subscriber list.
//!
//! ```text
//! TopicHandle::send ──► pending slot (depth 1, last write wins) ──┐
//! TopicHandle::subscribe / unsubscribe / snapshot ── commands ────┤
//!                                                                  ▼
//!   Loading ──find_one──► Ready ──diff──► persist ──► swap ──► notify subscribers
//!                           ▲                 │ retries exhausted
//!                           └─────────────────┘ (state unchanged)
//! ```
//!
//! Sends that arrive while the topic is loading or persisting collapse into
//! the pending slot, so only the newest value is applied next.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use entangled_core::{CompressedDelta, Delta, Dto, DtoError, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

use crate::protocol::TopicMessage;
use crate::storage::{Datastore, HistoryRecord, TopicRecord};

/// Topic configuration.
#[derive(Debug, Clone)]
pub struct TopicConfig {
    /// Upper bound on delta-history entries kept per topic
    pub history_depth: usize,
    /// Unacknowledged subscribers are re-sent to after this long
    pub resend_timeout: Duration,
    /// Persist attempts before a send is dropped
    pub persist_attempts: u32,
    /// Pause between persist or load attempts
    pub retry_delay: Duration,
    /// Bound of the per-topic command channel
    pub command_capacity: usize,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            history_depth: 5,
            resend_timeout: Duration::from_secs(3),
            persist_attempts: 5,
            retry_delay: Duration::from_millis(10),
            command_capacity: 256,
        }
    }
}

#[derive(Debug, Error)]
pub enum TopicError {
    #[error(transparent)]
    Dto(#[from] DtoError),
    #[error("topic {0} is closed")]
    Closed(String),
    #[error("no topic registered for {0}")]
    UnknownTopic(String),
}

/// Outbound side of a client connection, as seen by topics.
#[derive(Debug, Clone)]
pub struct Connection {
    id: Uuid,
    outbound: mpsc::Sender<Arc<str>>,
}

enum Delivery {
    Sent,
    Dropped,
    Closed,
}

impl Connection {
    pub fn new(outbound: mpsc::Sender<Arc<str>>) -> Self {
        Self::with_id(Uuid::new_v4(), outbound)
    }

    pub fn with_id(id: Uuid, outbound: mpsc::Sender<Arc<str>>) -> Self {
        Self { id, outbound }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn deliver(&self, message: Arc<str>) -> Delivery {
        match self.outbound.try_send(message) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Outbound queue full for connection {}, will resend", self.id);
                Delivery::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

struct Subscriber {
    connection: Connection,
    last_sent_seq: u64,
    last_sent_at: Instant,
    last_acked_seq: u64,
}

#[derive(Clone)]
struct HistoryEntry {
    seq: u64,
    value: Arc<Dto>,
    /// From `value` to the state's current value.
    delta: Arc<CompressedDelta>,
}

#[derive(Default)]
struct TopicState {
    seq: u64,
    current: Option<Arc<Dto>>,
    /// Newest first.
    history: Vec<HistoryEntry>,
}

impl TopicState {
    fn from_record(record: TopicRecord) -> Self {
        let history = record
            .deltas
            .into_iter()
            .map(|entry| HistoryEntry {
                seq: entry.seq,
                value: Arc::new(Dto::from_compressed(entry.data_compressed)),
                delta: Arc::new(CompressedDelta::from_compressed(entry.diff_compressed)),
            })
            .collect();
        Self {
            seq: record.seq,
            current: Some(Arc::new(Dto::from_compressed(record.data))),
            history,
        }
    }

    /// The state after accepting `value`, or `None` when nothing changed.
    fn next(&self, name: &str, value: Arc<Dto>, depth: usize) -> Option<TopicState> {
        let Some(current) = &self.current else {
            return Some(TopicState {
                seq: self.seq + 1,
                current: Some(value),
                history: Vec::new(),
            });
        };

        let delta = match current.diff(&value) {
            Ok(delta) => delta,
            Err(e) => {
                log::warn!("Topic {name}: stored value unreadable ({e}), restarting history");
                return Some(TopicState {
                    seq: self.seq + 1,
                    current: Some(value),
                    history: Vec::new(),
                });
            }
        };
        if !delta.has_diff() {
            return None;
        }

        let mut history = Vec::with_capacity(depth);
        if depth > 0 {
            if let Some(delta) = encodable(name, self.seq, delta) {
                history.push(HistoryEntry {
                    seq: self.seq,
                    value: current.clone(),
                    delta,
                });
            }

            let mut retained = self.history.clone();
            retained.sort_by(|a, b| b.seq.cmp(&a.seq));
            retained.truncate(depth - 1);
            for entry in retained {
                match entry.value.diff(&value) {
                    Ok(delta) if delta.has_diff() => {
                        if let Some(delta) = encodable(name, entry.seq, delta) {
                            history.push(HistoryEntry { delta, ..entry });
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("Topic {name}: dropping unreadable history entry {}: {e}", entry.seq)
                    }
                }
            }
        }

        Some(TopicState {
            seq: self.seq + 1,
            current: Some(value),
            history,
        })
    }

    fn to_record(&self, name: &str) -> Result<TopicRecord, DtoError> {
        let data = match &self.current {
            Some(current) => current.compressed()?.to_owned(),
            None => return Err(DtoError::InvalidRootType),
        };
        let deltas = self
            .history
            .iter()
            .map(|entry| {
                Ok(HistoryRecord {
                    seq: entry.seq,
                    data_compressed: entry.value.compressed()?.to_owned(),
                    diff_compressed: entry.delta.compressed()?.to_owned(),
                })
            })
            .collect::<Result<Vec<_>, DtoError>>()?;
        Ok(TopicRecord {
            name: name.to_owned(),
            seq: self.seq,
            data,
            deltas,
        })
    }

    fn history_entry(&self, seq: u64) -> Option<&HistoryEntry> {
        self.history.iter().find(|entry| entry.seq == seq)
    }
}

/// Encodes `delta` up front. A delta the compact form cannot express is left
/// out of the history; subscribers behind it get the full value instead.
fn encodable(name: &str, seq: u64, delta: Delta) -> Option<Arc<CompressedDelta>> {
    let delta = CompressedDelta::from_delta(delta);
    match delta.compressed() {
        Ok(_) => Some(Arc::new(delta)),
        Err(e) => {
            log::warn!("Topic {name}: no delta kept for seq {seq}: {e}");
            None
        }
    }
}

/// Point-in-time view of a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicSnapshot {
    pub name: String,
    pub seq: u64,
    /// Compact form of the current value.
    pub data: Option<String>,
    pub value: Option<Value>,
    /// Sequences with a stored delta, newest first.
    pub history: Vec<u64>,
    pub subscribers: usize,
}

enum Command {
    Subscribe {
        connection: Connection,
        last_acked_seq: u64,
    },
    Unsubscribe {
        connection_id: Uuid,
    },
    Snapshot {
        reply: oneshot::Sender<TopicSnapshot>,
    },
}

#[derive(Default)]
struct PendingSlot {
    value: Mutex<Option<Arc<Dto>>>,
    notify: Notify,
}

impl PendingSlot {
    /// Returns `true` when an earlier value was replaced.
    fn put(&self, value: Arc<Dto>) -> bool {
        let replaced = self
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(value)
            .is_some();
        self.notify.notify_one();
        replaced
    }

    fn take(&self) -> Option<Arc<Dto>> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Cloneable handle to a running topic. The topic task stops once every
/// handle is dropped.
#[derive(Clone)]
pub struct TopicHandle {
    name: Arc<str>,
    commands: mpsc::Sender<Command>,
    pending: Arc<PendingSlot>,
}

impl TopicHandle {
    /// Start a topic task. It begins by loading persisted state.
    pub fn spawn(
        name: impl Into<String>,
        datastore: Arc<dyn Datastore>,
        config: TopicConfig,
    ) -> TopicHandle {
        let name: Arc<str> = Arc::from(name.into());
        let (commands_tx, commands_rx) = mpsc::channel(config.command_capacity.max(1));
        let pending = Arc::new(PendingSlot::default());

        let actor = TopicActor {
            name: name.clone(),
            config,
            datastore,
            state: TopicState::default(),
            subscribers: Vec::new(),
            pending: pending.clone(),
            commands: commands_rx,
            resend: None,
        };
        tokio::spawn(actor.run());

        TopicHandle {
            name,
            commands: commands_tx,
            pending,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Queue a new value for the topic.
    ///
    /// The value is validated and encoded here, so invalid input fails
    /// immediately. Sequencing and persistence happen asynchronously on the
    /// topic task.
    pub fn send(&self, value: impl Into<Value>) -> Result<(), TopicError> {
        self.send_dto(Dto::new(value)?)
    }

    pub fn send_dto(&self, dto: Dto) -> Result<(), TopicError> {
        dto.compressed()?;
        if self.is_closed() {
            return Err(TopicError::Closed(self.name.to_string()));
        }
        if self.pending.put(Arc::new(dto)) {
            log::trace!("Topic {}: coalesced pending send", self.name);
        }
        Ok(())
    }

    /// Register `connection` or raise its acknowledged sequence.
    pub async fn subscribe(
        &self,
        connection: Connection,
        last_acked_seq: u64,
    ) -> Result<(), TopicError> {
        self.command(Command::Subscribe {
            connection,
            last_acked_seq,
        })
        .await
    }

    /// Remove a connection. Unknown connections are ignored.
    pub async fn unsubscribe(&self, connection_id: Uuid) -> Result<(), TopicError> {
        self.command(Command::Unsubscribe { connection_id }).await
    }

    pub async fn snapshot(&self) -> Result<TopicSnapshot, TopicError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| TopicError::Closed(self.name.to_string()))
    }

    async fn command(&self, command: Command) -> Result<(), TopicError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TopicError::Closed(self.name.to_string()))
    }
}

type MessageCache = HashMap<(u64, Option<u64>), Arc<str>>;

struct TopicActor {
    name: Arc<str>,
    config: TopicConfig,
    datastore: Arc<dyn Datastore>,
    state: TopicState,
    subscribers: Vec<Subscriber>,
    pending: Arc<PendingSlot>,
    commands: mpsc::Receiver<Command>,
    resend: Option<Interval>,
}

impl TopicActor {
    async fn run(mut self) {
        self.load().await;
        self.drain_pending().await;

        loop {
            tokio::select! {
                biased;
                _ = self.pending.notify.notified() => self.drain_pending().await,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = next_tick(&mut self.resend) => self.on_resend_tick(),
            }
        }
        log::debug!("Topic {} stopped", self.name);
    }

    async fn load(&mut self) {
        let mut attempt: u64 = 1;
        loop {
            match self.datastore.find_one(&self.name).await {
                Ok(Some(record)) => {
                    self.state = TopicState::from_record(record);
                    log::info!("Topic {} loaded at seq {}", self.name, self.state.seq);
                    return;
                }
                Ok(None) => {
                    log::debug!("Topic {} has no stored state", self.name);
                    return;
                }
                Err(e) => {
                    log::warn!("Failed to load topic {} (attempt {attempt}): {e}", self.name);
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    async fn drain_pending(&mut self) {
        while let Some(value) = self.pending.take() {
            self.apply(value).await;
        }
    }

    async fn apply(&mut self, value: Arc<Dto>) {
        let Some(next) = self.state.next(&self.name, value, self.config.history_depth) else {
            log::trace!("Topic {}: value unchanged, nothing to send", self.name);
            return;
        };
        let record = match next.to_record(&self.name) {
            Ok(record) => record,
            Err(e) => {
                log::error!("Topic {}: cannot encode seq {}: {e}", self.name, next.seq);
                return;
            }
        };
        if !self.persist(&record).await {
            return;
        }

        log::debug!("Topic {} advanced to seq {}", self.name, next.seq);
        self.state = next;
        self.notify_all();
    }

    async fn persist(&self, record: &TopicRecord) -> bool {
        let attempts = self.config.persist_attempts.max(1);
        for attempt in 1..=attempts {
            match self.datastore.upsert(record).await {
                Ok(()) => return true,
                Err(e) => {
                    log::warn!(
                        "Failed to persist topic {} seq {} (attempt {attempt}/{attempts}): {e}",
                        self.name,
                        record.seq
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }
        log::error!(
            "Giving up on topic {} seq {} after {attempts} attempts",
            self.name,
            record.seq
        );
        false
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                connection,
                last_acked_seq,
            } => self.subscribe(connection, last_acked_seq),
            Command::Unsubscribe { connection_id } => {
                self.subscribers
                    .retain(|subscriber| subscriber.connection.id != connection_id);
                if self.subscribers.is_empty() {
                    self.resend = None;
                }
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn subscribe(&mut self, connection: Connection, last_acked_seq: u64) {
        // An acknowledgement beyond the current seq belongs to state this
        // topic never produced.
        let acked = if last_acked_seq > self.state.seq { 0 } else { last_acked_seq };

        let now = Instant::now();
        let index = match self
            .subscribers
            .iter()
            .position(|subscriber| subscriber.connection.id == connection.id)
        {
            Some(index) => {
                let subscriber = &mut self.subscribers[index];
                subscriber.last_acked_seq = subscriber.last_acked_seq.max(acked);
                index
            }
            None => {
                self.subscribers.push(Subscriber {
                    connection,
                    last_sent_seq: acked,
                    last_sent_at: now,
                    last_acked_seq: acked,
                });
                self.subscribers.len() - 1
            }
        };

        let mut cache = MessageCache::new();
        if let Delivery::Closed = self.notify_subscriber(index, now, &mut cache) {
            self.subscribers.swap_remove(index);
        }
        self.restart_resend();
    }

    fn notify_all(&mut self) {
        let now = Instant::now();
        let mut cache = MessageCache::new();
        let mut index = 0;
        while index < self.subscribers.len() {
            match self.notify_subscriber(index, now, &mut cache) {
                Delivery::Closed => {
                    let subscriber = self.subscribers.remove(index);
                    log::debug!(
                        "Topic {}: dropped closed connection {}",
                        self.name,
                        subscriber.connection.id
                    );
                }
                _ => index += 1,
            }
        }
    }

    fn notify_subscriber(&mut self, index: usize, now: Instant, cache: &mut MessageCache) -> Delivery {
        let Some(message) = self.message_for(&self.subscribers[index], now, cache) else {
            return Delivery::Dropped;
        };
        let subscriber = &mut self.subscribers[index];
        let delivery = subscriber.connection.deliver(message);
        if let Delivery::Sent = delivery {
            log::trace!(
                "Topic {}: sent seq {} to {}",
                self.name,
                self.state.seq,
                subscriber.connection.id
            );
            subscriber.last_sent_seq = self.state.seq;
            subscriber.last_sent_at = now;
        }
        delivery
    }

    /// The message `subscriber` needs now, if any.
    fn message_for(
        &self,
        subscriber: &Subscriber,
        now: Instant,
        cache: &mut MessageCache,
    ) -> Option<Arc<str>> {
        let seq = self.state.seq;
        let current = self.state.current.as_ref()?;
        if subscriber.last_acked_seq >= seq {
            return None;
        }

        let reference =
            if now.saturating_duration_since(subscriber.last_sent_at) >= self.config.resend_timeout {
                subscriber.last_acked_seq
            } else if subscriber.last_sent_seq < seq {
                subscriber.last_sent_seq
            } else {
                return None;
            };

        let entry = self.state.history_entry(reference);
        let key = (seq, entry.map(|entry| entry.seq));
        if let Some(message) = cache.get(&key) {
            return Some(message.clone());
        }

        let message = match entry.map(|entry| entry.delta.compressed()) {
            Some(Ok(delta)) => TopicMessage::delta(&*self.name, seq, reference, delta),
            other => {
                if let Some(Err(e)) = other {
                    log::warn!("Topic {}: delta from {reference} unreadable: {e}", self.name);
                }
                match current.compressed() {
                    Ok(data) => TopicMessage::full(&*self.name, seq, data),
                    Err(e) => {
                        log::error!("Topic {}: cannot encode seq {seq}: {e}", self.name);
                        return None;
                    }
                }
            }
        };
        let key = (seq, message.delta_seq());
        match message.encode() {
            Ok(text) => {
                let text: Arc<str> = Arc::from(text);
                cache.insert(key, text.clone());
                Some(text)
            }
            Err(e) => {
                log::error!("Topic {}: {e}", self.name);
                None
            }
        }
    }

    fn restart_resend(&mut self) {
        let period = self.config.resend_timeout;
        if period.is_zero() {
            return;
        }
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.resend = Some(interval);
    }

    fn on_resend_tick(&mut self) {
        if self.subscribers.is_empty() {
            log::debug!("Topic {}: no subscribers left, stopping resend job", self.name);
            self.resend = None;
        } else {
            self.notify_all();
        }
    }

    fn snapshot(&self) -> TopicSnapshot {
        let current = self.state.current.as_deref();
        TopicSnapshot {
            name: self.name.to_string(),
            seq: self.state.seq,
            data: current.and_then(|dto| dto.compressed().ok()).map(str::to_owned),
            value: current.and_then(|dto| dto.value().ok()).cloned(),
            history: self.state.history.iter().map(|entry| entry.seq).collect(),
            subscribers: self.subscribers.len(),
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) -> Instant {
    match interval {
        Some(interval) => interval.tick().await,
        None => std::future::pending().await,
    }
}
