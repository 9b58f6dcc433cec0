//! Downstream subscriber registry and event fan-out.
//!
//! Each connected consumer gets a bounded outbound queue and an event filter.
//! Delivery is independent per subscriber: a full or closed queue disconnects
//! only that subscriber and never stalls the broadcast path.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use voxgate_core::events::GatewayEvent;
use voxgate_core::ids::ClientId;

use crate::wire;

const HISTORY_CAPACITY: usize = 100;

/// Which event types a subscriber wants. The literal `"all"` in a subscribe
/// frame maps to `All`, as does an absent `events` field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Subscription {
    All,
    Events(HashSet<String>),
}

impl Subscription {
    pub fn from_events(events: Option<Vec<String>>) -> Self {
        match events {
            None => Self::All,
            Some(list) if list.iter().any(|e| e == "all") => Self::All,
            Some(list) => Self::Events(list.into_iter().collect()),
        }
    }

    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::All => true,
            Self::Events(set) => set.contains(event_type),
        }
    }

    fn describe(&self) -> Value {
        match self {
            Self::All => json!("all"),
            Self::Events(set) => {
                let mut list: Vec<&str> = set.iter().map(String::as_str).collect();
                list.sort_unstable();
                json!(list)
            }
        }
    }
}

/// One downstream connection. The registry holds the sender half of the
/// outbound queue; the connection's writer task drains the receiver.
pub struct Subscriber {
    pub id: ClientId,
    tx: mpsc::Sender<String>,
    subscription: RwLock<Subscription>,
    cancel: CancellationToken,
    connected_at: f64,
    last_message_at: Mutex<Option<f64>>,
    message_count: AtomicU64,
    history: Mutex<VecDeque<Value>>,
}

impl Subscriber {
    fn new(id: ClientId, subscription: Subscription, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            subscription: RwLock::new(subscription),
            cancel: CancellationToken::new(),
            connected_at: wire::unix_now(),
            last_message_at: Mutex::new(None),
            message_count: AtomicU64::new(0),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn wants(&self, event_type: &str) -> bool {
        self.subscription.read().matches(event_type)
    }

    pub fn set_subscription(&self, subscription: Subscription) {
        *self.subscription.write() = subscription;
    }

    /// Tell the connection's writer task to shut the socket down.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Control frames (pong, snapshot) bypass the history ring.
    pub fn send_control(&self, text: String) -> bool {
        self.tx.try_send(text).is_ok()
    }

    /// Queue one event frame. `Err` means the queue was full or closed and the
    /// subscriber should be dropped.
    fn deliver(&self, text: String, frame: &Value) -> Result<(), ()> {
        self.tx.try_send(text).map_err(|_| ())?;
        self.message_count.fetch_add(1, Ordering::Relaxed);
        *self.last_message_at.lock() = Some(wire::unix_now());
        let mut history = self.history.lock();
        while history.len() >= HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(frame.clone());
        Ok(())
    }

    pub fn history(&self) -> Vec<Value> {
        self.history.lock().iter().cloned().collect()
    }

    fn describe(&self) -> Value {
        json!({
            "clientId": self.id,
            "events": self.subscription.read().describe(),
            "connectedAt": self.connected_at,
            "lastMessageAt": *self.last_message_at.lock(),
            "messageCount": self.message_count.load(Ordering::Relaxed),
        })
    }
}

/// All connected subscribers, keyed by client id.
pub struct SubscriberRegistry {
    subscribers: DashMap<ClientId, Arc<Subscriber>>,
    max_send_queue: usize,
}

impl SubscriberRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a subscriber. A live subscriber under the same id is
    /// superseded: its connection is force-closed and its entry replaced, so
    /// clients reconnect cleanly without server-side cleanup.
    pub fn register(
        &self,
        id: ClientId,
        subscription: Subscription,
    ) -> (Arc<Subscriber>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let subscriber = Arc::new(Subscriber::new(id.clone(), subscription, tx));
        if let Some(old) = self
            .subscribers
            .insert(id.clone(), Arc::clone(&subscriber))
        {
            debug!(client_id = %id, "superseding existing subscriber");
            old.close();
        }
        (subscriber, rx)
    }

    /// Remove only if the stored entry is this exact subscriber, so a
    /// superseded connection's teardown cannot unregister its replacement.
    pub fn remove_if_same(&self, id: &ClientId, subscriber: &Arc<Subscriber>) -> bool {
        self.subscribers
            .remove_if(id, |_, existing| Arc::ptr_eq(existing, subscriber))
            .is_some()
    }

    pub fn update_subscription(&self, id: &ClientId, subscription: Subscription) -> bool {
        match self.subscribers.get(id) {
            Some(entry) => {
                entry.set_subscription(subscription);
                true
            }
            None => false,
        }
    }

    /// Fan one event out to every matching subscriber. Serialization happens
    /// once; each delivery is isolated and an overflowing queue drops that
    /// subscriber alone.
    pub fn broadcast(&self, event: &GatewayEvent) {
        let frame = wire::event_frame(event);
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to serialize event frame");
                return;
            }
        };
        let event_type = event.event_type();

        let mut dropped: Vec<Arc<Subscriber>> = Vec::new();
        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if !subscriber.wants(event_type) {
                continue;
            }
            if subscriber.deliver(text.clone(), &frame).is_err() {
                dropped.push(Arc::clone(subscriber));
            }
        }
        // Removal outside the iteration; DashMap shards stay unlocked.
        for subscriber in dropped {
            warn!(client_id = %subscriber.id, "send queue overflow, dropping subscriber");
            subscriber.close();
            self.remove_if_same(&subscriber.id, &subscriber);
        }
    }

    pub fn count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn describe(&self) -> Vec<Value> {
        self.subscribers
            .iter()
            .map(|entry| entry.value().describe())
            .collect()
    }

    pub fn history_of(&self, id: &ClientId) -> Option<Vec<Value>> {
        self.subscribers.get(id).map(|entry| entry.history())
    }
}
