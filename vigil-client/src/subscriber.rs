//! Subscriber registration and notification queues.
//!
//! Each connected client registers once, watches a set of script
//! addresses, and drains a bounded notification queue from its writer
//! task. The registry is the address-interest oracle the mempool filter
//! consults, the sink the parser fans out into, and the status sink the
//! node pump reports to.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use vigil_chain::transparent::ScriptAddr;

use vigil_mempool::notification::{NotificationSink, SubscriberNotification};
use vigil_mempool::parsed_tx::AddrInterest;
use vigil_mempool::tracker::{BroadcastOutcome, RequestId};
use vigil_mempool::{HashState, SubscriberId};

use vigil_node::{NodeStatus, StatusSink};

use crate::messages::{BroadcastErrorCode, ClientNotification};
use crate::NOTIFICATION_QUEUE_DEPTH;

struct SubscriberEntry {
    watched: BTreeSet<ScriptAddr>,
    queue: mpsc::Sender<ClientNotification>,
}

#[derive(Default)]
struct Registered {
    next_id: u64,
    subscribers: HashMap<SubscriberId, SubscriberEntry>,
    watchers: BTreeMap<ScriptAddr, BTreeSet<SubscriberId>>,
    /// Broadcast request → the subscriber awaiting its outcomes.
    requests: HashMap<RequestId, SubscriberId>,
}

/// The shared registry of connected clients.
#[derive(Default)]
pub struct SubscriberRegistry {
    inner: RwLock<Registered>,
    last_status: Mutex<Option<NodeStatus>>,
}

impl SubscriberRegistry {
    pub fn new() -> SubscriberRegistry {
        SubscriberRegistry::default()
    }

    /// Register a new subscriber; the receiver is its notification
    /// stream.
    pub fn register(&self) -> (SubscriberId, mpsc::Receiver<ClientNotification>) {
        let (tx, rx) = mpsc::channel(NOTIFICATION_QUEUE_DEPTH);
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.next_id += 1;
        let id = SubscriberId(inner.next_id);
        inner.subscribers.insert(
            id,
            SubscriberEntry {
                watched: BTreeSet::new(),
                queue: tx,
            },
        );
        metrics::gauge!("client.subscribers").set(inner.subscribers.len() as f64);
        debug!(%id, "subscriber registered");
        (id, rx)
    }

    /// Tear down a subscriber: its watches, queues, and request
    /// bindings. In-flight snapshot references simply drop.
    pub fn unregister(&self, id: SubscriberId) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if let Some(entry) = inner.subscribers.remove(&id) {
            for scraddr in entry.watched {
                if let Some(set) = inner.watchers.get_mut(&scraddr) {
                    set.remove(&id);
                    if set.is_empty() {
                        inner.watchers.remove(&scraddr);
                    }
                }
            }
        }
        inner.requests.retain(|_, subscriber| *subscriber != id);
        metrics::gauge!("client.subscribers").set(inner.subscribers.len() as f64);
        debug!(%id, "subscriber unregistered");
    }

    /// Add watched addresses for a subscriber. Returns false for an
    /// unknown id.
    pub fn watch(&self, id: SubscriberId, scraddrs: &[ScriptAddr]) -> bool {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if !inner.subscribers.contains_key(&id) {
            return false;
        }
        for scraddr in scraddrs {
            inner.watchers.entry(*scraddr).or_default().insert(id);
        }
        let entry = inner.subscribers.get_mut(&id).expect("checked above");
        entry.watched.extend(scraddrs.iter().copied());
        true
    }

    /// The watched set of one subscriber.
    pub fn watched(&self, id: SubscriberId) -> BTreeSet<ScriptAddr> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .subscribers
            .get(&id)
            .map(|entry| entry.watched.clone())
            .unwrap_or_default()
    }

    /// Route a broadcast request's outcomes to this subscriber.
    pub fn bind_request(&self, request_id: RequestId, subscriber: SubscriberId) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.requests.insert(request_id, subscriber);
    }

    /// Push a notification to every connected subscriber.
    pub fn broadcast_all(&self, notification: ClientNotification) {
        let inner = self.inner.read().expect("registry lock poisoned");
        for (id, entry) in &inner.subscribers {
            Self::push(*id, entry, notification.clone());
        }
    }

    /// Push to one subscriber. A full queue drops the notification; the
    /// at-least-once contract covers redelivery from snapshot state on
    /// reconnect.
    fn push(id: SubscriberId, entry: &SubscriberEntry, notification: ClientNotification) {
        if let Err(error) = entry.queue.try_send(notification) {
            warn!(%id, %error, "notification queue full, dropping");
            metrics::counter!("client.notifications.dropped").increment(1);
        }
    }

    /// Push a notification to one subscriber's queue.
    pub fn notify_one(&self, id: SubscriberId, notification: ClientNotification) {
        let inner = self.inner.read().expect("registry lock poisoned");
        if let Some(entry) = inner.subscribers.get(&id) {
            Self::push(id, entry, notification);
        }
    }

    pub fn last_node_status(&self) -> Option<NodeStatus> {
        *self.last_status.lock().expect("status lock poisoned")
    }
}

impl AddrInterest for SubscriberRegistry {
    fn watchers_of(&self, scraddr: &ScriptAddr) -> BTreeSet<SubscriberId> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.watchers.get(scraddr).cloned().unwrap_or_default()
    }
}

impl NotificationSink for SubscriberRegistry {
    fn notify(&self, subscriber: SubscriberId, notification: SubscriberNotification) {
        trace!(%subscriber, sequence = notification.sequence(), "fan-out");
        self.notify_one(
            subscriber,
            ClientNotification::from_subscriber_notification(notification),
        );
    }

    fn broadcast_outcome(&self, outcome: BroadcastOutcome) {
        let subscriber = {
            let inner = self.inner.read().expect("registry lock poisoned");
            inner.requests.get(&outcome.request_id).copied()
        };
        let Some(subscriber) = subscriber else {
            trace!(request_id = ?outcome.request_id, "outcome for unbound request");
            return;
        };

        let BroadcastOutcome {
            request_id,
            hash,
            state,
        } = outcome;
        let notification = match state {
            HashState::SeenInSnapshot => ClientNotification::BroadcastSuccess {
                request_id: request_id.0,
                hash,
            },
            other => match BroadcastErrorCode::from_hash_state(other) {
                Some(code) => ClientNotification::BroadcastError {
                    request_id: request_id.0,
                    hash,
                    code,
                },
                None => return,
            },
        };
        self.notify_one(subscriber, notification);
    }
}

impl StatusSink for SubscriberRegistry {
    fn node_status(&self, status: NodeStatus) {
        let first = {
            let mut last = self.last_status.lock().expect("status lock poisoned");
            let first = last.is_none();
            *last = Some(status);
            first
        };
        self.broadcast_all(ClientNotification::NodeStatus(status));
        // the first connected status means the intake pipeline is live
        if first && status.connected {
            self.broadcast_all(ClientNotification::Ready {
                height: status.height,
            });
        }
    }

    fn new_block(&self, height: u32) {
        self.broadcast_all(ClientNotification::NewBlock { height });
    }
}
