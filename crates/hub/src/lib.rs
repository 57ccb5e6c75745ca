//! Kuview hub: the keyed snapshot cache, the emit merge point, and the
//! fan-out distributor.
//!
//! Producers (the watch adapter and the metrics poller) push events through
//! [`Emitter::emit`]; subscribers attach through [`Hub::snapshot_and_subscribe`].
//! A single reader-writer lock guards the cache and the subscriber set, which
//! is what makes "subscribe and miss nothing, see nothing twice" hold: the
//! snapshot is built and the queue registered without any emit in between.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use kuview_core::{Event, EventType};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Queue depth for each subscriber. Bounds memory per subscriber; once full,
/// further events are dropped for that subscriber only.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 1024;

struct HubState {
    cache: FxHashMap<String, Value>,
    subscribers: FxHashMap<u64, mpsc::Sender<Arc<Event>>>,
}

/// Shared cache + subscriber registry. Cheap to clone behind an [`Arc`].
pub struct Hub {
    state: RwLock<HubState>,
    next_id: AtomicU64,
}

/// Producer handle. Dropping every clone closes the ingress channel, which
/// shuts the distributor down and with it every subscriber queue.
#[derive(Clone)]
pub struct Emitter {
    hub: Arc<Hub>,
    tx: mpsc::Sender<Arc<Event>>,
}

/// One subscriber's end of the fan-out. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    hub: Arc<Hub>,
    pub rx: mpsc::Receiver<Arc<Event>>,
}

/// Construct the hub and start its distributor task. `ingress_cap` bounds
/// the channel between emitters and the distributor.
pub fn spawn(ingress_cap: usize) -> (Emitter, Arc<Hub>) {
    let (tx, rx) = mpsc::channel(ingress_cap.max(1));
    let hub = Arc::new(Hub {
        state: RwLock::new(HubState {
            cache: FxHashMap::default(),
            subscribers: FxHashMap::default(),
        }),
        next_id: AtomicU64::new(0),
    });
    tokio::spawn(distribute(Arc::clone(&hub), rx));
    (Emitter { hub: Arc::clone(&hub), tx }, hub)
}

impl Emitter {
    /// Apply the event to the cache, then publish it. The mutation is
    /// complete before the event can reach any subscriber; the channel send
    /// happens after the lock is released.
    pub async fn emit(&self, event: Event) {
        self.hub.apply(&event);
        if self.tx.send(Arc::new(event)).await.is_err() {
            // Only possible if the distributor died before the emitters.
            warn!("distributor gone; event not published");
        }
    }
}

impl Hub {
    fn apply(&self, event: &Event) {
        let key = event.cache_key();
        let mut st = self.state.write().unwrap();
        match event.event_type {
            EventType::Create => {
                st.cache.insert(key, event.object.clone());
            }
            EventType::Delete => {
                // Removing a missing key is a no-op.
                st.cache.remove(&key);
            }
        }
    }

    /// Snapshot the cache as synthetic `create` events and register a new
    /// subscriber queue, both under one exclusive lock so no emit can land
    /// between the two steps. Snapshot order is unspecified.
    pub fn snapshot_and_subscribe(self: &Arc<Self>) -> (Vec<Arc<Event>>, Subscription) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (snapshot, total) = {
            let mut st = self.state.write().unwrap();
            let snapshot: Vec<Arc<Event>> = st
                .cache
                .values()
                .map(|obj| Arc::new(Event::create(obj.clone())))
                .collect();
            st.subscribers.insert(id, tx);
            (snapshot, st.subscribers.len())
        };
        gauge!("kuview_subscribers", total as f64);
        debug!(id, snapshot = snapshot.len(), "subscriber registered");
        (snapshot, Subscription { id, hub: Arc::clone(self), rx })
    }

    /// Remove a subscriber. Idempotent: removing an already-removed id does
    /// nothing.
    pub fn unsubscribe(&self, id: u64) {
        let mut st = self.state.write().unwrap();
        if st.subscribers.remove(&id).is_some() {
            gauge!("kuview_subscribers", st.subscribers.len() as f64);
            debug!(id, "subscriber removed");
        }
    }

    pub fn cache_len(&self) -> usize {
        self.state.read().unwrap().cache.len()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.read().unwrap().cache.get(key).cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.read().unwrap().subscribers.len()
    }
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

async fn distribute(hub: Arc<Hub>, mut ingress: mpsc::Receiver<Arc<Event>>) {
    while let Some(event) = ingress.recv().await {
        // Copy the handles out so the sends run without the lock held.
        let subs: Vec<mpsc::Sender<Arc<Event>>> = {
            let st = hub.state.read().unwrap();
            st.subscribers.values().cloned().collect()
        };
        for tx in subs {
            match tx.try_send(Arc::clone(&event)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    // Slow consumer; the event is dropped for this
                    // subscriber and the next same-key event restores truth.
                    counter!("kuview_fanout_dropped_total", 1u64);
                }
                Err(TrySendError::Closed(_)) => {
                    // Subscriber is mid-unsubscribe.
                }
            }
        }
    }

    // Ingress closed: drop every subscriber queue so the handlers exit.
    let mut st = hub.state.write().unwrap();
    let drained = st.subscribers.len();
    st.subscribers.clear();
    gauge!("kuview_subscribers", 0.0);
    info!(subscribers = drained, "distributor stopped");
}
