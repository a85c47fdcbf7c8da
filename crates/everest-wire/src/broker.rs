//! Broker: in-process topic fan-out shared by all modules of an endpoint.
//!
//! A [`Broker`] is looked up by its endpoint string (`host:port`). Every
//! module that connects to the same endpoint in this process gets a handle to
//! the same subscription table, so modules address each other purely by
//! topic. Frames are delivered synchronously into the subscribers'
//! channels in publish order.

use crossbeam::channel::{Sender, TrySendError};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use tracing::{debug, warn};

use crate::WireError;

/// A frame delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub frame: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Subscription {
    client_id: String,
    sink: Sender<Delivery>,
}

/// Handle to the subscription table of one broker endpoint.
#[derive(Debug, Clone)]
pub struct Broker {
    endpoint: Arc<str>,
    topics: Arc<RwLock<HashMap<String, Vec<Subscription>>>>,
}

/// All brokers of this process, by endpoint.
fn brokers() -> &'static DashMap<String, Broker> {
    static BROKERS: OnceLock<DashMap<String, Broker>> = OnceLock::new();
    BROKERS.get_or_init(DashMap::new)
}

impl Broker {
    /// Connect to the broker serving `endpoint`, creating it on first use.
    pub fn connect(endpoint: &str) -> Broker {
        brokers()
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                debug!(endpoint, "Creating broker");
                Broker {
                    endpoint: Arc::from(endpoint),
                    topics: Arc::new(RwLock::new(HashMap::new())),
                }
            })
            .clone()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Subscribe `client_id` to `topic`. Subscribing the same client twice
    /// replaces its sink instead of duplicating deliveries.
    pub fn subscribe(&self, topic: &str, client_id: &str, sink: Sender<Delivery>) {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        let subs = topics.entry(topic.to_string()).or_default();
        if let Some(existing) = subs.iter_mut().find(|s| s.client_id == client_id) {
            existing.sink = sink;
        } else {
            subs.push(Subscription {
                client_id: client_id.to_string(),
                sink,
            });
        }
        debug!(endpoint = %self.endpoint, topic, client_id, "Subscribed");
    }

    /// Remove one subscription.
    pub fn unsubscribe(&self, topic: &str, client_id: &str) {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| s.client_id != client_id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Remove every subscription of a client.
    pub fn unsubscribe_client(&self, client_id: &str) {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        topics.retain(|_, subs| {
            subs.retain(|s| s.client_id != client_id);
            !subs.is_empty()
        });
    }

    /// Publish a frame on a topic. Returns the number of subscribers it was
    /// handed to; zero is not an error here.
    pub fn publish(&self, topic: &str, frame: Vec<u8>) -> usize {
        // Sinks are cloned out so no lock is held while delivering.
        let subs: Vec<Subscription> = {
            let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
            match topics.get(topic) {
                Some(subs) => subs.clone(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut gone = Vec::new();
        for sub in subs {
            let delivery = Delivery {
                topic: topic.to_string(),
                frame: frame.clone(),
            };
            match sub.sink.try_send(delivery) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(topic, client_id = %sub.client_id, "Subscriber queue full, frame dropped");
                }
                Err(TrySendError::Disconnected(_)) => gone.push(sub.client_id),
            }
        }
        for client_id in gone {
            debug!(topic, %client_id, "Pruning disconnected subscriber");
            self.unsubscribe(topic, &client_id);
        }
        delivered
    }

    /// Publish a frame that must reach at least one subscriber.
    pub fn publish_to_listener(&self, topic: &str, frame: Vec<u8>) -> Result<usize, WireError> {
        match self.publish(topic, frame) {
            0 => Err(WireError::NoSubscribers(topic.to_string())),
            n => Ok(n),
        }
    }

    /// Number of live subscriptions on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
        topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    /// Drop this handle. The endpoint leaves the process-wide registry once
    /// its table is empty and no other handle refers to it.
    pub fn disconnect(self) {
        // Holding the registry shard lock: no new handle can be cloned out
        // while the reference count is checked.
        let removed = brokers().remove_if(self.endpoint.as_ref(), |_, registered| {
            Arc::ptr_eq(&registered.topics, &self.topics)
                && Arc::strong_count(&self.topics) == 2
                && self
                    .topics
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .is_empty()
        });
        if removed.is_some() {
            debug!(endpoint = %self.endpoint, "Broker released");
        }
    }
}
