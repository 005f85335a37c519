//! Phase-transition fan-out: a live per-pipeline topic plus the durable
//! per-pipeline log that late joiners replay.
//!
//! Neither write is transactional with the run record. The store is the
//! source of truth; a dropped event only delays what a live viewer sees.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::run::PhaseEvent;
use crate::store::Store;

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("Durable phase log append failed: {0}")]
    Durable(#[from] crate::error::StoreError),
    #[error("Subscriber registry lock poisoned")]
    Poisoned,
}

pub fn logs_topic(pipeline_id: &str) -> String {
    format!("pipeline:{pipeline_id}:logs")
}

pub fn phases_key(pipeline_id: &str) -> String {
    format!("pipeline:{pipeline_id}:phases")
}

/// Where the engine sends phase events.
pub trait PhasePublisher: Send + Sync {
    fn publish(&self, event: &PhaseEvent) -> Result<(), BroadcastError>;
}

type Topics = HashMap<String, Vec<(u64, Sender<PhaseEvent>)>>;

#[derive(Clone)]
pub struct Broadcaster {
    store: Store,
    topics: Arc<Mutex<Topics>>,
    next_id: Arc<AtomicU64>,
}

impl Broadcaster {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            topics: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Live events only; nothing published before this call is delivered.
    pub fn subscribe(&self, pipeline_id: &str) -> Result<Subscription, BroadcastError> {
        let (tx, rx) = mpsc::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let topic = logs_topic(pipeline_id);
        self.topics
            .lock()
            .map_err(|_| BroadcastError::Poisoned)?
            .entry(topic.clone())
            .or_default()
            .push((id, tx));
        debug!(topic = topic.as_str(), subscriber = id, "Subscribed");
        Ok(Subscription {
            id,
            topic,
            receiver: rx,
            topics: Arc::clone(&self.topics),
        })
    }

    pub fn subscriber_count(&self, pipeline_id: &str) -> usize {
        self.topics
            .lock()
            .map(|topics| topics.get(&logs_topic(pipeline_id)).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Full unexpired history from the durable log.
    pub fn replay(&self, pipeline_id: &str) -> Result<Vec<PhaseEvent>, BroadcastError> {
        Ok(self.store.events(pipeline_id)?)
    }

    fn publish_live(&self, event: &PhaseEvent) -> Result<usize, BroadcastError> {
        let topic = logs_topic(&event.pipeline_id);
        let mut topics = self.topics.lock().map_err(|_| BroadcastError::Poisoned)?;
        let Some(subscribers) = topics.get_mut(&topic) else {
            return Ok(0);
        };
        subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        Ok(subscribers.len())
    }
}

impl PhasePublisher for Broadcaster {
    fn publish(&self, event: &PhaseEvent) -> Result<(), BroadcastError> {
        match self.publish_live(event) {
            Ok(delivered) => debug!(
                pipeline_id = event.pipeline_id.as_str(),
                phase = event.phase.as_str(),
                delivered,
                "Phase event published"
            ),
            Err(err) => warn!(error = %err, "Live publish failed"),
        }
        self.store.append_event(event)?;
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("Subscription closed")]
    Closed,
}

/// Handle on a live topic. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    topic: String,
    receiver: Receiver<PhaseEvent>,
    topics: Arc<Mutex<Topics>>,
}

impl Subscription {
    /// Waits at most `timeout`; `Ok(None)` when nothing arrived.
    pub fn poll(&self, timeout: Duration) -> Result<Option<PhaseEvent>, SubscriptionError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SubscriptionError::Closed),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut topics) = self.topics.lock() {
            if let Some(subscribers) = topics.get_mut(&self.topic) {
                subscribers.retain(|(id, _)| *id != self.id);
                if subscribers.is_empty() {
                    topics.remove(&self.topic);
                }
            }
        }
        debug!(topic = self.topic.as_str(), subscriber = self.id, "Unsubscribed");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    Completed,
    Disconnected,
    Failed(String),
}

/// Forwards live events to `sink` until the `complete` sentinel, a sink
/// error (client gone), or a broken subscription. The subscription is
/// released on every exit path.
pub fn stream_logs<F, E>(subscription: Subscription, poll_interval: Duration, mut sink: F) -> StreamEnd
where
    F: FnMut(&PhaseEvent) -> Result<(), E>,
    E: std::fmt::Display,
{
    loop {
        match subscription.poll(poll_interval) {
            Ok(Some(event)) => {
                if let Err(err) = sink(&event) {
                    debug!(topic = subscription.topic(), error = %err, "Log stream client disconnected");
                    return StreamEnd::Disconnected;
                }
                if event.is_complete() {
                    return StreamEnd::Completed;
                }
            }
            Ok(None) => std::thread::yield_now(),
            Err(err) => {
                warn!(topic = subscription.topic(), error = %err, "Log stream aborted");
                return StreamEnd::Failed(err.to_string());
            }
        }
    }
}
