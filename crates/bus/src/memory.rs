use async_trait::async_trait;
use meshcell_core::{Error, Result, TopicPattern};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::debug;

use crate::bus::{Bus, BusConnector, BusMessage, Subscription};

struct Subscriber {
    pattern: TopicPattern,
    tx: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    closed: AtomicBool,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
}

impl Inner {
    fn subscribers(&self) -> MutexGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process bus. Routes every published message to all matching subscribers.
///
/// Used directly for single-process deployments and tests, and as the router
/// behind the WebSocket hub.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a message, returning how many subscribers received it.
    pub fn route(&self, message: BusMessage) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::Closed("memory bus is closed".to_string()));
        }
        let mut subscribers = self.inner.subscribers();
        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, sub) in subscribers.iter() {
            if !sub.pattern.matches(&message.topic) {
                continue;
            }
            if sub.tx.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(*id);
            }
        }
        for id in dead {
            subscribers.remove(&id);
        }
        if delivered == 0 {
            debug!(topic = %message.topic, "No subscribers for message");
        }
        Ok(delivered)
    }

    /// Close the bus: every open subscription ends and later calls fail.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.subscribers().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish_message(&self, message: BusMessage) -> Result<()> {
        self.route(message).map(|_| ())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        let parsed = TopicPattern::parse(pattern)?;
        if self.is_closed() {
            return Err(Error::Closed("memory bus is closed".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers().insert(id, Subscriber { pattern: parsed, tx });

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Ok(Subscription::new(pattern, rx, move || {
            if let Some(inner) = weak.upgrade() {
                inner.subscribers().remove(&id);
            }
        }))
    }

    fn is_connected(&self) -> bool {
        !self.is_closed()
    }
}

#[async_trait]
impl BusConnector for MemoryBus {
    async fn connect(&self) -> Result<Arc<dyn Bus>> {
        if self.is_closed() {
            return Err(Error::Connection("memory bus is closed".to_string()));
        }
        Ok(Arc::new(self.clone()))
    }
}
