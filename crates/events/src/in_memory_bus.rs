//! In-process pub/sub bus backed by unbounded channels.

use std::sync::{Mutex, mpsc};

use crate::bus::{EventBus, EventFilter, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The subscriber list lock was poisoned by a panicking publisher.
    #[error("event bus subscriber list poisoned")]
    Poisoned,
}

struct Subscriber<M> {
    tx: mpsc::Sender<M>,
    filter: Option<EventFilter<M>>,
}

impl<M> Subscriber<M> {
    fn wants(&self, message: &M) -> bool {
        self.filter.as_ref().is_none_or(|f| f(message))
    }
}

/// In-memory pub/sub bus.
///
/// - No IO, no async: `publish` is a handful of channel sends
/// - Unbounded per-subscriber buffers, so publishing never blocks
/// - Dead subscribers are dropped lazily on publish
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<Subscriber<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, filter: Option<EventFilter<M>>) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();

        // A poisoned list still hands out a subscription; it just never
        // receives anything.
        match self.subscribers.lock() {
            Ok(mut subs) => subs.push(Subscriber { tx, filter }),
            Err(_) => tracing::warn!("event bus poisoned; subscription will stay silent"),
        }

        Subscription::new(rx)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<M> core::fmt::Debug for InMemoryEventBus<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let count = self.subscribers.lock().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("InMemoryEventBus")
            .field("subscribers", &count)
            .finish()
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = BusError;

    fn publish(&self, message: M) -> Result<usize, Self::Error> {
        let mut subs = self.subscribers.lock().map_err(|_| BusError::Poisoned)?;

        let mut delivered = 0;
        subs.retain(|sub| {
            if !sub.wants(&message) {
                return true;
            }
            match sub.tx.send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });

        Ok(delivered)
    }

    fn subscribe(&self) -> Subscription<M> {
        self.register(None)
    }

    fn subscribe_filtered(&self, filter: EventFilter<M>) -> Subscription<M> {
        self.register(Some(filter))
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}
