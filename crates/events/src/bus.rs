//! Event publishing/subscription abstraction.
//!
//! Delivery is **fire-and-forget**: `publish` hands a clone of the message to
//! every live subscriber's channel and returns without waiting for anyone to
//! read it. A subscriber that stops reading only grows its own backlog; it
//! never slows the publisher down. A subscriber that drops its
//! [`Subscription`] is pruned on the next publish.
//!
//! ## Usage Pattern
//!
//! ```ignore
//! let subscription = bus.subscribe();
//!
//! loop {
//!     match subscription.recv_timeout(Duration::from_secs(1)) {
//!         Ok(event) => handle(event),
//!         Err(RecvTimeoutError::Timeout) => continue,       // check for shutdown
//!         Err(RecvTimeoutError::Disconnected) => break,     // bus dropped
//!     }
//! }
//! ```

use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

/// Predicate deciding whether a subscriber wants a given message.
pub type EventFilter<M> = Box<dyn Fn(&M) -> bool + Send + Sync>;

/// The receiving half of one subscriber.
///
/// Messages arrive in publish order. A subscription is meant to be read from
/// one thread; hand messages on through another channel to fan them out.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Take everything that is already queued, without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Publish-subscribe transport for lifecycle events.
///
/// Implementations must be safe to publish to from several threads at once
/// (HTTP handlers, worker callbacks and timers all end up publishing).
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    /// Deliver `message` to every interested subscriber. Returns how many
    /// subscribers received it.
    fn publish(&self, message: M) -> Result<usize, Self::Error>;

    /// Subscribe to every message.
    fn subscribe(&self) -> Subscription<M>;

    /// Subscribe to the messages accepted by `filter`.
    fn subscribe_filtered(&self, filter: EventFilter<M>) -> Subscription<M>;

    /// Number of live subscribers (as of the last publish).
    fn subscriber_count(&self) -> usize;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<usize, Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }

    fn subscribe_filtered(&self, filter: EventFilter<M>) -> Subscription<M> {
        (**self).subscribe_filtered(filter)
    }

    fn subscriber_count(&self) -> usize {
        (**self).subscriber_count()
    }
}
