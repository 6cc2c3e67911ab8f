//! Event distribution mechanics (pub/sub), independent of what the events mean.
//!
//! The queue publishes typed lifecycle events through an [`EventBus`]; status
//! endpoints, push transports and render workers each hold their own
//! [`Subscription`] and read from it at their own pace.

pub mod bus;
pub mod in_memory_bus;

pub use bus::{EventBus, EventFilter, Subscription};
pub use in_memory_bus::{BusError, InMemoryEventBus};
