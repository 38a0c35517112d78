//! Typed pub/sub for loop lifecycle events

mod bus;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventEmitter, create_event_bus};
pub use types::{LoopEvent, LoopEventKind};
