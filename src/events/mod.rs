pub mod bus;
pub mod event;

// Re-export common types
pub use bus::{EventBus, EventBusStats, Subscription};
pub use event::{Event, EventFilter, EventKind};
