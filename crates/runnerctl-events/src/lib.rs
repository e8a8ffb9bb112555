mod bus;
mod error;
mod event;

pub use bus::EventBus;
pub use error::EventsError;
pub use event::{AllocationKind, DiscoveryKind, Event, EventKind, Phase};
