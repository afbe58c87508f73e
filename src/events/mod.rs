//! Typed events and the durable pub/sub bus that fans them out.

pub mod bus;
pub mod types;

pub use bus::{
    BusError, BusResult, EventBus, EventFilter, EventJournal, EventSink, FilteredReceiver,
    SharedEventBus,
};
pub use types::{DebateEvent, DebateOutcome, EventKind, EventSeq};
