//! Durable pub/sub for debate events.
//!
//! `publish` appends to the event journal first and only then broadcasts
//! to live subscribers, so replay can never contradict what a viewer saw.
//! A publish that fails the durable append is surfaced to the caller and
//! nothing is broadcast.
//!
//! Subscribers attach via Tokio broadcast channels; a slow subscriber
//! lags and drops on its own ring without ever stalling the publisher.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::debug;

use super::types::{DebateEvent, EventSeq};

/// Broadcast ring capacity per bus.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("event journal append failed: {0}")]
    JournalFailed(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Shared reference to the event bus.
pub type SharedEventBus = Arc<EventBus>;

/// Durable append target for published events.
///
/// Implemented by the storage adapter; the bus depends only on this
/// capability so failure injection in tests needs no real database.
pub trait EventJournal: Send + Sync + std::fmt::Debug {
    /// Durably append the event, returning its per-debate sequence number.
    fn append(&self, event: &DebateEvent) -> Result<EventSeq, String>;
}

/// Capability the orchestrator holds for emitting events.
pub trait EventSink: Send + Sync + std::fmt::Debug {
    /// Publish one event; returns the event with its assigned sequence.
    fn publish(&self, event: DebateEvent) -> BusResult<DebateEvent>;
}

/// Append-then-broadcast event bus.
#[derive(Debug)]
pub struct EventBus {
    journal: Arc<dyn EventJournal>,
    sender: broadcast::Sender<DebateEvent>,
    // Serializes append+send so broadcast order matches journal order.
    publish_lock: Mutex<()>,
}

impl EventBus {
    pub fn new(journal: Arc<dyn EventJournal>) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            journal,
            sender,
            publish_lock: Mutex::new(()),
        }
    }

    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Subscribe to the live stream.
    pub fn subscribe(&self) -> broadcast::Receiver<DebateEvent> {
        self.sender.subscribe()
    }

    /// Subscribe with a filter applied receiver-side.
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver {
            receiver: self.subscribe(),
            filter,
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventSink for EventBus {
    fn publish(&self, mut event: DebateEvent) -> BusResult<DebateEvent> {
        let _guard = self.publish_lock.lock().expect("publish lock poisoned");

        let seq = self
            .journal
            .append(&event)
            .map_err(BusError::JournalFailed)?;
        event.seq = seq;

        // No receivers is fine; the event is durable either way.
        let receivers = self.sender.send(event.clone()).unwrap_or(0);
        debug!(
            event_type = event.type_name(),
            seq,
            receivers,
            "event published"
        );
        Ok(event)
    }
}

/// Receiver-side subscription filter.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub debate_id: Option<String>,
    pub types: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debate(mut self, debate_id: &str) -> Self {
        self.debate_id = Some(debate_id.to_string());
        self
    }

    pub fn types(mut self, types: Vec<String>) -> Self {
        self.types = Some(types);
        self
    }

    /// Whether an event passes this filter.
    pub fn matches(&self, event: &DebateEvent) -> bool {
        if let Some(ref want) = self.debate_id {
            match event.debate_id.as_deref() {
                Some(id) if id == want => {}
                // Unscoped system events pass a debate filter.
                None => {}
                Some(_) => return false,
            }
        }
        if let Some(ref types) = self.types {
            if !types.iter().any(|t| t == event.type_name()) {
                return false;
            }
        }
        true
    }
}

/// A broadcast receiver that yields only matching events.
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<DebateEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    /// Receive the next matching event.
    ///
    /// `RecvError::Lagged` is passed through so callers can resync from
    /// the journal when they fall behind.
    pub async fn recv(&mut self) -> Result<DebateEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::EventKind;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug)]
    struct MemJournal {
        next: AtomicU64,
        fail: bool,
    }

    impl MemJournal {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                next: AtomicU64::new(1),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                next: AtomicU64::new(1),
                fail: true,
            })
        }
    }

    impl EventJournal for MemJournal {
        fn append(&self, _event: &DebateEvent) -> Result<EventSeq, String> {
            if self.fail {
                return Err("disk full".to_string());
            }
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn round_start(debate: &str, round: u32) -> DebateEvent {
        DebateEvent::debate(debate, EventKind::RoundStart { round }).with_round(round)
    }

    #[tokio::test]
    async fn test_publish_assigns_sequence_and_broadcasts() {
        let bus = EventBus::new(MemJournal::ok());
        let mut rx = bus.subscribe();

        let published = bus.publish(round_start("d-1", 1)).unwrap();
        assert_eq!(published.seq, 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.seq, 1);
        assert_eq!(received.type_name(), "round_start");
    }

    #[tokio::test]
    async fn test_journal_failure_suppresses_broadcast() {
        let bus = EventBus::new(MemJournal::failing());
        let mut rx = bus.subscribe();

        let err = bus.publish(round_start("d-1", 1)).unwrap_err();
        assert!(matches!(err, BusError::JournalFailed(_)));

        // Nothing must have been broadcast.
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_sequence_strictly_increasing() {
        let bus = EventBus::new(MemJournal::ok());
        let mut last = 0;
        for round in 1..=10 {
            let event = bus.publish(round_start("d-1", round)).unwrap();
            assert!(event.seq > last);
            last = event.seq;
        }
    }

    #[tokio::test]
    async fn test_filtered_receiver() {
        let bus = EventBus::new(MemJournal::ok());
        let mut filtered = bus.subscribe_filtered(
            EventFilter::new()
                .debate("d-target")
                .types(vec!["round_start".to_string()]),
        );

        bus.publish(round_start("d-other", 1)).unwrap();
        bus.publish(
            DebateEvent::debate(
                "d-target",
                EventKind::TokenDelta {
                    text: "x".to_string(),
                },
            ),
        )
        .unwrap();
        bus.publish(round_start("d-target", 1)).unwrap();

        let event = filtered.recv().await.unwrap();
        assert_eq!(event.debate_id.as_deref(), Some("d-target"));
        assert_eq!(event.type_name(), "round_start");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new(MemJournal::ok());
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(round_start("d-1", 1)).unwrap();
    }
}
