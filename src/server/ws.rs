//! WebSocket fan-out hub.
//!
//! Each subscriber gets: an auth check at upgrade, a `subscribe` frame,
//! a `sync` snapshot from the durable log, then live events. Every
//! connection owns a bounded outbound queue; a viewer that stops
//! reading is coalesced or dropped per policy and can never stall the
//! orchestrator. Heartbeats close dead connections.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::config::SlowClientPolicy;
use crate::engine::Engine;
use crate::events::{DebateEvent, EventFilter, EventKind};

/// How long a client gets to send its subscribe frame.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Snapshot size cap for the initial sync.
const SYNC_LIMIT: u32 = 1000;

/// Client-sent subscription request.
#[derive(Debug, serde::Deserialize, Default)]
struct SubscribeFrame {
    #[serde(default)]
    debate_id: Option<String>,
    #[serde(default)]
    types: Option<Vec<String>>,
    #[serde(default)]
    cursor: Option<u64>,
}

enum Push {
    Ok,
    Overflow,
}

/// Bounded per-connection outbound queue.
struct OutQueue {
    deque: Mutex<VecDeque<DebateEvent>>,
    notify: Notify,
    capacity: usize,
    policy: SlowClientPolicy,
}

impl OutQueue {
    fn new(capacity: usize, policy: SlowClientPolicy) -> Self {
        Self {
            deque: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    fn push(&self, event: DebateEvent) -> Push {
        let mut deque = self.deque.lock().expect("ws queue lock poisoned");
        if deque.len() >= self.capacity {
            match self.policy {
                SlowClientPolicy::Coalesce => {
                    Self::compact(&mut deque);
                    if deque.len() >= self.capacity {
                        return Push::Overflow;
                    }
                }
                SlowClientPolicy::DropOnFull => return Push::Overflow,
            }
        }
        deque.push_back(event);
        drop(deque);
        self.notify.notify_one();
        Push::Ok
    }

    /// Merge adjacent `token_delta` runs for the same agent turn.
    fn compact(deque: &mut VecDeque<DebateEvent>) {
        let mut compacted: VecDeque<DebateEvent> = VecDeque::with_capacity(deque.len());
        while let Some(event) = deque.pop_front() {
            let merged = match (compacted.back_mut(), &event.kind) {
                (Some(last), EventKind::TokenDelta { text })
                    if last.is_token_delta()
                        && last.agent == event.agent
                        && last.debate_id == event.debate_id =>
                {
                    if let EventKind::TokenDelta { text: prior } = &mut last.kind {
                        prior.push_str(text);
                        last.seq = event.seq;
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            };
            if !merged {
                compacted.push_back(event);
            }
        }
        *deque = compacted;
    }

    fn pop(&self) -> Option<DebateEvent> {
        self.deque
            .lock()
            .expect("ws queue lock poisoned")
            .pop_front()
    }
}

/// Drive one subscriber connection to completion.
pub async fn client_session(socket: WebSocket, engine: Arc<Engine>) {
    engine.metrics.ws_clients.inc();
    let result = run_session(socket, &engine).await;
    engine.metrics.ws_clients.dec();
    if let Err(reason) = result {
        debug!(reason, "ws session closed");
    }
}

async fn run_session(socket: WebSocket, engine: &Arc<Engine>) -> Result<(), &'static str> {
    let (mut sender, mut receiver) = socket.split();

    // Subscription handshake.
    let subscribe = tokio::time::timeout(SUBSCRIBE_TIMEOUT, receiver.next()).await;
    let frame = match subscribe {
        Ok(Some(Ok(Message::Text(text)))) => {
            serde_json::from_str::<SubscribeFrame>(&text).unwrap_or_default()
        }
        Ok(Some(Ok(_))) => SubscribeFrame::default(),
        _ => return Err("no subscribe frame"),
    };

    // Sync snapshot from the durable log before any live event.
    let snapshot = match &frame.debate_id {
        Some(debate_id) => engine
            .store
            .events_after(debate_id, frame.cursor.unwrap_or(0), SYNC_LIMIT)
            .unwrap_or_default(),
        None => Vec::new(),
    };
    let cursor = snapshot.last().map(|e| e.seq).unwrap_or(0);
    let sync = DebateEvent::system(EventKind::Sync {
        snapshot: serde_json::json!({"events": snapshot, "cursor": cursor}),
    });
    let payload = serde_json::to_string(&sync).map_err(|_| "sync serialization")?;
    // Sync frames may exceed the inbound frame cap; that bound applies
    // only to what clients send us.
    sender.send(Message::Text(payload)).await.map_err(|_| "send sync")?;

    let mut filter = EventFilter::new();
    if let Some(debate_id) = &frame.debate_id {
        filter = filter.debate(debate_id);
    }
    if let Some(types) = frame.types.clone() {
        filter = filter.types(types);
    }
    let mut live = engine.bus.subscribe_filtered(filter);

    let queue = Arc::new(OutQueue::new(
        engine.config.ws_queue_size,
        engine.config.slow_client_policy,
    ));
    let done = CancellationToken::new();
    let overflowed = Arc::new(AtomicBool::new(false));

    // Fan-out: bus → bounded queue. Never blocks on the socket.
    let fanout = {
        let queue = queue.clone();
        let done = done.clone();
        let overflowed = overflowed.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = done.canceled() => break,
                    event = live.recv() => event,
                };
                match event {
                    Ok(event) => {
                        if matches!(queue.push(event), Push::Overflow) {
                            overflowed.store(true, Ordering::Release);
                            done.cancel();
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "ws subscriber lagged the broadcast ring");
                        let notice = DebateEvent::system(EventKind::Error {
                            code: "lagged".to_string(),
                            message: format!("{missed} events dropped; resync with a cursor"),
                        });
                        if matches!(queue.push(notice), Push::Overflow) {
                            overflowed.store(true, Ordering::Release);
                            done.cancel();
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        done.cancel();
                        break;
                    }
                }
            }
        })
    };

    // Reader: track pongs, observe close. Protocol pings from the peer
    // are answered by the websocket layer itself.
    let last_pong = Arc::new(Mutex::new(Instant::now()));
    let reader = {
        let done = done.clone();
        let last_pong = last_pong.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = done.canceled() => break,
                    message = receiver.next() => message,
                };
                match message {
                    Some(Ok(Message::Pong(_))) => {
                        *last_pong.lock().expect("pong lock poisoned") = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        done.cancel();
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        })
    };

    // Writer: queue → socket, plus heartbeats.
    let heartbeat = Duration::from_secs(engine.config.ws_heartbeat_seconds);
    let pong_timeout = Duration::from_secs(engine.config.ws_pong_timeout_seconds);
    let mut ping_timer = tokio::time::interval(heartbeat);
    let write_result: Result<(), &'static str> = 'writer: loop {
        while let Some(event) = queue.pop() {
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(_) => continue,
            };
            if sender.send(Message::Text(payload)).await.is_err() {
                break 'writer Err("socket send failed");
            }
        }
        if done.is_canceled() {
            break Ok(());
        }
        let notified = queue.notify.notified();
        tokio::select! {
            _ = done.canceled() => break Ok(()),
            _ = notified => {}
            _ = ping_timer.tick() => {
                let age = last_pong.lock().expect("pong lock poisoned").elapsed();
                if age > pong_timeout {
                    break Err("pong timeout");
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break Err("ping failed");
                }
            }
        }
    };
    done.cancel();

    if overflowed.load(Ordering::Acquire) {
        engine.metrics.ws_slow_drops.inc();
        let notice = DebateEvent::system(EventKind::Error {
            code: "slow_consumer".to_string(),
            message: "outbound queue overflow; connection closed".to_string(),
        });
        if let Ok(payload) = serde_json::to_string(&notice) {
            let _ = sender.send(Message::Text(payload)).await;
        }
    }
    let _ = sender.send(Message::Close(None)).await;
    let _ = fanout.await;
    let _ = reader.await;
    write_result
}
