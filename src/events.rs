//! Real-time event bus (component E).
//!
//! Single-writer-per-publication, many-reader broadcast to UI sessions. Each
//! session holds a bounded outbound queue; a session whose queue is full is
//! dropped rather than blocking the publisher, so one slow UI consumer can
//! never stall the mesh. The bus guarantees FIFO delivery within a session
//! but no ordering between sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Outbound queue depth per session (§4.6).
pub const SESSION_QUEUE_CAPACITY: usize = 256;
pub const HEARTBEAT_INTERVAL_SECS: u64 = 54;
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Message {
        id: String,
        sender_guid: Uuid,
        receiver_guid: Option<Uuid>,
        kind: String,
        scope: String,
        content_len: usize,
        timestamp: i64,
        /// Populated only for system-authored messages (e.g. eviction notices).
        text: Option<String>,
    },
    Peer {
        guid: Uuid,
        name: String,
        ip: String,
        port: u16,
    },
    PeerOffline {
        guid: Uuid,
        name: String,
        reason: String,
    },
    PeerDiscovered {
        guid: Uuid,
        name: String,
        ip: String,
        port: u16,
    },
    PeerDiscoveryFailed {
        ip: String,
        reason: String,
    },
    FileTransfer {
        file_id: String,
        transfer_id: String,
        filename: String,
        size: u64,
        client_ip: String,
        status: FileTransferStatus,
        progress_pct: f64,
        bytes_read: u64,
        instantaneous_speed_bps: f64,
        start_time: i64,
    },
    DeliveryStatus {
        message_id: String,
        status: String,
        total: Option<usize>,
    },
    DeliveryProgress {
        message_id: String,
        succeeded: usize,
        failed: usize,
        total: usize,
    },
    DeliveryFinal {
        message_id: String,
        total: usize,
        succeeded: usize,
        failed: usize,
        summary: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileTransferStatus {
    Starting,
    Transferring,
    Completed,
    Failed,
}

struct SessionEntry {
    sender: mpsc::Sender<Event>,
    last_liveness: Mutex<Instant>,
}

/// Handle returned to a new subscriber: an id for liveness pings plus the
/// receiving half of its bounded queue.
pub struct EventSession {
    pub id: u64,
    pub rx: mpsc::Receiver<Event>,
}

#[derive(Default)]
pub struct EventBus {
    sessions: RwLock<HashMap<u64, SessionEntry>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> EventSession {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
        self.sessions.write().insert(
            id,
            SessionEntry {
                sender: tx,
                last_liveness: Mutex::new(Instant::now()),
            },
        );
        EventSession { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.sessions.write().remove(&id);
    }

    pub fn record_liveness(&self, id: u64) {
        if let Some(entry) = self.sessions.read().get(&id) {
            *entry.last_liveness.lock() = Instant::now();
        }
    }

    /// A session with no liveness signal in `HEARTBEAT_TIMEOUT_SECS` is stale.
    pub fn is_stale(&self, id: u64) -> bool {
        match self.sessions.read().get(&id) {
            Some(entry) => {
                entry.last_liveness.lock().elapsed().as_secs() > HEARTBEAT_TIMEOUT_SECS
            }
            None => true,
        }
    }

    /// Fan the event to every session. A session whose queue is full is
    /// dropped immediately — publication never blocks.
    pub fn publish(&self, event: Event) {
        let mut dead = Vec::new();
        {
            let sessions = self.sessions.read();
            for (id, entry) in sessions.iter() {
                if entry.sender.try_send(event.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }
        if !dead.is_empty() {
            let mut sessions = self.sessions.write();
            for id in dead {
                sessions.remove(&id);
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Heartbeat reaper (§4.6/§5): close any session whose last liveness
    /// signal is older than `HEARTBEAT_TIMEOUT_SECS`. Run every
    /// `HEARTBEAT_INTERVAL_SECS` by the server's cleanup loop.
    pub fn reap_stale_sessions(&self) {
        let stale: Vec<u64> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, entry)| entry.last_liveness.lock().elapsed().as_secs() > HEARTBEAT_TIMEOUT_SECS)
            .map(|(id, _)| *id)
            .collect();
        if stale.is_empty() {
            return;
        }
        let mut sessions = self.sessions.write();
        for id in stale {
            sessions.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_within_session() {
        let bus = EventBus::new();
        let mut session = bus.subscribe();
        bus.publish(Event::DeliveryStatus { message_id: "m1".into(), status: "processing".into(), total: None });
        bus.publish(Event::DeliveryProgress { message_id: "m1".into(), succeeded: 1, failed: 0, total: 1 });
        bus.publish(Event::DeliveryFinal {
            message_id: "m1".into(),
            total: 1,
            succeeded: 1,
            failed: 0,
            summary: "Delivered to 1/1 peers (100% success)".into(),
        });
        let first = session.rx.recv().await.unwrap();
        let second = session.rx.recv().await.unwrap();
        let third = session.rx.recv().await.unwrap();
        assert!(matches!(first, Event::DeliveryStatus { .. }));
        assert!(matches!(second, Event::DeliveryProgress { .. }));
        assert!(matches!(third, Event::DeliveryFinal { .. }));
    }

    #[tokio::test]
    async fn full_queue_drops_session_not_publisher() {
        let bus = EventBus::new();
        let session = bus.subscribe();
        for _ in 0..(SESSION_QUEUE_CAPACITY + 10) {
            bus.publish(Event::PeerDiscoveryFailed { ip: "10.0.0.1".into(), reason: "timeout".into() });
        }
        assert_eq!(bus.session_count(), 0);
        drop(session);
    }
}
