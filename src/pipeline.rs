//! Message Pipeline (component F).
//!
//! Per-message fan-out with per-peer encryption, short-deadline delivery,
//! delivery-report aggregation, duplicate suppression, and failure-driven
//! peer eviction. Consumes D's active set and only calls into C for
//! on-demand key resolution — it never mutates either.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto;
use crate::db::{Db, MessageRow};
use crate::discovery::DiscoveryEngine;
use crate::events::{Event, EventBus};
use crate::identity::Identity;
use crate::peers::{Peer, PeerManager};

pub const DELIVERY_TIMEOUT: Duration = Duration::from_millis(500);
pub const MAX_CONTENT_BYTES: usize = 100 * 1024 * 1024;
pub const FAILURE_COOLDOWN: Duration = Duration::from_secs(5);
pub const REDISCOVERY_COOLDOWN: Duration = Duration::from_secs(5 * 60);
pub const OPPORTUNISTIC_PORTS: [u16; 5] = [7331, 7332, 7333, 7334, 7335];
pub const OPPORTUNISTIC_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Private,
    Broadcast,
}

/// A locally originated submission — also the shape used for the
/// intra-host bootstrap bridging form accepted at `/api/v1/message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalSubmission {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub receiver_guid: Option<Uuid>,
    #[serde(default)]
    pub scope: Option<Scope>,
    pub content: Vec<u8>,
}

/// The canonical plaintext message, post-stamp.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: Uuid,
    pub sender_guid: Uuid,
    pub receiver_guid: Option<Uuid>,
    pub kind: MessageKind,
    pub scope: Scope,
    pub content: Vec<u8>,
    pub timestamp: i64,
}

/// The wire form posted between peers: content replaced by a per-recipient
/// RSA-OAEP envelope, labeled with the message id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: Uuid,
    pub sender_guid: Uuid,
    pub receiver_guid: Uuid,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub scope: Scope,
    pub ciphertext_b64: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerDeliveryStatus {
    pub peer_guid: Uuid,
    pub peer_name: String,
    pub success: bool,
    pub error: Option<String>,
    pub time_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport {
    pub message_id: Uuid,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub per_peer_status: Vec<PeerDeliveryStatus>,
    pub delivery_time_ms: u64,
    pub summary: String,
}

impl DeliveryReport {
    fn empty(message_id: Uuid) -> Self {
        Self {
            message_id,
            total: 0,
            succeeded: 0,
            failed: 0,
            per_peer_status: Vec::new(),
            delivery_time_ms: 0,
            summary: "Delivered to 0/0 peers (no peers available)".to_string(),
        }
    }
}

fn summarize(total: usize, succeeded: usize) -> String {
    let pct = if total == 0 { 0.0 } else { (succeeded as f64 / total as f64) * 100.0 };
    format!("Delivered to {succeeded}/{total} peers ({pct:.0}% success)")
}

pub struct MessagePipeline {
    self_guid: Uuid,
    identity: Arc<Identity>,
    db: Arc<Db>,
    peers: Arc<PeerManager>,
    discovery: Arc<DiscoveryEngine>,
    events: Arc<EventBus>,
    http: reqwest::Client,
    failure_cooldown: Arc<DashMap<Uuid, Instant>>,
    rediscovery_cooldown: Arc<DashMap<Uuid, Instant>>,
}

impl MessagePipeline {
    pub fn new(
        identity: Arc<Identity>,
        db: Arc<Db>,
        peers: Arc<PeerManager>,
        discovery: Arc<DiscoveryEngine>,
        events: Arc<EventBus>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            self_guid: identity.guid(),
            identity,
            db,
            peers,
            discovery,
            events,
            http,
            failure_cooldown: Arc::new(DashMap::new()),
            rediscovery_cooldown: Arc::new(DashMap::new()),
        }
    }

    /// A local submission: stamp with a fresh id/timestamp/sender, then run
    /// the full pipeline.
    pub async fn submit_local(&self, input: LocalSubmission) -> DeliveryReport {
        let scope = input.scope.unwrap_or(if input.receiver_guid.is_none() {
            Scope::Broadcast
        } else {
            Scope::Private
        });
        let msg = Message {
            id: Uuid::new_v4(),
            sender_guid: self.self_guid,
            receiver_guid: input.receiver_guid,
            kind: input.kind,
            scope,
            content: input.content,
            timestamp: crate::peers::unix_now(),
        };
        self.process(msg, None).await
    }

    /// Inbound encrypted wire form, already decrypted by the caller (H).
    pub async fn handle_inbound_wire(&self, wire: WireMessage, plaintext: Vec<u8>, source_ip: IpAddr) -> DeliveryReport {
        let msg = Message {
            id: wire.id,
            sender_guid: wire.sender_guid,
            receiver_guid: Some(wire.receiver_guid),
            kind: wire.kind,
            scope: wire.scope,
            content: plaintext,
            timestamp: wire.timestamp,
        };
        self.maybe_discover_sender(msg.sender_guid, source_ip);
        self.process(msg, Some(source_ip.to_string())).await
    }

    /// Inbound intra-host bridging form — processed exactly as a locally
    /// originated submission (per §4.4), including a fresh stamp.
    pub async fn handle_inbound_local_form(&self, input: LocalSubmission) -> DeliveryReport {
        self.submit_local(input).await
    }

    async fn process(&self, msg: Message, source_ip: Option<String>) -> DeliveryReport {
        // §3 size limit: oversized content is rejected before it ever reaches
        // the store or fan-out.
        if msg.content.len() > MAX_CONTENT_BYTES {
            tracing::warn!(
                "pipeline: rejecting message {} with {} bytes of content (limit {})",
                msg.id,
                msg.content.len(),
                MAX_CONTENT_BYTES
            );
            let mut report = DeliveryReport::empty(msg.id);
            report.summary = "content exceeds 100 MiB size limit".to_string();
            return report;
        }

        // At-most-once: drop silently if already stored.
        match self.db.message_exists(&msg.id.to_string()) {
            Ok(true) => return DeliveryReport::empty(msg.id),
            Ok(false) => {}
            Err(e) => tracing::warn!("pipeline: dedup check failed: {e}"),
        }

        // Store-first: fences all fan-out. Failure is logged, not fatal.
        let row = MessageRow {
            id: msg.id.to_string(),
            sender_guid: msg.sender_guid.to_string(),
            receiver_guid: msg.receiver_guid.map(|g| g.to_string()).unwrap_or_default(),
            kind: kind_str(msg.kind).to_string(),
            scope: scope_str(msg.scope).to_string(),
            content: msg.content.clone(),
            timestamp: msg.timestamp,
            source_ip,
        };
        match self.db.insert_message(&row) {
            Ok(true) => {}
            Ok(false) => return DeliveryReport::empty(msg.id),
            Err(e) => tracing::warn!("pipeline: store-first failed, continuing: {e}"),
        }

        self.events.publish(Event::Message {
            id: msg.id.to_string(),
            sender_guid: msg.sender_guid,
            receiver_guid: msg.receiver_guid,
            kind: kind_str(msg.kind).to_string(),
            scope: scope_str(msg.scope).to_string(),
            content_len: msg.content.len(),
            timestamp: msg.timestamp,
            text: as_text(msg.kind, &msg.content),
        });

        self.events.publish(Event::DeliveryStatus {
            message_id: msg.id.to_string(),
            status: "processing".to_string(),
            total: None,
        });

        let targets = self.resolve_targets(&msg);

        match msg.scope {
            Scope::Broadcast => {
                self.events.publish(Event::DeliveryStatus {
                    message_id: msg.id.to_string(),
                    status: "broadcasting".to_string(),
                    total: Some(targets.len()),
                });
            }
            Scope::Private => {
                self.events.publish(Event::DeliveryStatus {
                    message_id: msg.id.to_string(),
                    status: "sending".to_string(),
                    total: Some(targets.len()),
                });
            }
        }

        let report = self.deliver(&msg, targets).await;

        self.events.publish(Event::DeliveryFinal {
            message_id: report.message_id.to_string(),
            total: report.total,
            succeeded: report.succeeded,
            failed: report.failed,
            summary: report.summary.clone(),
        });

        report
    }

    /// §4.4 fan-out policy.
    fn resolve_targets(&self, msg: &Message) -> Vec<Peer> {
        match msg.scope {
            Scope::Private => {
                let Some(target_guid) = msg.receiver_guid else {
                    return Vec::new();
                };
                match self.peers.get_peer(target_guid) {
                    Ok(Some(p)) => vec![p],
                    _ => Vec::new(),
                }
            }
            Scope::Broadcast => self
                .peers
                .get_active_peers()
                .into_iter()
                .filter(|p| p.guid != msg.sender_guid)
                .collect(),
        }
    }

    async fn deliver(&self, msg: &Message, targets: Vec<Peer>) -> DeliveryReport {
        let total = targets.len();
        if total == 0 {
            let mut report = DeliveryReport::empty(msg.id);
            if msg.scope == Scope::Private && msg.receiver_guid.is_some() {
                report.total = 1;
                report.failed = 1;
                report.per_peer_status.push(PeerDeliveryStatus {
                    peer_guid: msg.receiver_guid.unwrap(),
                    peer_name: String::new(),
                    success: false,
                    error: Some("peer not found in active peers list".to_string()),
                    time_ms: 0,
                });
                report.summary = summarize(1, 0);
            }
            return report;
        }

        let start = Instant::now();
        let mut pending = FuturesUnordered::new();
        for target in targets {
            pending.push(self.deliver_one(msg, target));
        }

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut statuses = Vec::with_capacity(total);

        while let Some(status) = pending.next().await {
            if status.success {
                succeeded += 1;
            } else {
                failed += 1;
                self.on_delivery_failure(status.peer_guid, &status.peer_name, status.error.clone().unwrap_or_default());
            }
            // §4.4: delivery_progress is broadcast-only — private sends emit
            // only (i), an optional "sending", and delivery_final.
            if msg.scope == Scope::Broadcast {
                self.events.publish(Event::DeliveryProgress {
                    message_id: msg.id.to_string(),
                    succeeded,
                    failed,
                    total,
                });
            }
            statuses.push(status);
        }

        DeliveryReport {
            message_id: msg.id,
            total,
            succeeded,
            failed,
            per_peer_status: statuses,
            delivery_time_ms: start.elapsed().as_millis() as u64,
            summary: summarize(total, succeeded),
        }
    }

    async fn deliver_one(&self, msg: &Message, target: Peer) -> PeerDeliveryStatus {
        let started = Instant::now();
        let result = tokio::time::timeout(DELIVERY_TIMEOUT, self.deliver_one_inner(msg, &target)).await;
        let time_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(Ok(())) => PeerDeliveryStatus {
                peer_guid: target.guid,
                peer_name: target.name,
                success: true,
                error: None,
                time_ms,
            },
            Ok(Err(reason)) => PeerDeliveryStatus {
                peer_guid: target.guid,
                peer_name: target.name,
                success: false,
                error: Some(reason),
                time_ms,
            },
            Err(_) => PeerDeliveryStatus {
                peer_guid: target.guid,
                peer_name: target.name,
                success: false,
                error: Some("timed out".to_string()),
                time_ms,
            },
        }
    }

    async fn deliver_one_inner(&self, msg: &Message, target: &Peer) -> Result<(), String> {
        let public_key = self.resolve_public_key(target).await.ok_or_else(|| "no public key available".to_string())?;

        let ciphertext_b64 =
            crypto::encrypt(&msg.content, &msg.id.to_string(), &public_key).map_err(|e| e.to_string())?;

        let wire = WireMessage {
            id: msg.id,
            sender_guid: msg.sender_guid,
            receiver_guid: target.guid,
            kind: msg.kind,
            scope: msg.scope,
            ciphertext_b64,
            timestamp: msg.timestamp,
        };

        let url = format!("https://{}:{}/api/v1/message", target.ip, target.port);
        let resp = self
            .http
            .post(&url)
            .json(&wire)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if resp.status().as_u16() == 202 {
            Ok(())
        } else {
            Err(format!("peer returned HTTP {}", resp.status().as_u16()))
        }
    }

    async fn resolve_public_key(&self, target: &Peer) -> Option<RsaPublicKey> {
        if let Some(pk) = &target.public_key {
            return Some(pk.clone());
        }
        self.discovery.fetch_key_for_peer(target.guid, target.ip, target.port).await
    }

    /// §4.5 failure-driven eviction, deduplicated with a 5s per-GUID
    /// suppressor so a burst of concurrent failures produces one eviction.
    fn on_delivery_failure(&self, guid: Uuid, name: &str, reason: String) {
        let now = Instant::now();
        let should_evict = match self.failure_cooldown.get(&guid) {
            Some(last) if now.duration_since(*last) < FAILURE_COOLDOWN => false,
            _ => true,
        };
        if !should_evict {
            return;
        }
        self.failure_cooldown.insert(guid, now);

        self.peers.remove_inactive(guid);
        self.events.publish(Event::PeerOffline {
            guid,
            name: name.to_string(),
            reason: reason.clone(),
        });
        self.events.publish(Event::Message {
            id: Uuid::new_v4().to_string(),
            sender_guid: self.self_guid,
            receiver_guid: None,
            kind: "text".to_string(),
            scope: "system".to_string(),
            content_len: 0,
            timestamp: crate::peers::unix_now(),
            text: Some(format!("Peer {name} went offline: {reason}")),
        });
    }

    /// §4.4 opportunistic discovery: if the sender of an inbound message is
    /// unknown to D and not in the 5-minute cooldown, probe the port range.
    fn maybe_discover_sender(&self, sender_guid: Uuid, source_ip: IpAddr) {
        if matches!(self.peers.get_peer(sender_guid), Ok(Some(_))) {
            return;
        }
        let now = Instant::now();
        if let Some(last) = self.rediscovery_cooldown.get(&sender_guid) {
            if now.duration_since(*last) < REDISCOVERY_COOLDOWN {
                return;
            }
        }

        let discovery = Arc::clone(&self.discovery);
        let peers = Arc::clone(&self.peers);
        let cooldown = Arc::clone(&self.rediscovery_cooldown);
        tokio::spawn(async move {
            match discovery.probe_port_range(source_ip, &OPPORTUNISTIC_PORTS).await {
                Some(who) if who.guid == sender_guid => {
                    if let Ok(pk) = crypto::public_key_from_pem(&who.public_key) {
                        let obs = crate::peers::PeerObservation {
                            guid: sender_guid,
                            name: who.name,
                            ip: source_ip,
                            port: OPPORTUNISTIC_PORTS[0],
                            public_key: Some(pk),
                        };
                        if let Err(e) = peers.ingest_observation(obs) {
                            tracing::warn!("opportunistic discovery: persist failed: {e}");
                        }
                    }
                }
                _ => {
                    cooldown.insert(sender_guid, Instant::now());
                }
            }
        });
    }
}

fn kind_str(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::Image => "image",
        MessageKind::File => "file",
    }
}

fn scope_str(scope: Scope) -> &'static str {
    match scope {
        Scope::Private => "private",
        Scope::Broadcast => "broadcast",
    }
}

fn as_text(kind: MessageKind, content: &[u8]) -> Option<String> {
    if kind == MessageKind::Text {
        std::str::from_utf8(content).ok().map(|s| s.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::identity::Identity;

    fn pipeline_with_no_peers() -> MessagePipeline {
        let db = Arc::new(Db::open_memory().unwrap());
        let identity = Arc::new(Identity::load_or_create(&db, "solo").unwrap());
        let peers = PeerManager::load(Arc::clone(&db), identity.guid()).unwrap();
        let (discovery, _rx) = DiscoveryEngine::new(identity.guid(), "solo".into(), 7331);
        let events = Arc::new(EventBus::new());
        MessagePipeline::new(identity, db, peers, discovery, events)
    }

    #[tokio::test]
    async fn solo_broadcast_has_zero_total() {
        let pipeline = pipeline_with_no_peers();
        let report = pipeline
            .submit_local(LocalSubmission {
                kind: MessageKind::Text,
                receiver_guid: None,
                scope: Some(Scope::Broadcast),
                content: b"hello".to_vec(),
            })
            .await;
        assert_eq!(report.total, 0);
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn private_to_unknown_peer_fails_without_queuing() {
        let pipeline = pipeline_with_no_peers();
        let report = pipeline
            .submit_local(LocalSubmission {
                kind: MessageKind::Text,
                receiver_guid: Some(Uuid::new_v4()),
                scope: Some(Scope::Private),
                content: b"ping".to_vec(),
            })
            .await;
        assert_eq!(report.total, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(
            report.per_peer_status[0].error.as_deref(),
            Some("peer not found in active peers list")
        );
    }

    #[tokio::test]
    async fn oversized_content_is_rejected_before_store() {
        let pipeline = pipeline_with_no_peers();
        let report = pipeline
            .submit_local(LocalSubmission {
                kind: MessageKind::Text,
                receiver_guid: None,
                scope: Some(Scope::Broadcast),
                content: vec![0u8; MAX_CONTENT_BYTES + 1],
            })
            .await;
        assert_eq!(report.total, 0);
        assert!(!pipeline.db.message_exists(&report.message_id.to_string()).unwrap());
    }

    #[tokio::test]
    async fn duplicate_message_id_is_dropped() {
        let pipeline = pipeline_with_no_peers();
        let msg = Message {
            id: Uuid::new_v4(),
            sender_guid: pipeline.self_guid,
            receiver_guid: None,
            kind: MessageKind::Text,
            scope: Scope::Broadcast,
            content: b"hi".to_vec(),
            timestamp: crate::peers::unix_now(),
        };
        let first = pipeline.process(msg.clone(), None).await;
        let second = pipeline.process(msg, None).await;
        assert_eq!(first.message_id, second.message_id);
        assert_eq!(second.total, 0);
        assert!(pipeline.db.message_exists(&first.message_id.to_string()).unwrap());
    }
}
