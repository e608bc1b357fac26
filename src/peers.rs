//! Peer Manager (component D) — the authoritative active-peer set.
//!
//! Subscribes to the discovery engine's observation stream, merges each
//! observation into an in-memory map (refreshing `last_seen`), mirrors it
//! into the persistence adapter, and invokes a registered change callback
//! exactly once per update, in observation order. Queries here are what the
//! message pipeline and the UI actually consult — discovery itself never
//! hands out the active set directly (§9: C → D → F is a strict DAG).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rsa::RsaPublicKey;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::crypto;
use crate::db::{Db, PeerRow};
use crate::error::CoreResult;

pub const ACTIVE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct Peer {
    pub guid: Uuid,
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
    pub public_key: Option<RsaPublicKey>,
    pub last_seen: Instant,
}

/// An observation pushed by the discovery engine — a sighting of a peer on
/// the link, not yet merged into the authoritative map.
#[derive(Debug, Clone)]
pub struct PeerObservation {
    pub guid: Uuid,
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
    pub public_key: Option<RsaPublicKey>,
}

type ChangeCallback = Box<dyn Fn(Peer) + Send + Sync>;

pub struct PeerManager {
    self_guid: Uuid,
    active: RwLock<HashMap<Uuid, Peer>>,
    db: Arc<Db>,
    change_callback: RwLock<Option<ChangeCallback>>,
}

impl PeerManager {
    /// Populate the map from the store: every peer whose `last_seen` is
    /// within `activeTimeout` of now.
    pub fn load(db: Arc<Db>, self_guid: Uuid) -> CoreResult<Arc<Self>> {
        let now_unix = unix_now();
        let cutoff = now_unix - ACTIVE_TIMEOUT.as_secs() as i64;
        let rows = db.list_peers_since(cutoff)?;
        let mut active = HashMap::new();
        for row in rows {
            if let Some(peer) = row_to_peer(&row, now_unix) {
                if peer.guid != self_guid {
                    active.insert(peer.guid, peer);
                }
            }
        }
        Ok(Arc::new(Self {
            self_guid,
            active: RwLock::new(active),
            db,
            change_callback: RwLock::new(None),
        }))
    }

    /// Register the single-method change callback. Must return quickly —
    /// the observation loop blocks on it to preserve per-observation order.
    pub fn set_change_callback(&self, cb: ChangeCallback) {
        *self.change_callback.write() = Some(cb);
    }

    /// Drive the merge loop from discovery's observation channel. Each
    /// observation is processed to completion (store write + callback)
    /// before the next is read, per the single-consumer discipline of §4.2.
    /// Observes `shutdown` on every iteration and exits once it fires (§5/§9).
    pub fn run_observation_loop(
        self: Arc<Self>,
        mut observations: mpsc::Receiver<PeerObservation>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    obs = observations.recv() => {
                        let Some(obs) = obs else { break };
                        if let Err(e) = self.merge_observation(obs) {
                            tracing::warn!("peer manager: failed to persist observation: {e}");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    /// Merge a single observation outside the regular channel-driven loop —
    /// used by the message pipeline's opportunistic discovery (§4.4), which
    /// has already confirmed the sighting via a whoami probe and needs the
    /// peer live in the active set immediately rather than waiting for the
    /// next scan cycle to re-observe it.
    pub fn ingest_observation(&self, obs: PeerObservation) -> CoreResult<()> {
        self.merge_observation(obs)
    }

    fn merge_observation(&self, obs: PeerObservation) -> CoreResult<()> {
        if obs.guid == self.self_guid {
            return Ok(());
        }
        let now = Instant::now();
        let peer = Peer {
            guid: obs.guid,
            name: obs.name.clone(),
            ip: obs.ip,
            port: obs.port,
            public_key: obs.public_key.clone(),
            last_seen: now,
        };
        self.active.write().insert(obs.guid, peer.clone());

        self.db.upsert_peer(&PeerRow {
            guid: obs.guid.to_string(),
            name: obs.name,
            public_key: obs.public_key.and_then(|pk| crypto::public_key_to_pem(&pk).ok()),
            ip: obs.ip.to_string(),
            port: obs.port,
            last_seen: unix_now(),
        })?;

        if let Some(cb) = self.change_callback.read().as_ref() {
            cb(peer);
        }
        Ok(())
    }

    pub fn get_active_peers(&self) -> Vec<Peer> {
        self.active
            .read()
            .values()
            .filter(|p| p.last_seen.elapsed() <= ACTIVE_TIMEOUT)
            .cloned()
            .collect()
    }

    /// Looks in memory first; if absent, probes the store and returns the
    /// record iff its `last_seen` is still within the TTL. A stale store row
    /// is deleted and treated as absent.
    pub fn get_peer(&self, guid: Uuid) -> CoreResult<Option<Peer>> {
        if let Some(p) = self.active.read().get(&guid).cloned() {
            if p.last_seen.elapsed() <= ACTIVE_TIMEOUT {
                return Ok(Some(p));
            }
        }
        match self.db.get_peer(&guid.to_string())? {
            Some(row) => {
                let now_unix = unix_now();
                if now_unix - row.last_seen <= ACTIVE_TIMEOUT.as_secs() as i64 {
                    Ok(row_to_peer(&row, now_unix))
                } else {
                    self.db.delete_peer(&guid.to_string())?;
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    pub fn get_peers_last_seen_after(&self, cutoff: Instant) -> Vec<Peer> {
        self.active
            .read()
            .values()
            .filter(|p| p.last_seen >= cutoff)
            .cloned()
            .collect()
    }

    /// In-memory eviction only — the persisted row is left intact so
    /// re-discovery can restore the entry.
    pub fn remove_inactive(&self, guid: Uuid) {
        self.active.write().remove(&guid);
    }

    /// Periodic janitor: drop in-memory entries whose TTL has lapsed.
    /// Called every `activeTimeout / 2` by the server's cleanup loop.
    pub fn evict_expired(&self) {
        let mut active = self.active.write();
        active.retain(|_, p| p.last_seen.elapsed() <= ACTIVE_TIMEOUT);
    }
}

fn row_to_peer(row: &PeerRow, now_unix: i64) -> Option<Peer> {
    let guid = Uuid::parse_str(&row.guid).ok()?;
    let ip: IpAddr = row.ip.parse().ok()?;
    let age = Duration::from_secs((now_unix - row.last_seen).max(0) as u64);
    let last_seen = Instant::now().checked_sub(age)?;
    let public_key = row.public_key.as_deref().and_then(|pem| crypto::public_key_from_pem(pem).ok());
    Some(Peer {
        guid,
        name: row.name.clone(),
        ip,
        port: row.port,
        public_key,
        last_seen,
    })
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn observation_merges_and_calls_back() {
        let db = Arc::new(Db::open_memory().unwrap());
        let pm = PeerManager::load(db, Uuid::new_v4()).unwrap();
        let (tx, rx) = mpsc::channel(10);
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let seen = Arc::new(RwLock::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        pm.set_change_callback(Box::new(move |p| seen2.write().push(p.guid)));
        pm.clone().run_observation_loop(rx, shutdown_rx);

        let guid = Uuid::new_v4();
        tx.send(PeerObservation {
            guid,
            name: "bob".into(),
            ip: "127.0.0.1".parse().unwrap(),
            port: 7331,
            public_key: None,
        })
        .await
        .unwrap();
        // Give the loop a tick to process.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pm.get_active_peers().len(), 1);
        assert_eq!(seen.read().as_slice(), &[guid]);
    }

    #[test]
    fn self_guid_never_stored() {
        let db = Arc::new(Db::open_memory().unwrap());
        let self_guid = Uuid::new_v4();
        let pm = PeerManager::load(db, self_guid).unwrap();
        pm.merge_observation(PeerObservation {
            guid: self_guid,
            name: "me".into(),
            ip: "127.0.0.1".parse().unwrap(),
            port: 1,
            public_key: None,
        })
        .unwrap();
        assert!(pm.get_active_peers().is_empty());
    }
}
