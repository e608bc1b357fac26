//! Discovery Engine (component C).
//!
//! Publishes this node under the link-local service type `_cyberchat._tcp`,
//! scans for other publications, and emits a stream of peer observations for
//! the peer manager (component D) to fold into the authoritative active set.
//! Also answers on-demand public-key fetches for the message pipeline.
//!
//! Per §9, this module is a pure event source plus an on-demand lookup: it
//! never mutates D's map directly, only pushes observations down a channel.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use rsa::RsaPublicKey;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::crypto;
use crate::peers::PeerObservation;

pub const SERVICE_TYPE: &str = "_cyberchat._tcp.local.";
pub const BASE_INTERVAL: Duration = Duration::from_secs(2);
pub const MAX_INTERVAL: Duration = Duration::from_secs(15);
pub const SCAN_DEADLINE: Duration = Duration::from_secs_f64(1.5);
pub const INTERFACE_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub const KEY_FETCH_TIMEOUT: Duration = Duration::from_secs_f64(1.5);
const OBSERVATION_CHANNEL_CAPACITY: usize = 100;

/// Bookkeeping kept by the discovery engine about peers it has seen on the
/// link — distinct from D's authoritative active set. Used for
/// (name, port) reconciliation and the engine's own TTL eviction.
#[derive(Debug, Clone)]
struct KnownPeer {
    name: String,
    port: u16,
    ip: IpAddr,
    public_key: Option<RsaPublicKey>,
    last_seen: std::time::Instant,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WhoAmIResponse {
    pub guid: Uuid,
    pub public_key: String,
    pub name: String,
}

pub struct DiscoveryEngine {
    self_guid: Uuid,
    self_name: Mutex<String>,
    port: u16,
    daemon: Mutex<Option<ServiceDaemon>>,
    known: Mutex<HashMap<Uuid, KnownPeer>>,
    observation_tx: mpsc::Sender<PeerObservation>,
    http: reqwest::Client,
    current_ip: Mutex<Option<Ipv4Addr>>,
}

impl DiscoveryEngine {
    pub fn new(self_guid: Uuid, self_name: String, port: u16) -> (Arc<Self>, mpsc::Receiver<PeerObservation>) {
        let (tx, rx) = mpsc::channel(OBSERVATION_CHANNEL_CAPACITY);
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(KEY_FETCH_TIMEOUT)
            .build()
            .expect("reqwest client");
        let engine = Arc::new(Self {
            self_guid,
            self_name: Mutex::new(self_name),
            port,
            daemon: Mutex::new(None),
            known: Mutex::new(HashMap::new()),
            observation_tx: tx,
            http,
            current_ip: Mutex::new(None),
        });
        (engine, rx)
    }

    pub fn update_display_name(&self, name: String) {
        *self.self_name.lock() = name;
        if let Some(ip) = *self.current_ip.lock() {
            if let Err(e) = self.rebuild_advertisement(ip) {
                tracing::warn!("discovery: rebuild after name change failed: {e}");
            }
        }
    }

    /// Advertisement failure is fatal to start, per §4.1. `shutdown` is the
    /// process-wide cancellation signal (§5/§9): both spawned loops select
    /// on it and exit on their next iteration once it fires.
    pub async fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let daemon = ServiceDaemon::new().context("failed to start mDNS daemon")?;
        *self.daemon.lock() = Some(daemon);

        let ip = choose_interface_ipv4().context("no routable non-loopback IPv4 interface")?;
        self.rebuild_advertisement(ip)
            .context("initial advertisement failed")?;
        *self.current_ip.lock() = Some(ip);

        let scan_engine = Arc::clone(&self);
        let scan_shutdown = shutdown.clone();
        tokio::spawn(async move { scan_engine.scan_loop(scan_shutdown).await });

        let iface_engine = Arc::clone(&self);
        let iface_shutdown = shutdown;
        tokio::spawn(async move { iface_engine.interface_monitor_loop(iface_shutdown).await });

        Ok(())
    }

    fn rebuild_advertisement(&self, ip: Ipv4Addr) -> Result<()> {
        let guard = self.daemon.lock();
        let daemon = guard.as_ref().context("mDNS daemon not started")?;
        let name = self.self_name.lock().clone();
        let instance = self.self_guid.to_string();
        let host = format!("{instance}.local.");
        let properties = [
            ("id", instance.as_str()),
            ("port", &self.port.to_string()),
            ("name", name.as_str()),
            ("ip", &ip.to_string()),
        ];
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &instance,
            &host,
            ip.to_string().as_str(),
            self.port,
            &properties[..],
        )
        .context("failed to build service record")?;
        // Re-registering under the same instance name replaces the prior record.
        daemon
            .register(info)
            .context("failed to register mDNS advertisement")?;
        Ok(())
    }

    /// Re-run interface selection every 30s; rebuild the advertiser if the
    /// chosen address changed.
    async fn interface_monitor_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(INTERFACE_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            match choose_interface_ipv4() {
                Some(ip) => {
                    let changed = *self.current_ip.lock() != Some(ip);
                    if changed {
                        match self.rebuild_advertisement(ip) {
                            Ok(()) => {
                                *self.current_ip.lock() = Some(ip);
                                tracing::info!("discovery: rebound advertisement to {ip}");
                            }
                            Err(e) => {
                                // Logged and retried on the next interface check (§7).
                                tracing::warn!("discovery: rebind failed, will retry: {e}");
                            }
                        }
                    }
                }
                None => tracing::warn!("discovery: no routable interface found"),
            }
        }
    }

    async fn scan_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut current_interval = BASE_INTERVAL;
        let mut quiet_scans = 0u32;
        let mut last_count = 0usize;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(current_interval) => {}
                _ = shutdown.changed() => break,
            }
            let before = self.known.lock().len();
            let (new_observations, err) = self.scan_once().await;

            for obs in &new_observations {
                let engine = Arc::clone(&self);
                let obs = obs.clone();
                tokio::spawn(async move { engine.key_fetch_task(obs).await });
                let _ = self.observation_tx.try_send(obs.clone());
            }

            self.evict_stale();

            if let Some(e) = err {
                tracing::warn!("discovery: scan cycle failed: {e}");
            }

            let after = self.known.lock().len();
            let changed = !new_observations.is_empty() || after != last_count || after != before;
            last_count = after;

            if changed {
                current_interval = BASE_INTERVAL;
                quiet_scans = 0;
            } else {
                quiet_scans += 1;
                if quiet_scans >= 3 {
                    let scaled = current_interval.mul_f64(1.25);
                    current_interval = scaled.min(MAX_INTERVAL);
                }
            }
        }
    }

    /// One scan cycle, bounded by `SCAN_DEADLINE`. Partial results are kept.
    /// Returns newly observed peers (for key-fetch dispatch) and an optional error.
    async fn scan_once(&self) -> (Vec<PeerObservation>, Option<anyhow::Error>) {
        let daemon = match self.daemon.lock().clone() {
            Some(d) => d,
            None => return (Vec::new(), Some(anyhow::anyhow!("daemon not started"))),
        };
        let receiver = match daemon.browse(SERVICE_TYPE) {
            Ok(r) => r,
            Err(e) => return (Vec::new(), Some(e.into())),
        };

        let mut observed = Vec::new();
        let deadline = tokio::time::Instant::now() + SCAN_DEADLINE;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, receiver.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                    if let Some(obs) = self.process_entry(&info) {
                        observed.push(obs);
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) => break,
                Err(_) => break,
            }
        }
        let _ = daemon.stop_browse(SERVICE_TYPE);
        (observed, None)
    }

    /// Parse one resolved record into an observation. Returns `None` for
    /// records that don't belong to this service, lack an `id`, or name
    /// this node's own GUID.
    fn process_entry(&self, info: &ServiceInfo) -> Option<PeerObservation> {
        if !info.get_type().contains("_cyberchat._tcp") {
            return None;
        }
        let props = info.get_properties();
        let id = props.get("id")?.val_str();
        let guid = Uuid::parse_str(id).ok()?;
        if guid == self.self_guid {
            return None;
        }
        let name = props
            .get("name")
            .map(|p| p.val_str().to_string())
            .unwrap_or_else(|| guid.to_string());
        let port = props
            .get("port")
            .and_then(|p| p.val_str().parse::<u16>().ok())
            .unwrap_or_else(|| info.get_port());
        let ip = props
            .get("ip")
            .and_then(|p| p.val_str().parse::<IpAddr>().ok())
            .or_else(|| info.get_addresses().iter().next().copied())?;

        let mut known = self.known.lock();
        // Reconciliation: if an existing peer shares (name, port) but has a
        // different GUID, drop the older entry, carrying its cached public
        // key forward to the new one.
        let mut carried_key = None;
        let stale: Vec<Uuid> = known
            .iter()
            .filter(|(g, p)| **g != guid && p.name == name && p.port == port)
            .map(|(g, _)| *g)
            .collect();
        for g in stale {
            if let Some(old) = known.remove(&g) {
                carried_key = carried_key.or(old.public_key);
            }
        }

        let existing_key = known.get(&guid).and_then(|p| p.public_key.clone());
        let public_key = existing_key.or(carried_key);

        known.insert(
            guid,
            KnownPeer {
                name: name.clone(),
                port,
                ip,
                public_key: public_key.clone(),
                last_seen: std::time::Instant::now(),
            },
        );

        Some(PeerObservation { guid, name, ip, port, public_key })
    }

    /// Periodic eviction of this engine's own bookkeeping map — distinct
    /// from D's active set. Does not touch the persisted record.
    fn evict_stale(&self) {
        let mut known = self.known.lock();
        known.retain(|_, p| p.last_seen.elapsed() <= crate::peers::ACTIVE_TIMEOUT);
    }

    async fn key_fetch_task(self: Arc<Self>, obs: PeerObservation) {
        match self.fetch_whoami(obs.ip, obs.port).await {
            Ok(who) if who.guid == obs.guid => {
                if let Ok(pk) = crypto::public_key_from_pem(&who.public_key) {
                    let mut known = self.known.lock();
                    if let Some(entry) = known.get_mut(&obs.guid) {
                        entry.public_key = Some(pk);
                    }
                }
            }
            Ok(_) => {
                // GUID mismatch — drop the attempt without modifying state.
            }
            Err(e) => {
                tracing::debug!("discovery: key fetch for {} failed: {e}", obs.guid);
            }
        }
    }

    async fn fetch_whoami(&self, ip: IpAddr, port: u16) -> Result<WhoAmIResponse> {
        let url = format!("https://{ip}:{port}/api/v1/whoami");
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            bail!("whoami returned {}", resp.status());
        }
        Ok(resp.json::<WhoAmIResponse>().await?)
    }

    /// On-demand public key fetch used by the message pipeline when D's
    /// cached copy is absent or stale.
    pub async fn fetch_key_for_peer(&self, guid: Uuid, ip: IpAddr, port: u16) -> Option<RsaPublicKey> {
        if let Some(known) = self.known.lock().get(&guid) {
            if known.public_key.is_some() {
                return known.public_key.clone();
            }
        }
        let who = self.fetch_whoami(ip, port).await.ok()?;
        if who.guid != guid {
            return None;
        }
        let pk = crypto::public_key_from_pem(&who.public_key).ok()?;
        if let Some(entry) = self.known.lock().get_mut(&guid) {
            entry.public_key = Some(pk.clone());
        }
        Some(pk)
    }

    /// Probe the source IP across the opportunistic-discovery port range,
    /// bounded to 1s per attempt, returning the first matching whoami.
    pub async fn probe_port_range(&self, ip: IpAddr, ports: &[u16]) -> Option<WhoAmIResponse> {
        for &port in ports {
            let url = format!("https://{ip}:{port}/api/v1/whoami");
            let resp = tokio::time::timeout(Duration::from_secs(1), self.http.get(&url).send()).await;
            if let Ok(Ok(r)) = resp {
                if r.status().is_success() {
                    if let Ok(who) = r.json::<WhoAmIResponse>().await {
                        return Some(who);
                    }
                }
            }
        }
        None
    }
}

/// Choose the first non-loopback, up interface with a routable IPv4 address.
fn choose_interface_ipv4() -> Option<Ipv4Addr> {
    let ifaces = if_addrs::get_if_addrs().ok()?;
    ifaces
        .into_iter()
        .filter(|i| !i.is_loopback())
        .find_map(|i| match i.ip() {
            IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconciliation_carries_public_key_forward() {
        let (engine, _rx) = DiscoveryEngine::new(Uuid::new_v4(), "me".into(), 7331);
        let old_guid = Uuid::new_v4();
        let new_guid = Uuid::new_v4();
        let (_sk, pk) = crypto::generate_keypair().unwrap();

        engine.known.lock().insert(
            old_guid,
            KnownPeer {
                name: "alice".into(),
                port: 7331,
                ip: "10.0.0.5".parse().unwrap(),
                public_key: Some(pk.clone()),
                last_seen: std::time::Instant::now(),
            },
        );

        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &new_guid.to_string(),
            "alice.local.",
            "10.0.0.6",
            7331,
            &[
                ("id", new_guid.to_string().as_str()),
                ("port", "7331"),
                ("name", "alice"),
                ("ip", "10.0.0.6"),
            ][..],
        )
        .unwrap();

        let obs = engine.process_entry(&info).expect("should produce an observation");
        assert_eq!(obs.guid, new_guid);
        assert!(obs.public_key.is_some());
        assert!(!engine.known.lock().contains_key(&old_guid));
    }
}
