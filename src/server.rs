//! Wiring: `SharedState`, `Server::new`/`run`, and shutdown.
//!
//! Mirrors `freeq_server::server::Server` — a config-holding struct whose
//! `run` builds the shared state once, starts every long-running loop, binds
//! the listener, and blocks until the process-wide cancellation signal
//! fires.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::RngCore;
use tokio::signal;
use tokio::sync::watch;

use crate::config::NodeConfig;
use crate::db::Db;
use crate::discovery::DiscoveryEngine;
use crate::events::{Event, EventBus};
use crate::files::FileService;
use crate::identity::Identity;
use crate::peers::{PeerManager, ACTIVE_TIMEOUT};
use crate::pipeline::MessagePipeline;
use crate::tls;

/// Daily sweep of messages older than this (§3, §7).
pub const MESSAGE_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const MESSAGE_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const SESSION_REAP_INTERVAL: Duration = Duration::from_secs(15);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything a request handler needs, injected rather than reached for
/// globally (§9 "Global state") so a test harness can run two complete
/// cores in one process.
pub struct SharedState {
    pub identity: Arc<Identity>,
    pub db: Arc<Db>,
    pub peers: Arc<PeerManager>,
    pub discovery: Arc<DiscoveryEngine>,
    pub events: Arc<EventBus>,
    pub pipeline: Arc<MessagePipeline>,
    pub files: Arc<FileService>,
    pub api_key: String,
    pub config: NodeConfig,
    /// The process-wide cancellation signal (§5/§9). Every long-running
    /// loop — discovery's scan/interface loops, the peer manager's
    /// observation loop, and the cleanup loops spawned in `run` — selects
    /// on a receiver of this and exits on its next iteration once it fires.
    pub shutdown: watch::Sender<bool>,
}

pub struct Server {
    config: NodeConfig,
}

impl Server {
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    /// Build every component and wire the C → D → F observation pipeline,
    /// without starting any background loop or listener. Split out of `run`
    /// so tests can stand up two complete cores in one process (§9).
    pub fn build_state(&self) -> Result<Arc<SharedState>> {
        std::fs::create_dir_all(&self.config.data_dir)
            .context("creating data directory")?;

        let db = Arc::new(Db::open(self.config.db_path()).context("opening store")?);
        let identity = Arc::new(
            Identity::load_or_create(&db, &self.config.resolved_name())
                .context("loading identity")?,
        );
        let events = Arc::new(EventBus::new());
        let peers = PeerManager::load(Arc::clone(&db), identity.guid()).context("loading peer manager")?;

        let (discovery, observation_rx) =
            DiscoveryEngine::new(identity.guid(), identity.display_name(), self.config.port);

        let (shutdown, shutdown_rx) = watch::channel(false);

        // D subscribes to C's observation stream and fans merged peers to E.
        let cb_events = Arc::clone(&events);
        peers.set_change_callback(Box::new(move |peer| {
            cb_events.publish(Event::Peer {
                guid: peer.guid,
                name: peer.name,
                ip: peer.ip.to_string(),
                port: peer.port,
            });
        }));
        Arc::clone(&peers).run_observation_loop(observation_rx, shutdown_rx);

        let pipeline = Arc::new(MessagePipeline::new(
            Arc::clone(&identity),
            Arc::clone(&db),
            Arc::clone(&peers),
            Arc::clone(&discovery),
            Arc::clone(&events),
        ));
        let files = Arc::new(FileService::new(Arc::clone(&db), Arc::clone(&events)));

        let api_key = generate_api_key();

        Ok(Arc::new(SharedState {
            identity,
            db,
            peers,
            discovery,
            events,
            pipeline,
            files,
            api_key,
            config: self.config.clone(),
            shutdown,
        }))
    }

    /// Run the node, blocking until a shutdown signal (SIGINT/SIGTERM or
    /// Ctrl-C) is observed.
    pub async fn run(self) -> Result<()> {
        self.config.apply_reset()?;
        let state = self.build_state()?;

        let tls_config = tls::load_or_create(&self.config.data_dir).context("initializing TLS")?;

        // Advertisement failure is fatal to start (§4.1). The scan and
        // interface-monitor loops it spawns observe `state.shutdown` from
        // here on, same as the cleanup loops below.
        Arc::clone(&state.discovery)
            .start(state.shutdown.subscribe())
            .await
            .context("starting discovery engine")?;

        spawn_cleanup_loops(Arc::clone(&state), state.shutdown.subscribe());

        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], self.config.port));
        tracing::info!(%addr, guid = %state.identity.guid(), "cyberchat node starting");

        let router = crate::web::router(Arc::clone(&state));
        let serve = axum_server::bind_rustls(addr, tls_config)
            .serve(router.into_make_service_with_connect_info::<std::net::SocketAddr>());

        tokio::select! {
            result = serve => {
                result.context("HTTP/TLS surface exited")?;
            }
            _ = wait_for_shutdown_signal() => {
                tracing::info!("shutdown signal received");
            }
        }

        let _ = state.shutdown.send(true);
        tracing::info!("draining with {:?} grace period", SHUTDOWN_GRACE);
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        Ok(())
    }
}

fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").unwrap();
    }
    out
}

/// Every long-running loop not already owned by a component: active-peer
/// cleanup, the daily message sweep, and the bus's session heartbeat reaper.
/// Each observes `shutdown` on its next iteration (§9).
fn spawn_cleanup_loops(state: Arc<SharedState>, shutdown: watch::Receiver<bool>) {
    let cleanup_interval = ACTIVE_TIMEOUT / 2;

    {
        let state = Arc::clone(&state);
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => state.peers.evict_expired(),
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    {
        let state = Arc::clone(&state);
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MESSAGE_CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let cutoff = crate::peers::unix_now() - MESSAGE_RETENTION.as_secs() as i64;
                        match state.db.delete_messages_older_than(cutoff) {
                            Ok(n) if n > 0 => tracing::info!("message cleanup: pruned {n} messages"),
                            Ok(_) => {}
                            Err(e) => tracing::warn!("message cleanup failed: {e}"),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    {
        let state = Arc::clone(&state);
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SESSION_REAP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => state.events.reap_stale_sessions(),
                    _ = shutdown.changed() => break,
                }
            }
        });
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async { signal::ctrl_c().await.expect("failed to listen for ctrl-c") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
