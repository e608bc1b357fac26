//! Shared harness for spinning up complete, independent cores in one test
//! process (§9 "a test harness must be able to spin up two complete cores
//! in one process for the inter-peer scenarios"). Each [`spawn_node`] binds
//! its own TLS listener on an OS-assigned loopback port and its own
//! temp-directory SQLite store; nodes never share state except through the
//! HTTP calls the tests issue between them.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use cyberchat_node::config::NodeConfig;
use cyberchat_node::server::{Server, SharedState};
use cyberchat_node::{peers::PeerObservation, tls};

pub struct TestNode {
    pub state: Arc<SharedState>,
    pub addr: SocketAddr,
    serve_task: tokio::task::JoinHandle<()>,
    _tempdir: tempfile::TempDir,
}

impl TestNode {
    /// Register `other` as an active peer of this node, bypassing mDNS —
    /// the tests drive peer discovery directly since no two test processes
    /// share a link-local segment.
    pub fn learn_peer(&self, other: &TestNode) {
        self.state
            .peers
            .ingest_observation(PeerObservation {
                guid: other.state.identity.guid(),
                name: other.state.identity.display_name(),
                ip: other.addr.ip(),
                port: other.addr.port(),
                public_key: Some(other.state.identity.public_key().clone()),
            })
            .expect("ingest_observation");
    }

    /// Simulate the peer's server process dying: stop accepting/serving
    /// connections on its listener. Its peer record in other nodes' active
    /// sets is untouched, matching a real crash.
    pub fn kill(&self) {
        self.serve_task.abort();
    }
}

/// Build a complete core and serve its HTTP/TLS surface on a loopback port,
/// without starting mDNS advertisement/scanning (irrelevant to these tests
/// and not reliably available in a sandboxed test environment).
pub async fn spawn_node(name: &str) -> TestNode {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let config = NodeConfig {
        port: 0,
        data_dir: tempdir.path().to_path_buf(),
        name: Some(name.to_string()),
        reset: false,
        debug: false,
    };
    std::fs::create_dir_all(&config.data_dir).expect("create data dir");

    let server = Server::new(config.clone());
    let state = server.build_state().expect("build_state");

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local_addr");
    let tls_config = tls::load_or_create(&config.data_dir).expect("tls setup");

    let router = cyberchat_node::web::router(Arc::clone(&state));
    let serve_task = tokio::spawn(async move {
        let _ = axum_server::from_tcp_rustls(listener, tls_config)
            .serve(router.into_make_service_with_connect_info::<SocketAddr>())
            .await;
    });

    // Give the acceptor loop a moment to start before the first connection.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestNode { state, addr, serve_task, _tempdir: tempdir }
}

pub fn insecure_client() -> reqwest::Client {
    tls::insecure_http_client(Duration::from_secs(5))
}
