use anyhow::Result;
use clap::Parser;
use cyberchat_node::config::NodeConfig;
use cyberchat_node::server::Server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Install the process-wide rustls crypto provider before any TLS usage.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = NodeConfig::parse();

    // Use JSON logs in production (CYBERCHAT_LOG_JSON=1), human-readable otherwise.
    let json_logs = std::env::var("CYBERCHAT_LOG_JSON").unwrap_or_default() == "1";
    let default_level = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("cyberchat_node={default_level}").parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(port = config.port, data_dir = ?config.data_dir, "cyberchat node configured");

    let server = Server::new(config);
    server.run().await
}
