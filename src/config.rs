//! CLI / configuration surface (ambient; §4.9, §6).
//!
//! Summarized deliberately: port, data directory, display name, reset,
//! debug, version. Everything else in the mesh (timeouts, TTLs, interval
//! backoff) is a fixed constant defined next to the component that owns it,
//! not a runtime flag.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "cyberchat-node", version, about = "Zero-configuration peer-to-peer chat and file mesh node")]
pub struct NodeConfig {
    /// Port the peer-facing and session-facing HTTPS surface binds to.
    #[arg(long, default_value_t = 7331)]
    pub port: u16,

    /// Directory holding the SQLite store, identity, and TLS material.
    #[arg(long, env = "CYBERCHAT_DATA_DIR", default_value = "./cyberchat-data")]
    pub data_dir: PathBuf,

    /// Display name advertised to other peers. Defaults to the local hostname.
    #[arg(long)]
    pub name: Option<String>,

    /// Wipe the data directory's store, identity, and certificate before starting.
    #[arg(long, default_value_t = false)]
    pub reset: bool,

    /// Verbose (debug-level) logging.
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

impl NodeConfig {
    pub fn resolved_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            hostname().unwrap_or_else(|| "cyberchat-node".to_string())
        })
    }

    /// Apply `--reset`: remove the SQLite file, identity settings (embedded
    /// in the same store), and the persisted TLS material so the next start
    /// behaves as a first start.
    pub fn apply_reset(&self) -> anyhow::Result<()> {
        if !self.reset {
            return Ok(());
        }
        if self.data_dir.exists() {
            std::fs::remove_dir_all(&self.data_dir)?;
        }
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("cyberchat.db")
    }
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME").ok().or_else(|| std::env::var("COMPUTERNAME").ok())
}
