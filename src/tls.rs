//! Self-signed certificate generation and TLS server config construction.
//!
//! Per §1/§6 the transport carries no trust of its own — peers accept
//! whatever certificate is presented; real trust lives entirely in
//! `crypto`'s per-message RSA-OAEP envelope. This module exists only to
//! produce a working `rustls::ServerConfig`, the way `freeq_server::server::
//! build_tls_acceptor` does for its own listener; here it's wrapped in an
//! `axum_server::tls_rustls::RustlsConfig` since H serves an axum `Router`
//! rather than a hand-rolled protocol.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};

const CERT_FILE: &str = "node-cert.pem";
const KEY_FILE: &str = "node-key.pem";
const VALIDITY_YEARS: i64 = 100;

/// Load the persisted cert/key pair from `data_dir`, generating and
/// persisting a fresh one on first start.
pub fn load_or_create(data_dir: &Path) -> Result<RustlsConfig> {
    let cert_path = data_dir.join(CERT_FILE);
    let key_path = data_dir.join(KEY_FILE);

    let (cert_pem, key_pem) = if cert_path.exists() && key_path.exists() {
        (std::fs::read(&cert_path)?, std::fs::read(&key_path)?)
    } else {
        let (cert_pem, key_pem) = generate_self_signed()?;
        std::fs::write(&cert_path, &cert_pem).context("writing node-cert.pem")?;
        std::fs::write(&key_path, &key_pem).context("writing node-key.pem")?;
        (cert_pem, key_pem)
    };

    build_config(&cert_pem, &key_pem)
}

/// CN `"*"`, SANs loopback/0.0.0.0/localhost, 100-year validity — per §6.
fn generate_self_signed() -> Result<(Vec<u8>, Vec<u8>)> {
    let mut params = CertificateParams::new(vec![
        "localhost".to_string(),
        "0.0.0.0".to_string(),
        "127.0.0.1".to_string(),
    ])
    .context("building certificate params")?;
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, "*");
    params.subject_alt_names.push(SanType::IpAddress("127.0.0.1".parse().unwrap()));
    params.subject_alt_names.push(SanType::IpAddress("0.0.0.0".parse().unwrap()));
    let not_before = time::OffsetDateTime::now_utc();
    params.not_before = not_before;
    params.not_after = not_before + time::Duration::days(365 * VALIDITY_YEARS);

    let key_pair = KeyPair::generate().context("generating cert key pair")?;
    let cert = params.self_signed(&key_pair).context("self-signing certificate")?;

    Ok((cert.pem().into_bytes(), key_pair.serialize_pem().into_bytes()))
}

fn build_config(cert_pem: &[u8], key_pem: &[u8]) -> Result<RustlsConfig> {
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .context("parsing node certificate")?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .context("parsing node private key")?
        .context("no private key found in node-key.pem")?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS server config")?;

    Ok(RustlsConfig::from_config(Arc::new(config)))
}

/// Build a `reqwest::Client` that never validates peer certificates — the
/// mesh's trust boundary is the per-message envelope, not the channel.
pub fn insecure_http_client(timeout: std::time::Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(timeout)
        .build()
        .expect("reqwest client")
}
