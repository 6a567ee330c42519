use std::fs;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rustls::ServerConfig;

/// TLS material for the HTTPS listener, loaded once at boot. Rotating the
/// certificate is a restart.
pub fn server_config(cert_path: &str, key_path: &str) -> Result<Arc<ServerConfig>> {
    let cert_pem =
        fs::read(cert_path).with_context(|| format!("read tls certificate {}", cert_path))?;
    let chain = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("bad pem in {}", cert_path))?;
    if chain.is_empty() {
        bail!("{} holds no certificates", cert_path);
    }

    let key_pem = fs::read(key_path).with_context(|| format!("read tls key {}", key_path))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .with_context(|| format!("bad pem in {}", key_path))?
        .with_context(|| format!("{} holds no private key", key_path))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .context("certificate and key do not form a usable pair")?;
    // the tls listener accepts the same protocols as the plain one
    config.alpn_protocols = ["h2", "http/1.1"]
        .map(|proto| proto.as_bytes().to_vec())
        .into();

    Ok(Arc::new(config))
}
