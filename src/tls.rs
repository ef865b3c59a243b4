//! Mutual TLS setup (§6): the inbound listener requires and verifies a
//! client certificate; each outbound callback is itself a TLS client that
//! trusts only the per-client CA bundle for the job's owner.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::EdgeError;

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, EdgeError> {
    let mut reader = std::io::BufReader::new(
        std::fs::File::open(path)
            .map_err(|e| EdgeError::Configuration(format!("opening {}: {e}", path.display())))?,
    );
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EdgeError::Configuration(format!("parsing certs in {}: {e}", path.display())))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, EdgeError> {
    let mut reader = std::io::BufReader::new(
        std::fs::File::open(path)
            .map_err(|e| EdgeError::Configuration(format!("opening {}: {e}", path.display())))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| EdgeError::Configuration(format!("parsing key in {}: {e}", path.display())))?
        .ok_or_else(|| EdgeError::Configuration(format!("no private key found in {}", path.display())))
}

fn root_store_from_bundle(path: &Path) -> Result<RootCertStore, EdgeError> {
    let certs = load_certs(path)?;
    let mut store = RootCertStore::empty();
    for cert in certs {
        store
            .add(cert)
            .map_err(|e| EdgeError::Configuration(format!("adding CA from {}: {e}", path.display())))?;
    }
    Ok(store)
}

/// Builds the listener-side TLS config: `CERT_REQUIRED` against the client
/// CA bundle (`certs/client.crt`), presenting the node's own identity
/// (CN `Edge`).
pub fn server_tls_config(
    server_cert: &Path,
    server_key: &Path,
    client_ca_bundle: &Path,
) -> Result<Arc<ServerConfig>, EdgeError> {
    let roots = root_store_from_bundle(client_ca_bundle)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| EdgeError::Configuration(format!("building client verifier: {e}")))?;

    let certs = load_certs(server_cert)?;
    let key = load_private_key(server_key)?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| EdgeError::Configuration(format!("building server TLS config: {e}")))?;
    Ok(Arc::new(config))
}

/// Builds the outbound-callback TLS config trusting only
/// `certs/<client_name>.crt`, and presenting the node's own identity so the
/// callback connection is itself mutually authenticated.
pub fn client_tls_config(
    per_client_ca: &Path,
    server_cert: &Path,
    server_key: &Path,
) -> Result<Arc<ClientConfig>, EdgeError> {
    let roots = root_store_from_bundle(per_client_ca)?;
    let certs = load_certs(server_cert)?;
    let key = load_private_key(server_key)?;

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| EdgeError::Configuration(format!("building client TLS config: {e}")))?;
    Ok(Arc::new(config))
}

/// Expected server name used when connecting out to a client: the peer's
/// certificate is checked against the client's own name rather than a DNS
/// hostname, matching the original's `server_hostname=<client name>`.
pub fn server_name_for(client_name: &str) -> Result<ServerName<'static>, EdgeError> {
    ServerName::try_from(client_name.to_string())
        .map_err(|e| EdgeError::Configuration(format!("invalid client name for TLS SNI: {e}")))
}

/// Extracts the certificate subject's common name (§1 "authorization...
/// verifying the client certificate's common name").
pub fn common_name(cert: &CertificateDer<'_>) -> Result<String, EdgeError> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| EdgeError::Configuration(format!("parsing peer certificate: {e}")))?;
    parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| EdgeError::Configuration("peer certificate has no common name".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_rejects_empty_names() {
        // An empty string is neither a valid DNS name nor a valid IP
        // address, so `ServerName::try_from` rejects it.
        assert!(server_name_for("").is_err());
    }

    #[test]
    fn server_name_accepts_a_well_formed_client_name() {
        assert!(server_name_for("alice").is_ok());
    }
}
