//! TLS acceptor construction.

use std::path::Path;

use native_tls::Identity;

use crate::errors::Error;

/// Build the acceptor for client-side `SSLRequest` upgrades from a PEM
/// certificate and PKCS#8 key pair.
pub fn build_acceptor(cert: &Path, key: &Path) -> Result<tokio_native_tls::TlsAcceptor, Error> {
    let cert_pem = std::fs::read(cert).map_err(|err| {
        Error::BadConfig(format!("cannot read certificate {}: {err}", cert.display()))
    })?;
    let key_pem = std::fs::read(key).map_err(|err| {
        Error::BadConfig(format!("cannot read private key {}: {err}", key.display()))
    })?;
    let identity = Identity::from_pkcs8(&cert_pem, &key_pem)?;
    let acceptor = native_tls::TlsAcceptor::builder(identity).build()?;
    Ok(tokio_native_tls::TlsAcceptor::from(acceptor))
}
