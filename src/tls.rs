//! TLS context builder: client and server variants, independent trust
//! domains, TLS 1.2 floor, optional mutual TLS on the server side.

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::TlsError;

const TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS12, &rustls::version::TLS13];

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let bytes = fs::read(path)?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(bytes.as_slice()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let bytes = fs::read(path)?;
    rustls_pemfile::private_key(&mut BufReader::new(bytes.as_slice()))?
        .ok_or(TlsError::NoCertificateFound)
}

fn root_store(ca_path: &Path) -> Result<RootCertStore, TlsError> {
    let certs = load_certs(ca_path)?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificateFound);
    }
    let mut store = RootCertStore::empty();
    for cert in certs {
        // A malformed individual certificate is reported the same way as
        // an empty file: there is nothing usable to trust.
        store
            .add(cert)
            .map_err(|_| TlsError::NoCertificateFound)?;
    }
    Ok(store)
}

/// Loads the host's trust store as a fallback root pool. Certificates the
/// platform can't parse are skipped rather than failing the whole load.
fn native_root_store() -> RootCertStore {
    let mut store = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for err in loaded.errors {
        tracing::warn!(error = %err, "skipping unreadable system certificate");
    }
    for cert in loaded.certs {
        let _ = store.add(cert);
    }
    store
}

fn cert_key_pair(
    cert: Option<&Path>,
    key: Option<&Path>,
) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>, TlsError> {
    match (cert, key) {
        (Some(cert), Some(key)) => Ok(Some((load_certs(cert)?, load_key(key)?))),
        (None, None) => Ok(None),
        _ => Err(TlsError::IncompleteCertKeyPair),
    }
}

/// Builds the backend-facing client TLS context. Returns `None` ("plaintext
/// sentinel") when neither a CA bundle nor a client certificate pair was
/// supplied. When a client certificate pair is supplied without an explicit
/// CA, falls back to the host's trust store — matching `crypto/tls`, which
/// leaves `RootCAs` nil (and thus system-trust) in the same situation — so
/// an operator can configure client-cert auth while still trusting a public
/// CA for the backend certificate.
pub fn client_config(
    ca: Option<&Path>,
    cert: Option<&Path>,
    key: Option<&Path>,
) -> Result<Option<Arc<ClientConfig>>, TlsError> {
    if ca.is_none() && cert.is_none() && key.is_none() {
        return Ok(None);
    }

    let builder = ClientConfig::builder_with_protocol_versions(TLS_VERSIONS);

    let builder = if let Some(ca) = ca {
        builder.with_root_certificates(root_store(ca)?)
    } else {
        builder.with_root_certificates(native_root_store())
    };

    let config = match cert_key_pair(cert, key)? {
        Some((certs, key)) => builder.with_client_auth_cert(certs, key)?,
        None => builder.with_no_client_auth(),
    };

    Ok(Some(Arc::new(config)))
}

/// Builds the frontend-facing server TLS context. Client-certificate
/// authentication is "require and verify" iff a CA bundle is supplied;
/// otherwise clients are not asked for a certificate at all. Returns `None`
/// when no TLS material was supplied at all.
pub fn server_config(
    ca: Option<&Path>,
    cert: Option<&Path>,
    key: Option<&Path>,
) -> Result<Option<Arc<ServerConfig>>, TlsError> {
    if ca.is_none() && cert.is_none() && key.is_none() {
        return Ok(None);
    }

    let builder = ServerConfig::builder_with_protocol_versions(TLS_VERSIONS);

    let builder = match ca {
        Some(ca) => {
            let verifier = WebPkiClientVerifier::builder(Arc::new(root_store(ca)?)).build()?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let (certs, key) = cert_key_pair(cert, key)?.ok_or(TlsError::IncompleteCertKeyPair)?;
    let config = builder.with_single_cert(certs, key)?;

    Ok(Some(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_material_means_plaintext() {
        assert!(client_config(None, None, None).unwrap().is_none());
        assert!(server_config(None, None, None).unwrap().is_none());
    }

    #[test]
    fn server_requires_cert_and_key() {
        // Neither supplied at all, no CA either: still incomplete because a
        // server has no certificate to present. This is distinguished from
        // the "no TLS at all" sentinel by the caller always supplying at
        // least one of ca/cert/key when it wants a server_config call.
        let err = server_config(None, Some(Path::new("missing-cert.pem")), None).unwrap_err();
        assert!(matches!(err, TlsError::IncompleteCertKeyPair));
    }
}
