//! Configuration value objects consumed by [`crate::server::Server`].

use std::path::PathBuf;

/// The container daemon the proxy forwards requests to. Immutable once
/// handed to [`crate::server::Server::new`].
#[derive(Debug, Clone, Default)]
pub struct Backend {
    pub addr: String,
    pub tls_ca: Option<PathBuf>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

/// One or more listeners the proxy exposes to clients. `addrs` must contain
/// at least one entry by the time [`crate::server::Server::start`] runs.
/// Duplicate entries are legal and produce independent listeners.
#[derive(Debug, Clone, Default)]
pub struct Frontend {
    pub addrs: Vec<String>,
    pub tls_ca: Option<PathBuf>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}
