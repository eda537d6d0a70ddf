//! Distinct, testable error kinds for every failure domain the proxy can hit.
//!
//! Mirrors the error surface of the original daemon-side proxy: configuration
//! and bind failures are fatal at startup, round-trip/upgrade failures are
//! translated into HTTP responses and never escape a connection task.

use std::io;
use std::path::PathBuf;

/// Failures building TLS client/server contexts.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("I/O error reading TLS material: {0}")]
    Io(#[from] io::Error),

    #[error("no certificates found in supplied PEM file")]
    NoCertificateFound,

    #[error("certificate and key must be supplied together")]
    IncompleteCertKeyPair,

    #[error("invalid TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("failed to build client certificate verifier: {0}")]
    ClientVerifier(#[from] rustls::server::VerifierBuilderError),
}

/// Failures compiling the rule DSL.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("invalid rule line: {line}")]
    Syntax { line: String },

    #[error("undefined variable %{name}% in rule pattern")]
    UndefinedVariable { name: String },

    #[error("invalid rule pattern in `{rule}`: {source}")]
    Pattern { rule: String, source: regex::Error },

    #[error("open {0}: not a regular file")]
    NotARegularFile(PathBuf),

    #[error("{path}: {source}")]
    File { path: PathBuf, source: Box<RuleError> },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Configuration errors, surfaced synchronously from [`crate::server::Server::start`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid address format: {0}")]
    InvalidAddr(String),

    #[error("unsupported address protocol: {0}")]
    UnsupportedScheme(String),

    #[error("frontend must declare at least one address")]
    NoFrontendAddrs,

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Url(#[from] url::ParseError),
}

/// Failures within a single forwarded request. Never escapes the connection
/// task: every variant is translated into a response code by the caller.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("backend round-trip failed: {0}")]
    BadGateway(#[source] hyper_util::client::legacy::Error),

    #[error("body is not writable")]
    NotUpgradable,

    #[error("request cancelled by server shutdown")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Http(#[from] hyper::Error),

    #[error(transparent)]
    HttpSpec(#[from] http::Error),
}

/// Lifecycle errors from [`crate::server::Server`].
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind listener {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error(transparent)]
    Io(#[from] io::Error),
}
