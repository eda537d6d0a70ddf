//! `secure-proxy`: a filtering reverse proxy for container-management
//! daemon APIs (Docker/Podman-style), built on an allow-list rule engine
//! and a hyper-based forwarding core.
//!
//! The CLI binary (`src/bin/secure-proxy.rs`) is a thin translation layer
//! onto [`Server`] — flag parsing, environment-variable defaults, and log
//! sink configuration live there; everything else lives here.

pub mod addr;
pub mod classify;
pub mod config;
pub mod connector;
pub mod error;
pub mod forward;
pub mod rule;
pub mod server;
pub mod tls;

pub use config::{Backend, Frontend};
pub use server::{BoundAddr, Server};
