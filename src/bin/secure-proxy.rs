//! Operator-facing wrapper around [`secure_proxy::Server`]: flag parsing,
//! environment-variable default resolution, and log sink configuration.
//! None of the hard engineering lives here — this binary only translates
//! CLI/env input into a [`secure_proxy::Server`] and drives it.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use secure_proxy::{rule, Backend, Frontend, Server};
use tracing_subscriber::EnvFilter;

const DEFAULT_BACKEND_ADDR: &str = "unix:///var/run/docker.sock";
const DEFAULT_FRONTEND_ADDR: &str = "tcp://:2375";

/// Filtering reverse proxy for container-management daemon APIs.
#[derive(Parser, Debug)]
#[command(name = "secure-proxy", version, about)]
struct Args {
    /// Container daemon socket to connect to (env SECURE_PROXY_BACKEND_ADDR, CONTAINER_HOST, DOCKER_HOST)
    #[arg(long)]
    backend_addr: Option<String>,

    /// Path to the backend TLS CA used to verify the daemon identity (env SECURE_PROXY_BACKEND_TLS_CACERT)
    #[arg(long, env = "SECURE_PROXY_BACKEND_TLS_CACERT")]
    backend_tls_cacert: Option<PathBuf>,

    /// Path to the backend TLS certificate used to authenticate with the daemon (env SECURE_PROXY_BACKEND_TLS_CERT)
    #[arg(long, env = "SECURE_PROXY_BACKEND_TLS_CERT")]
    backend_tls_cert: Option<PathBuf>,

    /// Path to the backend TLS key used to authenticate with the daemon (env SECURE_PROXY_BACKEND_TLS_KEY)
    #[arg(long, env = "SECURE_PROXY_BACKEND_TLS_KEY")]
    backend_tls_key: Option<PathBuf>,

    /// Address to bind the frontend to, may be repeated (env SECURE_PROXY_FRONTEND_ADDR)
    #[arg(long = "frontend-addr")]
    frontend_addr: Vec<String>,

    /// Path to the frontend TLS CA used to verify client identities (env SECURE_PROXY_FRONTEND_TLS_CACERT)
    #[arg(long, env = "SECURE_PROXY_FRONTEND_TLS_CACERT")]
    frontend_tls_cacert: Option<PathBuf>,

    /// Path to the frontend TLS certificate (env SECURE_PROXY_FRONTEND_TLS_CERT)
    #[arg(long, env = "SECURE_PROXY_FRONTEND_TLS_CERT")]
    frontend_tls_cert: Option<PathBuf>,

    /// Path to the frontend TLS key (env SECURE_PROXY_FRONTEND_TLS_KEY)
    #[arg(long, env = "SECURE_PROXY_FRONTEND_TLS_KEY")]
    frontend_tls_key: Option<PathBuf>,

    /// Filter rules text, may be repeated (env SECURE_PROXY_RULES)
    #[arg(long = "rules")]
    rules: Vec<String>,

    /// Filter rules file, may be repeated (env SECURE_PROXY_RULES_FILE)
    #[arg(long = "rules-file")]
    rules_file: Vec<PathBuf>,

    /// Do not load any default rules (env SECURE_PROXY_NO_DEFAULT_RULES)
    #[arg(long, env = "SECURE_PROXY_NO_DEFAULT_RULES")]
    no_default_rules: bool,

    /// The minimum entry level to log, off|error|warn|info|debug|trace (env SECURE_PROXY_LOG_LEVEL)
    #[arg(long, env = "SECURE_PROXY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn resolve_backend_addr(arg: Option<String>) -> String {
    arg.or_else(|| env::var("SECURE_PROXY_BACKEND_ADDR").ok())
        .or_else(|| env::var("CONTAINER_HOST").ok())
        .or_else(|| env::var("DOCKER_HOST").ok())
        .unwrap_or_else(|| DEFAULT_BACKEND_ADDR.to_string())
}

fn resolve_frontend_addrs(arg: Vec<String>) -> Vec<String> {
    if !arg.is_empty() {
        return arg;
    }
    match env::var("SECURE_PROXY_FRONTEND_ADDR") {
        Ok(val) => val.split(',').map(str::trim).map(String::from).collect(),
        Err(_) => vec![DEFAULT_FRONTEND_ADDR.to_string()],
    }
}

fn build_rule_set(args: &Args) -> Result<Vec<rule::Rule>, secure_proxy::error::RuleError> {
    let mut rules = rule::build_rule_set(args.no_default_rules, &args.rules, &args.rules_file)?;

    if let Ok(rules_env) = env::var("SECURE_PROXY_RULES") {
        rules.extend(rule::build_rules(&rules_env)?);
    }
    if let Ok(rules_file_env) = env::var("SECURE_PROXY_RULES_FILE") {
        rules.extend(rule::build_rules_from_path(PathBuf::from(rules_file_env).as_path())?);
    }

    Ok(rules)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let rules = match build_rule_set(&args) {
        Ok(rules) => rules,
        Err(err) => {
            tracing::error!(error = %err, "failed to build rule set");
            std::process::exit(1);
        }
    };

    let backend = Backend {
        addr: resolve_backend_addr(args.backend_addr.clone()),
        tls_ca: args.backend_tls_cacert.clone(),
        tls_cert: args.backend_tls_cert.clone(),
        tls_key: args.backend_tls_key.clone(),
    };
    let frontend = Frontend {
        addrs: resolve_frontend_addrs(args.frontend_addr.clone()),
        tls_ca: args.frontend_tls_cacert.clone(),
        tls_cert: args.frontend_tls_cert.clone(),
        tls_key: args.frontend_tls_key.clone(),
    };

    let server = Arc::new(Server::new(backend, frontend, rules));
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

    let server_task = {
        let server = server.clone();
        tokio::spawn(async move { server.start(ready_tx).await })
    };

    if let Ok(bound) = ready_rx.await {
        for addr in &bound {
            tracing::info!(%addr, "listening");
        }
    }

    match server_task.await {
        Ok(Ok(())) => std::process::exit(0),
        Ok(Err(err)) => {
            tracing::error!(error = %err, "server exited with an error");
            std::process::exit(1);
        }
        Err(err) => {
            tracing::error!(error = %err, "server task panicked");
            std::process::exit(1);
        }
    }
}
