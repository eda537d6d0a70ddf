//! Listener supervisor and server lifecycle: `Idle -> Starting -> Running ->
//! Stopping -> Idle`, guarded by a lifecycle mutex with a lock-free
//! `is_running` projection for hot-path checks.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::{Request, Response};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HttpBuilder;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::addr::{parse_addr, Proto};
use crate::classify::classify;
use crate::config::{Backend, Frontend};
use crate::connector::BackendConnector;
use crate::error::{ConfigError, ForwardError, ServerError};
use crate::forward::{bad_gateway, forbidden, forward, internal_error, BackendTarget, ProxyBody};
use crate::rule::Rule;
use crate::tls;

const BACKEND_CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const MAX_IDLE_PER_HOST: usize = 10;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Listener address actually bound, reported by [`Server::addrs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundAddr {
    Tcp(SocketAddr),
    Unix(String),
}

impl std::fmt::Display for BoundAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoundAddr::Tcp(addr) => write!(f, "tcp://{addr}"),
            BoundAddr::Unix(path) => write!(f, "unix://{path}"),
        }
    }
}

/// An already-bound frontend listener, owning its socket. Keeping the real
/// listener (rather than just its address) alive from bind time to serve
/// time is what lets `tcp://host:0` ephemeral ports work and lets a bind
/// failure partway through a multi-address frontend simply drop everything
/// already opened.
enum BoundListener {
    Tcp(TcpListener, SocketAddr),
    Unix(UnixListener, String),
}

impl BoundListener {
    fn is_unix(&self) -> bool {
        matches!(self, BoundListener::Unix(..))
    }

    fn bound_addr(&self) -> BoundAddr {
        match self {
            BoundListener::Tcp(_, addr) => BoundAddr::Tcp(*addr),
            BoundListener::Unix(_, path) => BoundAddr::Unix(path.clone()),
        }
    }
}

struct RunningState {
    bound_addrs: Vec<BoundAddr>,
    cancel: CancellationToken,
    listeners: JoinSet<()>,
    connection_drain: tokio::task::JoinHandle<()>,
    client: Client<BackendConnector, Incoming>,
}

type TrackedFuture = Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Handed to every connection task and, from there, into [`crate::forward`]
/// so an upgrade byte-pump can register itself too. Every tracked future
/// lands in a single `JoinSet` owned by [`drain_connections`], which is the
/// only task that ever waits on or aborts them — that lets `Server::stop`
/// bound the connection drain by [`SHUTDOWN_GRACE`] without the accept loops
/// or connection tasks needing a shared lock.
#[derive(Clone)]
pub(crate) struct ConnectionTracker {
    tx: mpsc::UnboundedSender<TrackedFuture>,
}

impl ConnectionTracker {
    pub(crate) fn track<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        // The receiver only disappears once `drain_connections` has already
        // returned, i.e. after the grace window expired and every tracked
        // task was aborted; a send failing at that point means there is
        // nothing left to bound, so dropping the future is correct.
        let _ = self.tx.send(Box::pin(fut));
    }
}

/// Owns every tracked connection and upgrade-pump future. Accepts new work
/// indefinitely until `cancel` fires, then keeps accepting stragglers (a
/// pump spawned just as shutdown began) while bounding the whole drain by
/// [`SHUTDOWN_GRACE`], hard-aborting anything still running at expiry.
async fn drain_connections(mut rx: mpsc::UnboundedReceiver<TrackedFuture>, cancel: CancellationToken) {
    let mut tasks: JoinSet<()> = JoinSet::new();
    let mut rx_closed = false;

    loop {
        tokio::select! {
            maybe_fut = rx.recv(), if !rx_closed => {
                match maybe_fut {
                    Some(fut) => { tasks.spawn(fut); }
                    None => rx_closed = true,
                }
            }
            _ = tasks.join_next(), if !tasks.is_empty() => {}
            _ = cancel.cancelled() => break,
        }
    }

    let grace = tokio::time::sleep(SHUTDOWN_GRACE);
    tokio::pin!(grace);
    loop {
        if rx_closed && tasks.is_empty() {
            break;
        }
        tokio::select! {
            maybe_fut = rx.recv(), if !rx_closed => {
                match maybe_fut {
                    Some(fut) => { tasks.spawn(fut); }
                    None => rx_closed = true,
                }
            }
            _ = tasks.join_next(), if !tasks.is_empty() => {}
            _ = &mut grace => {
                tasks.abort_all();
                break;
            }
        }
    }
}

/// A filtering reverse proxy instance. Cheap to construct; all expensive
/// setup (binding listeners, building TLS contexts) happens in [`Server::start`].
pub struct Server {
    backend: Backend,
    frontend: Frontend,
    rules: Vec<Rule>,
    is_running: AtomicBool,
    running: AsyncMutex<Option<RunningState>>,
}

impl Server {
    pub fn new(backend: Backend, frontend: Frontend, rules: Vec<Rule>) -> Self {
        Self {
            backend,
            frontend,
            rules,
            is_running: AtomicBool::new(false),
            running: AsyncMutex::new(None),
        }
    }

    /// Lock-free projection of the lifecycle state, safe to poll from any
    /// thread without contending the lifecycle mutex.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Starts the server, binding every configured frontend listener and
    /// blocking until [`Server::stop`] is called or a listener fails
    /// irrecoverably. `ready` is notified once (with bound addresses) the
    /// moment every listener is accepting connections, before this call
    /// blocks on the serve loop.
    pub async fn start(
        self: &Arc<Self>,
        ready: tokio::sync::oneshot::Sender<Vec<BoundAddr>>,
    ) -> Result<(), ServerError> {
        let mut guard = self.running.lock().await;
        if guard.is_some() {
            let _ = ready.send(Vec::new());
            return Err(ServerError::AlreadyRunning);
        }

        let result = self.start_locked().await;
        match result {
            Ok((state, bound_addrs)) => {
                *guard = Some(state);
                self.is_running.store(true, Ordering::SeqCst);
                let _ = ready.send(bound_addrs);
            }
            Err(err) => {
                let _ = ready.send(Vec::new());
                return Err(err);
            }
        }
        drop(guard);

        self.wait_for_shutdown_signal_and_run().await
    }

    async fn start_locked(&self) -> Result<(RunningState, Vec<BoundAddr>), ServerError> {
        if self.frontend.addrs.is_empty() {
            return Err(ConfigError::NoFrontendAddrs.into());
        }

        let (backend_proto, backend_endpoint) = parse_addr(&self.backend.addr)?;
        let backend_tls = tls::client_config(
            self.backend.tls_ca.as_deref(),
            self.backend.tls_cert.as_deref(),
            self.backend.tls_key.as_deref(),
        )
        .map_err(ConfigError::from)?;

        let frontend_tls = tls::server_config(
            self.frontend.tls_ca.as_deref(),
            self.frontend.tls_cert.as_deref(),
            self.frontend.tls_key.as_deref(),
        )
        .map_err(ConfigError::from)?;

        let tls_server_name = if backend_proto == Proto::Unix {
            "localhost".to_string()
        } else {
            host_without_port(&backend_endpoint)
        };

        let connector = BackendConnector::new(
            backend_proto,
            backend_endpoint.clone(),
            backend_tls.clone(),
            tls_server_name,
        );
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .pool_idle_timeout(BACKEND_CLIENT_IDLE_TIMEOUT)
            .build(connector);

        let backend_target = Arc::new(BackendTarget {
            scheme: if backend_tls.is_some() { "https" } else { "http" },
            host: if backend_proto == Proto::Unix {
                "localhost".to_string()
            } else {
                backend_endpoint.clone()
            },
        });

        // Bind every listener up front so a failure partway through leaves
        // nothing dangling: each already-opened listener is simply dropped
        // (and thus closed) when `opened` goes out of scope on an early
        // return.
        let mut opened = Vec::with_capacity(self.frontend.addrs.len());
        for addr in &self.frontend.addrs {
            opened.push(bind_listener(addr).await?);
        }

        let bound_addrs: Vec<BoundAddr> = opened.iter().map(BoundListener::bound_addr).collect();

        let cancel = CancellationToken::new();
        let mut listeners = JoinSet::new();
        let rules = Arc::new(self.rules.clone());

        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let connections = ConnectionTracker { tx: conn_tx };
        let connection_drain = tokio::spawn(drain_connections(conn_rx, cancel.clone()));

        for listener in opened {
            let client = client.clone();
            let rules = rules.clone();
            let backend_target = backend_target.clone();
            // UNIX sockets always run plaintext, even if TLS material is
            // configured: the local peer channel supplies its own trust model.
            let tls_config = if listener.is_unix() { None } else { frontend_tls.clone() };
            let cancel = cancel.clone();
            let connections = connections.clone();

            listeners.spawn(async move {
                accept_loop(listener, tls_config, client, rules, backend_target, cancel, connections).await;
            });
        }

        tracing::info!(addrs = ?bound_addrs.iter().map(ToString::to_string).collect::<Vec<_>>(), "serving");

        Ok((
            RunningState {
                bound_addrs: bound_addrs.clone(),
                cancel,
                listeners,
                connection_drain,
                client,
            },
            bound_addrs,
        ))
    }

    async fn wait_for_shutdown_signal_and_run(self: &Arc<Self>) -> Result<(), ServerError> {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received");
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received");
            }
        }

        self.stop().await
    }

    /// Stops the server: rejects new connections, drains the backend
    /// client's idle connections, and gives in-flight requests (including
    /// upgraded byte-pumps) a 10 second grace window to finish before
    /// they're terminated.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let mut guard = self.running.lock().await;
        let Some(mut state) = guard.take() else {
            return Err(ServerError::NotRunning);
        };
        self.is_running.store(false, Ordering::SeqCst);

        state.cancel.cancel();
        drop(state.client);

        // Accept loops return as soon as they observe cancellation; the
        // grace window itself is bounded inside `drain_connections`.
        while state.listeners.join_next().await.is_some() {}
        let _ = state.connection_drain.await;

        tracing::info!("exit");
        Ok(())
    }

    /// Bound listener addresses while running; errors otherwise.
    pub async fn addrs(&self) -> Result<Vec<BoundAddr>, ServerError> {
        let guard = self.running.lock().await;
        match guard.as_ref() {
            Some(state) => Ok(state.bound_addrs.clone()),
            None => Err(ServerError::NotRunning),
        }
    }
}

/// Strips the port from a `host[:port]` endpoint for use as a TLS server
/// name. Bracketed IPv6 literals also have their brackets removed, since
/// `rustls::pki_types::ServerName` expects a bare IP address, not the URL
/// bracket syntax `addr::parse_addr` preserves for display purposes.
fn host_without_port(endpoint: &str) -> String {
    let host = match endpoint.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => endpoint,
    };
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
        .to_string()
}

async fn bind_listener(addr: &str) -> Result<BoundListener, ServerError> {
    let (proto, endpoint) = parse_addr(addr)?;
    match proto {
        Proto::Tcp => {
            // An empty host (`tcp://:2375`) means "bind every interface";
            // unlike Go's `net.Listen`, Rust's string-based resolver treats
            // an empty host as a hostname to look up rather than a wildcard,
            // so it is rewritten to the unspecified address here.
            let bind_to = if let Some(port) = endpoint.strip_prefix(':') {
                format!("0.0.0.0:{port}")
            } else {
                endpoint.clone()
            };
            let listener = TcpListener::bind(&bind_to)
                .await
                .map_err(|source| ServerError::Bind { addr: addr.to_string(), source })?;
            let local = listener.local_addr().map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
            Ok(BoundListener::Tcp(listener, local))
        }
        Proto::Unix => {
            let _ = std::fs::remove_file(&endpoint);
            let listener = UnixListener::bind(&endpoint)
                .map_err(|source| ServerError::Bind { addr: addr.to_string(), source })?;
            Ok(BoundListener::Unix(listener, endpoint))
        }
    }
}

async fn accept_loop(
    listener: BoundListener,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    client: Client<BackendConnector, Incoming>,
    rules: Arc<Vec<Rule>>,
    backend_target: Arc<BackendTarget>,
    cancel: CancellationToken,
    connections: ConnectionTracker,
) {
    match listener {
        BoundListener::Tcp(listener, _) => loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(s) => s,
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    spawn_connection(stream, tls_config.clone(), client.clone(), rules.clone(), backend_target.clone(), cancel.clone(), connections.clone());
                }
            }
        },
        BoundListener::Unix(listener, _) => loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(s) => s,
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    // UNIX sockets always run plaintext regardless of configured TLS material.
                    spawn_connection(stream, None, client.clone(), rules.clone(), backend_target.clone(), cancel.clone(), connections.clone());
                }
            }
        },
    }
}

/// Serves one accepted connection inside `connections` rather than a bare
/// `tokio::spawn`, so `Server::stop` can wait for (and, past grace, abort)
/// it. Races the connection future against `cancel` so a shutdown in
/// progress calls `graceful_shutdown` exactly once instead of finishing the
/// keep-alive connection unbounded.
fn spawn_connection<S>(
    stream: S,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    client: Client<BackendConnector, Incoming>,
    rules: Arc<Vec<Rule>>,
    backend_target: Arc<BackendTarget>,
    cancel: CancellationToken,
    connections: ConnectionTracker,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let task_connections = connections.clone();
    connections.track(async move {
        let connections = task_connections;
        let service = service_fn(move |req: Request<Incoming>| {
            let client = client.clone();
            let rules = rules.clone();
            let backend_target = backend_target.clone();
            let cancel = cancel.clone();
            let connections = connections.clone();
            async move { handle(req, client, rules, backend_target, cancel, connections).await }
        });

        let mut builder = HttpBuilder::new(TokioExecutor::new());
        builder.http1().header_read_timeout(READ_HEADER_TIMEOUT);

        let result = match tls_config {
            Some(tls_config) => {
                let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        let conn = builder.serve_connection_with_upgrades(TokioIo::new(tls_stream), service);
                        tokio::pin!(conn);
                        let mut shutting_down = false;
                        loop {
                            tokio::select! {
                                res = conn.as_mut() => break res,
                                _ = cancel.cancelled(), if !shutting_down => {
                                    conn.as_mut().graceful_shutdown();
                                    shutting_down = true;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "TLS handshake failed");
                        return;
                    }
                }
            }
            None => {
                let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
                tokio::pin!(conn);
                let mut shutting_down = false;
                loop {
                    tokio::select! {
                        res = conn.as_mut() => break res,
                        _ = cancel.cancelled(), if !shutting_down => {
                            conn.as_mut().graceful_shutdown();
                            shutting_down = true;
                        }
                    }
                }
            }
        };

        if let Err(err) = result {
            tracing::debug!(error = %err, "connection closed with error");
        }
    });
}

async fn handle(
    req: Request<Incoming>,
    client: Client<BackendConnector, Incoming>,
    rules: Arc<Vec<Rule>>,
    backend_target: Arc<BackendTarget>,
    cancel: CancellationToken,
    connections: ConnectionTracker,
) -> Result<Response<ProxyBody>, std::convert::Infallible> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();

    if classify(&rules, &method, &path) {
        tracing::debug!(%method, %path, "allowed request");
        match forward(req, &client, &backend_target, &cancel, &connections).await {
            Ok(response) => Ok(response),
            Err(ForwardError::BadGateway(_)) | Err(ForwardError::Cancelled) => Ok(bad_gateway()),
            Err(ForwardError::NotUpgradable) => Ok(internal_error()),
            Err(err) => {
                tracing::error!(%method, %path, error = %err, "forwarding failed");
                Ok(internal_error())
            }
        }
    } else {
        tracing::warn!(%method, %path, "denied request");
        Ok(forbidden())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::build_rules;
    use std::convert::Infallible;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn host_without_port_strips_port_and_ipv6_brackets() {
        assert_eq!(host_without_port("example.com:2375"), "example.com");
        assert_eq!(host_without_port("example.com"), "example.com");
        assert_eq!(host_without_port("[::1]:2375"), "::1");
        assert_eq!(host_without_port("127.0.0.1:2375"), "127.0.0.1");
    }

    /// A minimal stub backend standing in for the container daemon: reads
    /// one request and writes back a fixed, canned response.
    async fn spawn_stub_backend(response: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(response).await;
            let _ = stream.shutdown().await;
        });
        format!("tcp://{local}")
    }

    fn test_server(backend_addr: String, rules_src: &str) -> Arc<Server> {
        let rules = build_rules(rules_src).unwrap();
        Arc::new(Server::new(
            Backend { addr: backend_addr, tls_ca: None, tls_cert: None, tls_key: None },
            Frontend {
                addrs: vec!["tcp://127.0.0.1:0".to_string()],
                tls_ca: None,
                tls_cert: None,
                tls_key: None,
            },
            rules,
        ))
    }

    #[tokio::test]
    async fn stop_twice_errors_start_again_succeeds() {
        let backend_addr = spawn_stub_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nPONG").await;
        let server = test_server(backend_addr, "GET /x");

        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let start_task = {
            let server = server.clone();
            tokio::spawn(async move { server.start(ready_tx).await })
        };
        let bound = ready_rx.await.unwrap();
        assert_eq!(bound.len(), 1);
        assert!(server.is_running());

        server.stop().await.unwrap();
        assert!(matches!(server.stop().await, Err(ServerError::NotRunning)));

        let _ = start_task.await;

        let (ready_tx2, ready_rx2) = tokio::sync::oneshot::channel();
        let restart_task = {
            let server = server.clone();
            tokio::spawn(async move { server.start(ready_tx2).await })
        };
        let bound2 = ready_rx2.await.unwrap();
        assert_eq!(bound2.len(), 1);
        assert!(server.is_running());

        server.stop().await.unwrap();
        let _ = restart_task.await;
    }

    #[tokio::test]
    async fn multiple_frontends_bind_independently() {
        let backend_addr = spawn_stub_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nPONG").await;
        let rules = build_rules("GET /x").unwrap();
        let server = Arc::new(Server::new(
            Backend { addr: backend_addr, tls_ca: None, tls_cert: None, tls_key: None },
            Frontend {
                addrs: vec![
                    "tcp://127.0.0.1:0".to_string(),
                    "tcp://127.0.0.1:0".to_string(),
                    "tcp://127.0.0.1:0".to_string(),
                    "tcp://127.0.0.1:0".to_string(),
                ],
                tls_ca: None,
                tls_cert: None,
                tls_key: None,
            },
            rules,
        ));

        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let server_clone = server.clone();
        tokio::spawn(async move { server_clone.start(ready_tx).await });
        let bound = ready_rx.await.unwrap();
        assert_eq!(bound.len(), 4);

        let mut unique = std::collections::HashSet::new();
        for addr in &bound {
            unique.insert(addr.to_string());
        }
        assert_eq!(unique.len(), 4, "each frontend should get an independent port");

        server.stop().await.unwrap();
    }

    #[allow(dead_code)]
    fn _assert_handle_is_infallible(
        req: Request<Incoming>,
        client: Client<BackendConnector, Incoming>,
        rules: Arc<Vec<Rule>>,
        backend_target: Arc<BackendTarget>,
        cancel: CancellationToken,
        connections: ConnectionTracker,
    ) -> impl std::future::Future<Output = Result<Response<ProxyBody>, Infallible>> {
        handle(req, client, rules, backend_target, cancel, connections)
    }
}
