//! Forwarding engine: round-trips an allowed request to the backend and
//! splices its response back, switching into full-duplex byte-pumping for
//! protocol upgrades and the daemon's stream content types.

use std::sync::Arc;

use http::{HeaderMap, Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioIo;
use tokio_util::sync::CancellationToken;

use crate::connector::BackendConnector;
use crate::error::ForwardError;
use crate::server::ConnectionTracker;

const CONTENT_TYPE_RAW_STREAM: &str = "application/vnd.docker.raw-stream";
const CONTENT_TYPE_MULTIPLEXED_STREAM: &str = "application/vnd.docker.multiplexed-stream";

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Everything the forwarding engine needs to know about the backend to
/// rewrite an inbound request into an outbound one.
#[derive(Clone)]
pub struct BackendTarget {
    pub scheme: &'static str,
    pub host: String,
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// `Incoming` already implements `http_body::Body` frame-by-frame, so
/// boxing it is enough to re-emit the backend's response without buffering
/// it — the same path serves normal responses and the daemon's long-lived
/// stream responses.
fn incoming_to_streamed_body(incoming: Incoming) -> ProxyBody {
    incoming.boxed()
}

/// Rewrites the inbound request's scheme/authority per the backend
/// invariants (https iff backend TLS, `localhost` host for unix backends)
/// and hands the rest through unchanged. The backend connector ignores the
/// URI's host/port anyway, but the scheme still selects plaintext vs TLS at
/// the transport layer and the rewritten `Host` header is what the daemon
/// actually sees.
pub fn rewrite_request<B>(mut req: Request<B>, backend: &BackendTarget) -> Result<Request<B>, ForwardError> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let uri = Uri::builder()
        .scheme(backend.scheme)
        .authority(backend.host.as_str())
        .path_and_query(path_and_query)
        .build()?;

    *req.uri_mut() = uri;
    req.headers_mut().insert(
        http::header::HOST,
        http::HeaderValue::from_str(&backend.host).unwrap_or(http::HeaderValue::from_static("")),
    );

    Ok(req)
}

fn copy_headers(headers: &HeaderMap) -> HeaderMap {
    // `HeaderMap` iteration yields every value for a repeated name in
    // insertion order, so this preserves per-name multi-value ordering.
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        out.append(name.clone(), value.clone());
    }
    out
}

fn is_client_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
    )
}

/// Forwards one already-allowed request to the backend and returns the
/// response to hand back to the frontend connection. For upgraded
/// connections, spawns the bidirectional pump and returns a response whose
/// body is empty (the 101 response itself still carries the right headers;
/// the actual byte stream happens out of band via `hyper::upgrade`).
pub async fn forward(
    mut req: Request<Incoming>,
    client: &Client<BackendConnector, Incoming>,
    backend: &BackendTarget,
    cancel: &CancellationToken,
    connections: &ConnectionTracker,
) -> Result<Response<ProxyBody>, ForwardError> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    // Must be requested before the request is sent: hyper only lets you
    // observe the upgrade on a request/response that asked for one.
    let wants_upgrade = req
        .headers()
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let client_upgrade = wants_upgrade.then(|| hyper::upgrade::on(&mut req));

    let req = rewrite_request(req, backend)?;

    let mut response = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::debug!(%method, %path, "backend round-trip cancelled by shutdown");
            return Err(ForwardError::Cancelled);
        }
        result = client.request(req) => match result {
            Ok(response) => response,
            Err(err) => {
                if err.is_connect() {
                    tracing::debug!(%method, %path, "backend connection refused");
                } else {
                    tracing::error!(%method, %path, error = %err, "backend round-trip failed");
                }
                return Err(ForwardError::BadGateway(err));
            }
        },
    };

    let content_type = response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let is_stream_content_type =
        content_type == CONTENT_TYPE_RAW_STREAM || content_type == CONTENT_TYPE_MULTIPLEXED_STREAM;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        tracing::debug!(%method, %path, "connection upgrade");

        let backend_upgrade = hyper::upgrade::on(&mut response);
        let Some(client_upgrade) = client_upgrade else {
            tracing::error!(%method, %path, "body is not writable: frontend never requested an upgrade");
            return Err(ForwardError::NotUpgradable);
        };

        let headers = copy_headers(response.headers());
        let status = response.status();

        connections.track(async move {
            match tokio::try_join!(client_upgrade, backend_upgrade) {
                Ok((client_conn, backend_conn)) => {
                    let mut client_io = TokioIo::new(client_conn);
                    let mut backend_io = TokioIo::new(backend_conn);
                    if let Err(err) =
                        tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await
                    {
                        if !is_client_disconnect(&err) {
                            tracing::error!(error = %err, "upgraded connection pump failed");
                        }
                    }
                }
                Err(err) => tracing::error!(error = %err, "failed to obtain upgraded connections"),
            }
        });

        let mut builder = Response::builder().status(status);
        *builder.headers_mut().unwrap() = headers;
        return Ok(builder.body(empty_body())?);
    }

    let status = response.status();
    let headers = copy_headers(response.headers());
    let mut builder = Response::builder().status(status);
    *builder.headers_mut().unwrap() = headers;

    if status.as_u16() >= 200 && status != StatusCode::NO_CONTENT && status != StatusCode::NOT_MODIFIED {
        if is_stream_content_type {
            tracing::debug!(%method, %path, "streaming response");
        }
        let body = incoming_to_streamed_body(response.into_body());
        Ok(builder.body(body)?)
    } else {
        Ok(builder.body(empty_body())?)
    }
}

pub fn bad_gateway() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(empty_body())
        .expect("building a fixed bad-gateway response never fails")
}

pub fn internal_error() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(empty_body())
        .expect("building a fixed internal-error response never fails")
}

pub fn forbidden() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::FORBIDDEN)
        .body(empty_body())
        .expect("building a fixed forbidden response never fails")
}

/// Wraps `Arc` so the backend target can be shared across connection tasks
/// without recomputing the scheme/host rewrite per request.
pub type SharedBackendTarget = Arc<BackendTarget>;
