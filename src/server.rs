//! HTTP transport adapter.
//!
//! Every request, whatever its method or path, goes to the engine. The
//! adapter only converts between axum types and engine descriptors.
//! Connections are served without an automatic `Date` header so captured
//! responses compare equal.

use crate::context::RequestDescriptor;
use crate::engine::{Engine, StubResponse};
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HttpConnectionBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Largest request body read; larger bodies are replaced by an empty one.
pub const MAX_REQUEST_BODY: usize = 64 * 1024 * 1024;

/// How long open connections may finish after shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Build the router serving every path through `engine`.
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .fallback(handle)
        .with_state(engine)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
}

/// Accept connections on `listener` until `shutdown` resolves, then let
/// open connections finish.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()>,
) -> std::io::Result<()> {
    let mut builder = HttpConnectionBuilder::new(TokioExecutor::new());
    builder.http1().auto_date_header(false);
    let graceful = GracefulShutdown::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                let service = TowerToHyperService::new(router.clone());
                let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
                let conn = graceful.watch(conn.into_owned());
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(error = %e, remote = %remote_addr, "Connection closed with error");
                    }
                });
            }
            _ = &mut shutdown => break,
        }
    }

    drop(listener);
    tokio::select! {
        _ = graceful.shutdown() => info!("All connections closed"),
        _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
            warn!(grace = ?SHUTDOWN_GRACE, "Connections still open after shutdown grace period");
        }
    }
    Ok(())
}

async fn handle(State(engine): State<Arc<Engine>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, uri = %parts.uri, "Failed to read request body");
            Bytes::new()
        }
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut descriptor = RequestDescriptor::new(parts.method.as_str(), path_and_query);
    for (name, value) in &parts.headers {
        descriptor.add_header(name.as_str(), &String::from_utf8_lossy(value.as_bytes()));
    }
    let descriptor = descriptor.with_body(body);

    match engine.resolve(descriptor).await {
        Ok(pending) => into_http(pending.deliver().await),
        Err(e) => {
            error!(error = %e, uri = %parts.uri, "Failed to resolve request");
            internal_error(&e.to_string())
        }
    }
}

/// Convert an engine response into an HTTP response.
pub fn into_http(response: StubResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(response.content_type()),
    );
    for (name, value) in &response.headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "Dropping invalid response header"),
        }
    }

    (status, headers, Body::from(response.content.to_bytes())).into_response()
}

fn internal_error(message: &str) -> Response {
    let body = serde_json::json!({
        "error": "internal_error",
        "message": message,
    });
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        body.to_string(),
    )
        .into_response()
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let message = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = %message, "Request handler panicked");
    internal_error(message)
}
