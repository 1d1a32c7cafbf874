//! HTTP exposition endpoint.
//!
//! `GET /metrics` runs one scrape and appends the endpoint's own request and
//! response counters; `GET /` answers with a pointer to `/metrics`. Any
//! other method gets `400 Invalid HTTP Method`, any other path
//! `400 Bad Request`. Every response sent is counted. Scrapes are serialised
//! through a mutex around the session and run on the blocking pool, since
//! driver calls block.

use crate::buffer::MetricBuffer;
use crate::error::{ExporterError, Result};
use crate::exposition::{desc, Section};
use crate::query::GpuBackend;
use crate::scrape::Session;
use axum::extract::State;
use axum::http::{header, Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";
const HINT_PAGE: &str = "<html><body>See <a href='/metrics'>/metrics</a>.</body></html>\n";
const INVALID_METHOD: &str = "Invalid HTTP Method\n";
const BAD_REQUEST: &str = "Bad Request\n";

/// Which URL a request was counted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestUrl {
    /// `/`
    Root,
    /// `/metrics`
    Metrics,
    /// Anything rejected.
    Other,
}

/// Request and response totals of the endpoint.
#[derive(Debug, Default)]
pub struct HttpCounters {
    root: AtomicU64,
    metrics: AtomicU64,
    other: AtomicU64,
    responses: AtomicU64,
    bytes: AtomicU64,
}

/// Point-in-time copy of [`HttpCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    /// Requests to `/`.
    pub root: u64,
    /// Requests to `/metrics`.
    pub metrics: u64,
    /// Rejected requests.
    pub other: u64,
    /// Responses sent.
    pub responses: u64,
    /// Body bytes of all responses sent.
    pub bytes: u64,
}

impl HttpCounters {
    /// Counts one request.
    pub fn record_request(&self, url: RequestUrl) {
        let counter = match url {
            RequestUrl::Root => &self.root,
            RequestUrl::Metrics => &self.metrics,
            RequestUrl::Other => &self.other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one response with a body of `bytes` bytes.
    pub fn record_response(&self, bytes: usize) {
        self.responses.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Current totals.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            root: self.root.load(Ordering::Relaxed),
            metrics: self.metrics.load(Ordering::Relaxed),
            other: self.other.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

impl CounterSnapshot {
    /// Appends `nvmex_request_total` and `nvmex_response_total`.
    pub fn write(&self, out: &mut MetricBuffer, compact: bool) {
        let mut requests = Section::new(desc::REQUEST_TOTAL);
        requests.sample(&[("url", &"/")], self.root);
        requests.sample(&[("url", &"/metrics")], self.metrics);
        requests.sample(&[("url", &"other")], self.other);
        requests.flush(out, compact);

        let mut responses = Section::new(desc::RESPONSE_TOTAL);
        responses.sample(&[("type", &"count")], self.responses);
        responses.sample(&[("type", &"bytes")], self.bytes);
        responses.flush(out, compact);
    }
}

/// Shared state of the handlers.
pub struct AppState<B: GpuBackend> {
    session: Arc<Mutex<Session<B>>>,
    counters: Arc<HttpCounters>,
}

impl<B: GpuBackend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self { session: Arc::clone(&self.session), counters: Arc::clone(&self.counters) }
    }
}

impl<B: GpuBackend> std::fmt::Debug for AppState<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").field("counters", &self.counters.snapshot()).finish_non_exhaustive()
    }
}

impl<B: GpuBackend + 'static> AppState<B> {
    /// Wraps a session for serving.
    pub fn new(session: Session<B>) -> Self {
        Self { session: Arc::new(Mutex::new(session)), counters: Arc::default() }
    }

    /// The endpoint counters.
    pub fn counters(&self) -> &HttpCounters {
        &self.counters
    }

    /// Tears the session down; later scrapes return an empty exposition.
    pub fn teardown(&self) {
        self.session.lock().unwrap_or_else(PoisonError::into_inner).teardown();
    }
}

/// Resolves the listen address; no `source` means all interfaces.
///
/// # Errors
///
/// Returns [`ExporterError::ConfigInvalid`] if `source` is not an IP address.
pub fn bind_addr(source: Option<&str>, port: u16) -> Result<SocketAddr> {
    let ip = match source {
        Some(s) => s.parse::<IpAddr>().map_err(|e| ExporterError::ConfigInvalid {
            key: "source".to_string(),
            message: format!("'{s}': {e}"),
        })?,
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    Ok(SocketAddr::new(ip, port))
}

/// Builds the routes.
pub fn router<B: GpuBackend + 'static>(state: AppState<B>) -> Router {
    Router::new()
        .route("/", get(root::<B>).fallback(wrong_method::<B>))
        .route("/metrics", get(metrics::<B>).fallback(wrong_method::<B>))
        .fallback(unknown::<B>)
        .with_state(state)
}

async fn root<B: GpuBackend + 'static>(State(state): State<AppState<B>>) -> Html<&'static str> {
    state.counters.record_request(RequestUrl::Root);
    state.counters.record_response(HINT_PAGE.len());
    Html(HINT_PAGE)
}

async fn metrics<B: GpuBackend + 'static>(State(state): State<AppState<B>>) -> Response {
    let before = state.counters.snapshot();
    state.counters.record_request(RequestUrl::Metrics);

    let session = Arc::clone(&state.session);
    let scraped = tokio::task::spawn_blocking(move || {
        let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
        session.scrape_with(|out, compact| before.write(out, compact))
    })
    .await;

    match scraped {
        Ok(body) => {
            state.counters.record_response(body.len());
            ([(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response()
        }
        Err(e) => {
            error!(error = %e, "scrape task failed");
            let body = "Internal Server Error\n";
            state.counters.record_response(body.len());
            (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
        }
    }
}

/// Rejects with 400 and counts the request as `other`.
fn reject(counters: &HttpCounters, body: &'static str) -> Response {
    counters.record_request(RequestUrl::Other);
    counters.record_response(body.len());
    (StatusCode::BAD_REQUEST, body).into_response()
}

async fn wrong_method<B: GpuBackend + 'static>(State(state): State<AppState<B>>) -> Response {
    reject(&state.counters, INVALID_METHOD)
}

async fn unknown<B: GpuBackend + 'static>(State(state): State<AppState<B>>, method: Method) -> Response {
    if method == Method::GET {
        reject(&state.counters, BAD_REQUEST)
    } else {
        reject(&state.counters, INVALID_METHOD)
    }
}

/// Serves on `listener` until `shutdown` resolves, then tears the session down.
///
/// # Errors
///
/// Returns [`ExporterError::Server`] if the server fails.
pub async fn serve_on<B: GpuBackend + 'static>(
    listener: TcpListener,
    state: AppState<B>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(state.clone());
    let served = axum::serve(listener, app).with_graceful_shutdown(shutdown).await;
    state.teardown();
    served.map_err(|e| ExporterError::Server(e.to_string()))
}

/// Binds `addr` and serves `session` until Ctrl-C.
///
/// # Errors
///
/// Returns [`ExporterError::Io`] if the address cannot be bound and
/// [`ExporterError::Server`] if serving fails.
pub async fn run<B: GpuBackend + 'static>(session: Session<B>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "serving metrics on http://{addr}/metrics");
    serve_on(listener, AppState::new(session), shutdown_signal()).await
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(e) => warn!(error = %e, "cannot listen for Ctrl-C, serving until killed"),
    }
}
