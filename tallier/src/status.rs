//! The status and debug surface.
//!
//! A small HTTP server rendering the tracked string frequencies: `/` for
//! liveness, `/strings/` for the tracked keys, `/strings/<key>` for one
//! key's table, and the same pages as JSON under `/json/strings/`. The
//! server never touches live accumulators: the flush loop publishes an
//! immutable [`StringsView`] after each flush and requests read whichever
//! view is current.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::snapshot::Snapshot;

/// How many strings each key's page shows.
pub const STRINGS_PAGE_LIMIT: usize = 1024;

/// How many status connections may be served at once.
const CONCURRENT_REQUESTS_MAX: usize = 100;

/// Errors produced by [`Status`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`std::io::Error`].
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// One string's standing within a key's table.
#[derive(Debug, Clone, Serialize)]
pub struct StringView {
    pub value: String,
    /// Longest-window total.
    pub total: f64,
    /// Per-minute rate over each configured window, shortest first.
    pub per_minute: Vec<f64>,
}

/// One tracked key's table.
#[derive(Debug, Clone, Serialize)]
pub struct KeyView {
    pub total_observed: f64,
    pub strings: Vec<StringView>,
}

/// A read-only rendering of a snapshot's string frequencies.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StringsView {
    /// When this view was published, unix seconds.
    pub generated: u64,
    /// The configured rolling windows, in seconds.
    pub interval_seconds: Vec<u64>,
    pub keys: BTreeMap<String, KeyView>,
}

impl StringsView {
    /// Capture the snapshot's string frequencies, keeping at most `limit`
    /// strings per key.
    #[must_use]
    pub fn build(snapshot: &Snapshot, limit: usize) -> Self {
        let minute = Duration::from_secs(60);
        let mut keys = BTreeMap::new();
        for (key, frequencies) in snapshot.string_counts() {
            let strings = frequencies
                .sorted_items()
                .into_iter()
                .take(limit)
                .map(|(value, counter)| StringView {
                    value: value.to_owned(),
                    total: counter.total(),
                    per_minute: counter
                        .levels()
                        .iter()
                        .skip(1)
                        .map(|level| level.rate_per(minute))
                        .collect(),
                })
                .collect();
            keys.insert(
                key.clone(),
                KeyView {
                    total_observed: frequencies.total_observed(),
                    strings,
                },
            );
        }
        Self {
            generated: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            interval_seconds: snapshot
                .string_count_intervals()
                .iter()
                .map(Duration::as_secs)
                .collect(),
            keys,
        }
    }
}

/// The status server.
#[derive(Debug)]
pub struct Status {
    addr: SocketAddr,
    view: watch::Receiver<Arc<StringsView>>,
    shutdown: watch::Receiver<()>,
}

impl Status {
    #[must_use]
    pub fn new(
        addr: SocketAddr,
        view: watch::Receiver<Arc<StringsView>>,
        shutdown: watch::Receiver<()>,
    ) -> Self {
        Self {
            addr,
            view,
            shutdown,
        }
    }

    /// Serve status requests until a shutdown signal is received, then
    /// drain the connections still in flight.
    ///
    /// # Errors
    ///
    /// Returns an error when the listener cannot be bound.
    pub async fn run(mut self) -> Result<(), Error> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        let sem = Arc::new(Semaphore::new(CONCURRENT_REQUESTS_MAX));
        let mut join_set = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    info!("shutdown signal received");
                    break;
                }
                incoming = listener.accept() => {
                    let (stream, addr) = match incoming {
                        Ok(incoming) => incoming,
                        Err(err) => {
                            error!("status accept error: {err}");
                            continue;
                        }
                    };
                    let view = self.view.clone();
                    let sem = Arc::clone(&sem);
                    join_set.spawn(async move {
                        debug!("accepted status connection from {addr}");
                        let permit = match sem.acquire_owned().await {
                            Ok(permit) => permit,
                            Err(err) => {
                                error!("semaphore closed: {err}");
                                return;
                            }
                        };
                        let builder = auto::Builder::new(TokioExecutor::new());
                        let serve_future = builder.serve_connection(
                            TokioIo::new(stream),
                            service_fn(move |req| {
                                let view = Arc::clone(&view.borrow());
                                async move { respond(&req, &view) }
                            }),
                        );
                        if let Err(err) = serve_future.await {
                            error!("error serving status request: {err}");
                        }
                        drop(permit);
                    });
                }
            }
        }

        drop(listener);
        while join_set.join_next().await.is_some() {}
        Ok(())
    }
}

fn respond<B>(req: &Request<B>, view: &StringsView) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::GET {
        return Ok(empty_response(StatusCode::METHOD_NOT_ALLOWED));
    }
    let path = req.uri().path();
    let response = match path {
        "/" => text_response("ok!\n".to_owned()),
        "/strings" | "/strings/" => {
            let mut page = String::new();
            for key in view.keys.keys() {
                page.push_str(key);
                page.push('\n');
            }
            text_response(page)
        }
        "/json/strings" | "/json/strings/" => json_response(view),
        _ => {
            if let Some(key) = path.strip_prefix("/json/strings/") {
                match view.keys.get(key) {
                    Some(table) => json_response(table),
                    None => empty_response(StatusCode::NOT_FOUND),
                }
            } else if let Some(key) = path.strip_prefix("/strings/") {
                match view.keys.get(key) {
                    Some(table) => text_response(render_key(key, table)),
                    None => empty_response(StatusCode::NOT_FOUND),
                }
            } else {
                empty_response(StatusCode::NOT_FOUND)
            }
        }
    };
    Ok(response)
}

fn render_key(key: &str, table: &KeyView) -> String {
    let mut page = format!("{key}: {:.1} observed\n", table.total_observed);
    for string in &table.strings {
        let rates = string
            .per_minute
            .iter()
            .map(|rate| format!("{rate:10.2}"))
            .collect::<Vec<_>>()
            .join(" ");
        page.push_str(&format!("{:12.1} {rates}  {}\n", string.total, string.value));
    }
    page
}

fn text_response(body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn json_response<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(encoded) => {
            let mut response = Response::new(Full::new(Bytes::from(encoded)));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(err) => {
            error!("failed to encode status page: {err}");
            empty_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}
