//! Shared fixtures for the media cache tests.
//!
//! Tests start with [`setup`], which routes log output of the cache crates into the test
//! runner's captured output. Directories from [`tempdir`] and a [`Server`] must be kept alive
//! for as long as the cache may touch them: the cache recreates a vanished work directory, and
//! a dropped server stops answering.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{OriginalUri, Path, Request};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use reqwest::Url;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

pub use tempfile::TempDir;

/// Installs a test-writer subscriber for the cache crates. Safe to call repeatedly.
pub fn setup() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("mediacache_service=trace,mediacache=trace"))
        .with_target(false)
        .with_test_writer()
        .try_init()
        .ok();
}

/// A fresh directory that is removed once the handle drops.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Contents served for `/media/<name>`: 128 numbered frames.
pub fn media_body(name: &str) -> String {
    (0..128).map(|frame| format!("{name} frame {frame:03}\n")).collect()
}

/// Requests per path.
type Hits = Arc<Mutex<BTreeMap<String, usize>>>;

/// An HTTP media server on an ephemeral local port.
///
/// | route | response |
/// |---|---|
/// | `/media/*path` | [`media_body`] of `path` |
/// | `/delay/:time/*path` | after sleeping for `time` (e.g. `200ms`), a redirect to `/path` |
/// | `/respond_statuscode/:num/*tail` | an empty response with status `num` |
/// | `/user_agent` | the request's `User-Agent` |
///
/// Every request is counted, see [`accesses`](Self::accesses). Needs to be created inside a
/// `tokio` runtime.
#[derive(Debug)]
pub struct Server {
    socket: SocketAddr,
    hits: Hits,
    task: JoinHandle<()>,
}

impl Server {
    pub fn new() -> Self {
        let hits = Hits::default();

        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let app = router(Arc::clone(&hits));
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { socket, hits, task }
    }

    /// An absolute URL on this server.
    pub fn url(&self, path: &str) -> Url {
        let url = format!("http://{}/{}", self.socket, path.trim_start_matches('/'));
        url.parse().unwrap()
    }

    /// Total number of requests since the previous call.
    pub fn accesses(&self) -> usize {
        self.take_hits().into_values().sum()
    }

    /// Number of requests per path since the previous call, sorted by path.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        self.take_hits().into_iter().collect()
    }

    fn take_hits(&self) -> BTreeMap<String, usize> {
        std::mem::take(&mut *self.hits.lock().unwrap())
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn router(hits: Hits) -> Router {
    let count_hits = move |OriginalUri(uri): OriginalUri, request: Request, next: Next| {
        let hits = Arc::clone(&hits);
        async move {
            *hits.lock().unwrap().entry(uri.path().to_owned()).or_default() += 1;
            next.run(request).await
        }
    };

    Router::new()
        .route("/media/*path", get(media))
        .route("/delay/:time/*path", get(delay))
        .route("/respond_statuscode/:num/*tail", get(status))
        .route("/user_agent", get(user_agent))
        .layer(middleware::from_fn(count_hits))
}

async fn media(Path(path): Path<String>) -> String {
    media_body(path.trim_start_matches('/'))
}

async fn delay(Path((time, path)): Path<(String, String)>) -> Response {
    let duration: Duration = humantime::parse_duration(&time).unwrap();
    tokio::time::sleep(duration).await;

    let location = format!("/{}", path.trim_start_matches('/'));
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

async fn status(Path((num, _)): Path<(u16, String)>) -> StatusCode {
    StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn user_agent(headers: HeaderMap) -> String {
    headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}
