pub mod channels;
pub mod codec;
pub mod error;
pub mod hardware;
pub mod metrics;
pub mod packet;
pub mod pacing;
pub mod pipeline;
pub mod rebase;
pub mod ring;
pub mod session;
pub mod supervisor;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::metrics::{gather_metrics, MonitoringConfig, CLIENT_BANDWIDTH};
use crate::pipeline::PipelineState;
use crate::session::Chunk;
use crate::supervisor::ChannelRegistry;

/// Upper bound for one body chunk handed to the HTTP layer.
const CHUNK_BYTES: usize = 64 * 1024;
const JOIN_POLL: Duration = Duration::from_millis(100);

struct AppState {
    registry: Arc<ChannelRegistry>,
    monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
    pub viewers: usize,
    pub generation: u64,
    pub state: PipelineState,
    pub current_file: Option<String>,
    pub packets: u64,
}

struct GuardedStream {
    _connection: DropGuard,
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>,
    id: String,
    log_bandwidth: bool,
    last_log_time: Instant,
    bytes_since_last_log: usize,
}

impl Stream for GuardedStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let res = self.inner.as_mut().poll_next(cx);
        if let Poll::Ready(Some(Ok(ref bytes))) = res {
            self.bytes_since_last_log += bytes.len();
            let elapsed = self.last_log_time.elapsed();
            if elapsed >= Duration::from_secs(5) {
                let rate = self.bytes_since_last_log as f64 / elapsed.as_secs_f64();
                CLIENT_BANDWIDTH.with_label_values(&[self.id.as_str()]).set(rate);
                if self.log_bandwidth {
                    info!("Stream bandwidth: channel={} rate={:.2} KB/s", self.id, rate / 1024.0);
                }
                self.last_log_time = Instant::now();
                self.bytes_since_last_log = 0;
            }
        }
        res
    }
}

pub fn create_app(registry: Arc<ChannelRegistry>, monitoring: MonitoringConfig) -> Router {
    let state = Arc::new(AppState { registry, monitoring });

    Router::new()
        .route("/", get(index_handler))
        .route("/api/channels", get(channels_api_handler))
        .route("/metrics", get(metrics_handler))
        .route("/stream/{id}", get(stream_handler))
        .route("/{file}", get(ts_alias_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

fn not_found(message: &'static str) -> Response {
    Response::builder()
        .status(404)
        .body(Body::from(message))
        .unwrap()
}

async fn fallback_handler(method: Method, uri: Uri, headers: HeaderMap) -> impl IntoResponse {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>");
    info!("HTTP 404: method={} uri={} UA=\"{}\"", method, uri, user_agent);
    not_found("Not found")
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Html<String> {
    let mut html = String::from(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Loopcast Channels</title>
    <style>
        body { font-family: -apple-system, "Segoe UI", Roboto, Helvetica, Arial, sans-serif;
               margin: 0; padding: 20px; background: #0d0d0d; color: #fff; }
        h1 { text-align: center; }
        ul { list-style: none; max-width: 640px; margin: 0 auto; padding: 0; }
        li { background: #1a1a1a; margin: 8px 0; padding: 14px 18px; border-radius: 10px; }
        a { color: #fff; text-decoration: none; font-weight: 600; }
        .now { color: #a0a0a0; font-size: 0.9rem; }
    </style>
</head>
<body>
    <h1>Loopcast</h1>
    <ul>
"#,
    );

    for channel in state.registry.channels() {
        let status = channel.status();
        html.push_str(&format!(
            "        <li><a href=\"/stream/{}\">{}</a><div class=\"now\">{}</div></li>\n",
            channel.id(),
            escape_html(channel.name()),
            escape_html(status.current_file.as_deref().unwrap_or("")),
        ));
    }

    html.push_str("    </ul>\n</body>\n</html>\n");
    Html(html)
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

async fn channels_api_handler(State(state): State<Arc<AppState>>) -> Json<Vec<ChannelInfo>> {
    let channels = state
        .registry
        .channels()
        .iter()
        .map(|channel| {
            let status = channel.status();
            ChannelInfo {
                id: channel.id().to_string(),
                name: channel.name().to_string(),
                viewers: channel.viewers(),
                generation: channel.generation(),
                state: status.state,
                current_file: status.current_file,
                packets: channel.ring().latest_sequence_id(),
            }
        })
        .collect();
    Json(channels)
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    if !state.monitoring.enabled {
        return not_found("Metrics disabled");
    }
    Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(Body::from(gather_metrics()))
        .unwrap()
}

async fn ts_alias_handler(
    Path(file): Path<String>,
    state: State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    match file.strip_suffix(".ts") {
        Some(id) if !id.is_empty() => stream_handler(Path(id.to_string()), state, headers).await,
        _ => not_found("Not found"),
    }
}

async fn stream_handler(Path(id): Path<String>, State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let registry = &state.registry;
    let Some(channel) = registry.channel(&id) else {
        return not_found("Channel not found");
    };

    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>");
    info!("HTTP stream request: id={} name=\"{}\" UA=\"{}\"", id, channel.name(), user_agent);

    // A freshly started channel has no encoder layout until its first file is open.
    let attempts = (registry.streaming().join_wait().as_millis() / JOIN_POLL.as_millis()).max(1);
    for _ in 0..attempts {
        if channel.snapshot_encoder_params().is_some() || registry.is_shutting_down() {
            break;
        }
        tokio::time::sleep(JOIN_POLL).await;
    }

    let session = match registry.attach(&id) {
        Ok(session) => session,
        Err(SessionError::UnknownChannel(_)) => return not_found("Channel not found"),
        Err(SessionError::ShuttingDown) => {
            return Response::builder()
                .status(503)
                .header("Cache-Control", "no-store")
                .body(Body::from("Server is shutting down"))
                .unwrap();
        }
        Err(e @ SessionError::NotReady(_)) => {
            warn!("Stream not ready: id={} err={}", id, e);
            return Response::builder()
                .status(504)
                .body(Body::from("Timeout starting stream"))
                .unwrap();
        }
    };

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(8);
    let connection = CancellationToken::new();
    let closed = connection.clone();
    let channel_id = id.clone();
    tokio::task::spawn_blocking(move || {
        let mut session = session;
        while !closed.is_cancelled() {
            match session.next_chunk(CHUNK_BYTES) {
                Chunk::Data(bytes) => {
                    if tx.blocking_send(Ok(bytes)).is_err() {
                        break;
                    }
                }
                Chunk::Pending => {
                    if tx.is_closed() {
                        break;
                    }
                }
                Chunk::Closed => break,
            }
        }
        debug!(channel = %channel_id, emitted = session.emitted(), "stream session finished");
    });

    // The session thread stops once the body is dropped.
    let guarded_stream = GuardedStream {
        _connection: connection.drop_guard(),
        inner: Box::pin(ReceiverStream::new(rx)),
        id,
        log_bandwidth: state.monitoring.console_log_bandwidth,
        last_log_time: Instant::now(),
        bytes_since_last_log: 0,
    };

    Response::builder()
        .header("Content-Type", "video/mp2t")
        .header("Cache-Control", "no-store")
        .body(Body::from_stream(guarded_stream))
        .unwrap()
}
