//! Stream relay.
//!
//! Streamed task output never passes through the tracker's response path.
//! Instead the relay joins the two ends of a stream over HTTP:
//!
//! - `POST /stream/{id}` is the producer end and `GET /stream/{id}` the
//!   consumer end of a per-request slot. The slot is a bounded channel, so
//!   a slow consumer holds the producer back instead of losing data.
//! - `GET /stream?addr=unix:///path` pulls a stream a provider serves on a
//!   local socket and passes it through chunk by chunk.
//! - [`StreamRelay::forward`] drains a slot into a caller-supplied URL.
//!
//! A slot lives until both ends are claimed or the tracker releases it. A
//! slot whose consumer went away, or whose finished producer nobody
//! collected within the idle timeout, is reclaimed on the next access.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::get;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, Stream, StreamExt};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use skein_common::protocol::error::{Result, SkeinError};
use skein_common::protocol::{Hook, RequestId};
use skein_common::transport::post_stream;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Path the relay is mounted at on the external server
pub const RELAY_PATH: &str = "/stream";

/// Chunks a slot buffers before the producer has to wait
pub const SLOT_CAPACITY: usize = 8;

const READ_CHUNK: usize = 16 * 1024;

const URL_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// Rendezvous point for one request's stream.
struct Slot {
    tx: Option<mpsc::Sender<Bytes>>,
    rx: Option<mpsc::Receiver<Bytes>>,
    claimed_at: Instant,
}

impl Slot {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(SLOT_CAPACITY);
        Self {
            tx: Some(tx),
            rx: Some(rx),
            claimed_at: Instant::now(),
        }
    }

    fn is_abandoned(&self, now: Instant, idle_timeout: Duration) -> bool {
        match (&self.tx, &self.rx) {
            // consumer claimed and gone
            (Some(tx), None) => tx.is_closed(),
            // producer claimed, nobody came to read
            (None, Some(_)) => now.duration_since(self.claimed_at) >= idle_timeout,
            _ => false,
        }
    }
}

pub struct StreamRelay {
    base_url: RwLock<String>,
    slots: Mutex<HashMap<RequestId, Slot>>,
    idle_timeout: Duration,
}

impl StreamRelay {
    /// # Arguments
    /// * `base_url` - Externally reachable URL of the server the relay is mounted on
    /// * `idle_timeout` - How long a producer may wait on a full slot
    pub fn new(base_url: impl Into<String>, idle_timeout: Duration) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: RwLock::new(base_url.trim_end_matches('/').to_string()),
            slots: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    pub fn set_base_url(&self, url: &str) {
        let mut base = self.base_url.write().unwrap_or_else(|e| e.into_inner());
        *base = url.trim_end_matches('/').to_string();
    }

    /// URL of the relay itself, e.g. `http://10.0.0.1:8080/stream`.
    pub fn stream_base(&self) -> String {
        let base = self.base_url.read().unwrap_or_else(|e| e.into_inner());
        format!("{}{}", base, RELAY_PATH)
    }

    /// URL of the slot for request `id`.
    pub fn slot_url(&self, id: &str) -> String {
        format!("{}/{}", self.stream_base(), utf8_percent_encode(id, URL_COMPONENT))
    }

    /// URL that pulls the provider-local stream at `addr` through the relay.
    pub fn pull_url(&self, addr: &str) -> String {
        format!("{}?addr={}", self.stream_base(), utf8_percent_encode(addr, URL_COMPONENT))
    }

    /// Drops the slot for `id`, if any. Returns whether one existed.
    pub fn release(&self, id: &str) -> bool {
        self.slots().remove(id).is_some()
    }

    pub fn open_slots(&self) -> usize {
        let mut slots = self.slots();
        self.reclaim(&mut slots);
        slots.len()
    }

    /// Claims the consumer end of the slot for `id`.
    pub fn subscribe(&self, id: &str) -> Result<mpsc::Receiver<Bytes>> {
        let mut slots = self.slots();
        self.reclaim(&mut slots);
        let slot = slots.entry(id.to_string()).or_insert_with(Slot::new);
        let rx = slot.rx.take().ok_or_else(|| SkeinError::TrackingConflict(id.to_string()))?;
        slot.claimed_at = Instant::now();
        if slot.tx.is_none() {
            slots.remove(id);
        }
        Ok(rx)
    }

    fn take_sender(&self, id: &str) -> Result<mpsc::Sender<Bytes>> {
        let mut slots = self.slots();
        self.reclaim(&mut slots);
        let slot = slots.entry(id.to_string()).or_insert_with(Slot::new);
        let tx = slot.tx.take().ok_or_else(|| SkeinError::TrackingConflict(id.to_string()))?;
        slot.claimed_at = Instant::now();
        if slot.rx.is_none() {
            slots.remove(id);
        }
        Ok(tx)
    }

    fn reclaim(&self, slots: &mut HashMap<RequestId, Slot>) {
        let now = Instant::now();
        let before = slots.len();
        slots.retain(|_, slot| !slot.is_abandoned(now, self.idle_timeout));
        let reclaimed = before - slots.len();
        if reclaimed > 0 {
            debug!("Reclaimed {} abandoned stream slot(s)", reclaimed);
        }
    }

    /// Feeds `body` into the slot for `id` and returns the bytes relayed.
    ///
    /// Each chunk waits at most the idle timeout for room in the slot; when
    /// that runs out the slot is released and the push fails.
    pub async fn push<S, E>(&self, id: &str, body: S) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let tx = self.take_sender(id)?;
        let mut body = std::pin::pin!(body);
        let mut total = 0u64;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| SkeinError::Transport(format!("Stream producer failed: {}", e)))?;
            if chunk.is_empty() {
                continue;
            }
            let len = chunk.len() as u64;
            match tx.send_timeout(chunk, self.idle_timeout).await {
                Ok(()) => total += len,
                Err(SendTimeoutError::Timeout(_)) => {
                    self.release(id);
                    warn!("Stream {} stalled for {:?}, aborting producer", id, self.idle_timeout);
                    return Err(SkeinError::Timeout(self.idle_timeout.as_millis() as u64));
                }
                Err(SendTimeoutError::Closed(_)) => {
                    return Err(SkeinError::Transport(format!("Consumer of stream {} went away", id)));
                }
            }
        }

        debug!("Stream {} producer finished after {} bytes", id, total);
        Ok(total)
    }

    /// Opens a provider-local stream socket and returns its bytes as a stream.
    pub async fn pull(&self, addr: &str) -> Result<impl Stream<Item = std::io::Result<Bytes>> + Send + 'static> {
        let path = match Hook::parse(addr)? {
            Hook::Unix(path) => path,
            Hook::Http(_) => {
                return Err(SkeinError::MalformedRequest(format!("not a local stream address: {}", addr)));
            }
        };

        let socket = tokio::time::timeout(self.idle_timeout, UnixStream::connect(&path))
            .await
            .map_err(|_| SkeinError::Timeout(self.idle_timeout.as_millis() as u64))?
            .map_err(|e| SkeinError::Transport(format!("Failed to connect to {}: {}", path.display(), e)))?;

        Ok(stream::unfold(Some(socket), |state| async move {
            let mut socket = state?;
            let mut buf = BytesMut::with_capacity(READ_CHUNK);
            match socket.read_buf(&mut buf).await {
                Ok(0) => None,
                Ok(_) => Some((Ok(buf.freeze()), Some(socket))),
                Err(e) => Some((Err(e), None)),
            }
        }))
    }

    /// Drains the slot for `id` into `target` (an `http://` URL receiving a
    /// streamed POST, or a `unix://` socket receiving raw bytes).
    ///
    /// Waits up to the idle timeout for the producer to start.
    pub async fn forward(&self, id: &str, target: &str) -> Result<()> {
        let rx = self.subscribe(id)?;
        self.forward_from(id, rx, target, self.idle_timeout).await
    }

    /// Drains an already claimed consumer end into `target`.
    ///
    /// Nothing is sent to `target` until the first chunk arrives, which may
    /// take up to `first_chunk_wait`. After that the stream ends once the
    /// producer finishes or stays silent for the idle timeout. A producer
    /// that goes away without sending anything is not an error.
    pub async fn forward_from(
        &self,
        id: &str,
        mut rx: mpsc::Receiver<Bytes>,
        target: &str,
        first_chunk_wait: Duration,
    ) -> Result<()> {
        let hook = Hook::parse(target)?;

        let first = match tokio::time::timeout(first_chunk_wait, rx.recv()).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                debug!("Stream {} closed before producing data", id);
                return Ok(());
            }
            Err(_) => return Err(SkeinError::Timeout(first_chunk_wait.as_millis() as u64)),
        };
        info!("Forwarding stream {} to {}", id, target);

        let chunks = stream::once(async move { first }).chain(idle_bounded(id.to_string(), rx, self.idle_timeout));
        match hook {
            Hook::Unix(path) => {
                let mut socket = UnixStream::connect(&path)
                    .await
                    .map_err(|e| SkeinError::Transport(format!("Failed to connect to {}: {}", path.display(), e)))?;
                let mut chunks = std::pin::pin!(chunks);
                while let Some(chunk) = chunks.next().await {
                    socket.write_all(&chunk).await?;
                }
                socket.shutdown().await?;
            }
            Hook::Http(url) => {
                post_stream(&url, chunks).await?;
            }
        }

        debug!("Stream {} forwarded", id);
        Ok(())
    }

    /// HTTP routes for the relay, to be merged into the external server.
    pub fn router(self: Arc<Self>) -> axum::Router {
        axum::Router::new()
            .route(RELAY_PATH, get(pull_handler))
            .route(&format!("{}/{{id}}", RELAY_PATH), get(consume_handler).post(push_handler))
            .with_state(self)
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<RequestId, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Deserialize)]
struct PullParams {
    addr: String,
}

async fn pull_handler(State(relay): State<Arc<StreamRelay>>, Query(params): Query<PullParams>) -> HttpResponse {
    match relay.pull(&params.addr).await {
        Ok(stream) => Body::from_stream(stream).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn consume_handler(State(relay): State<Arc<StreamRelay>>, Path(id): Path<String>) -> HttpResponse {
    match relay.subscribe(&id) {
        Ok(rx) => {
            let chunks = idle_bounded(id, rx, relay.idle_timeout);
            Body::from_stream(chunks.map(Ok::<_, Infallible>)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn push_handler(State(relay): State<Arc<StreamRelay>>, Path(id): Path<String>, body: Body) -> HttpResponse {
    match relay.push(&id, body.into_data_stream()).await {
        Ok(total) => (StatusCode::OK, total.to_string()).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Yields chunks from `rx` until the producer finishes or stays silent for
/// `idle_timeout`.
fn idle_bounded(
    id: String,
    rx: mpsc::Receiver<Bytes>,
    idle_timeout: Duration,
) -> impl Stream<Item = Bytes> + Send + 'static {
    stream::unfold((id, rx), move |(id, mut rx)| async move {
        match tokio::time::timeout(idle_timeout, rx.recv()).await {
            Ok(Some(chunk)) => Some((chunk, (id, rx))),
            Ok(None) => None,
            Err(_) => {
                warn!("Stream {} idle for {:?}, closing consumer", id, idle_timeout);
                None
            }
        }
    })
}

fn error_response(err: &SkeinError) -> HttpResponse {
    let status = match err {
        SkeinError::TrackingConflict(_) => StatusCode::CONFLICT,
        SkeinError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        SkeinError::MalformedRequest(_) | SkeinError::InvalidHook(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, err.to_string()).into_response()
}
