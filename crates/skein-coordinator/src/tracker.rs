//! Correlation tracker.
//!
//! Before a request is handed to a provider its response destination is
//! replaced with the coordinator's own response socket, and an entry keyed
//! by the request id remembers where the response really has to go. When
//! the provider's response arrives the entry is removed and the response is
//! delivered to the original destination. Entries that outlive their
//! deadline are reclaimed by a sweeper which delivers a timeout error
//! instead.
//!
//! Removal from the entry map is the single point of truth for "this
//! request has been answered": whichever of resolve, sweep or cancel removes
//! the entry first wins, and every other path sees nothing to do. This is
//! what makes delivery happen at most once per request id.

use async_trait::async_trait;
use futures_util::future::join_all;
use skein_common::protocol::error::{Result, SkeinError};
use skein_common::protocol::{Hook, Request, RequestId, Response};
use skein_common::transport::{HookDelivery, UnixServer, UnixServerHandle};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::relay::StreamRelay;

/// Final destination of resolved responses.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn deliver(&self, hook: &str, response: &Response) -> Result<()>;
}

/// Delivers to `unix://` hooks over the framed transport and to `http://`
/// hooks with a JSON POST.
pub struct HookSink {
    delivery: HookDelivery,
}

impl HookSink {
    pub fn new(timeout: Duration) -> Self {
        Self {
            delivery: HookDelivery::new(timeout),
        }
    }
}

#[async_trait]
impl ResponseSink for HookSink {
    async fn deliver(&self, hook: &str, response: &Response) -> Result<()> {
        self.delivery.deliver(hook, response).await
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Socket providers deliver responses to
    pub response_socket: PathBuf,
    pub sweep_interval: Duration,
}

struct Entry {
    original_response_hook: Option<String>,
    original_stream_url: Option<String>,
    timeout: Duration,
    deadline: Instant,
    /// Drains the relay slot into `original_stream_url`
    forwarder: Option<AbortHandle>,
}

impl Entry {
    /// Tears down stream forwarding for a request that will not complete.
    fn abandon(&self, relay: &StreamRelay, id: &str) {
        if let Some(forwarder) = &self.forwarder {
            forwarder.abort();
            relay.release(id);
        }
    }
}

struct Running {
    server: UnixServerHandle,
    sweeper: JoinHandle<()>,
    shutdown_tx: oneshot::Sender<()>,
}

pub struct Tracker {
    config: TrackerConfig,
    entries: Mutex<HashMap<RequestId, Entry>>,
    sink: Arc<dyn ResponseSink>,
    relay: Arc<StreamRelay>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl Tracker {
    pub fn new(config: TrackerConfig, sink: Arc<dyn ResponseSink>, relay: Arc<StreamRelay>) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            sink,
            relay,
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// The `unix://` hook providers are told to answer on.
    pub fn response_hook(&self) -> String {
        Hook::unix_url(&self.config.response_socket)
    }

    /// Starts tracking `request` and returns the copy to send to a provider.
    ///
    /// The copy's response hook points at this tracker and, if the caller
    /// asked for a pushed stream, its stream URL points at the relay slot
    /// for this request. Forwarding from that slot to the caller's URL starts
    /// right away, so a provider may push before it responds.
    pub fn track(&self, request: Request, timeout: Duration) -> Result<Request> {
        if request.id.is_empty() {
            return Err(SkeinError::MissingField("id"));
        }

        let mut rewritten = request;
        let mut entry = Entry {
            original_response_hook: rewritten.response_hook.take(),
            original_stream_url: rewritten.stream_url.take(),
            timeout,
            deadline: Instant::now() + timeout,
            forwarder: None,
        };
        rewritten.response_hook = Some(self.response_hook());

        let mut entries = self.entries();
        if entries.contains_key(&rewritten.id) {
            return Err(SkeinError::TrackingConflict(rewritten.id));
        }
        if let Some(target) = entry.original_stream_url.clone() {
            let rx = self.relay.subscribe(&rewritten.id)?;
            let relay = self.relay.clone();
            let id = rewritten.id.clone();
            let forwarder = tokio::spawn(async move {
                if let Err(e) = relay.forward_from(&id, rx, &target, timeout).await {
                    warn!("Failed to forward stream {} to {}: {}", id, target, e);
                }
            });
            entry.forwarder = Some(forwarder.abort_handle());
            rewritten.stream_url = Some(self.relay.slot_url(&rewritten.id));
        }
        entries.insert(rewritten.id.clone(), entry);
        drop(entries);

        debug!("Tracking request {} for {:?}", rewritten.id, timeout);
        Ok(rewritten)
    }

    /// Routes a provider's response back to the original caller.
    ///
    /// Returns `false` without doing anything when the id is not (or no
    /// longer) tracked.
    pub async fn resolve(&self, mut response: Response) -> bool {
        let Some(entry) = self.entries().remove(&response.id) else {
            debug!("Ignoring response for untracked request {}", response.id);
            return false;
        };

        if let Some(url) = response.stream_url.take() {
            response.stream_url = Some(self.rewrite_stream_url(&response.id, &entry, url));
        } else if entry.original_stream_url.is_some() {
            // no pushed stream is coming, let the forwarder finish
            self.relay.release(&response.id);
        }

        debug!("Resolved request {}", response.id);
        self.deliver(entry.original_response_hook.as_deref(), &response).await;
        true
    }

    fn rewrite_stream_url(&self, id: &str, entry: &Entry, url: String) -> String {
        match &entry.original_stream_url {
            Some(original) if url == self.relay.slot_url(id) => original.clone(),
            original => {
                if original.is_some() {
                    self.relay.release(id);
                }
                if Hook::is_unix(&url) {
                    self.relay.pull_url(&url)
                } else {
                    url
                }
            }
        }
    }

    /// Stops tracking `id` without delivering anything.
    pub fn cancel(&self, id: &str) -> bool {
        let removed = self.entries().remove(id);
        match removed {
            Some(entry) => {
                entry.abandon(&self.relay, id);
                debug!("Cancelled request {}", id);
                true
            }
            None => false,
        }
    }

    /// Reclaims every entry past its deadline and delivers a timeout error
    /// for each. Returns the number of entries reclaimed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(RequestId, Entry)> = {
            let mut entries = self.entries();
            let ids: Vec<RequestId> = entries
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        if expired.is_empty() {
            return 0;
        }

        let count = expired.len();
        let deliveries = expired.into_iter().map(|(id, entry)| async move {
            entry.abandon(&self.relay, &id);
            let err = SkeinError::Timeout(entry.timeout.as_millis() as u64);
            warn!("Request {} timed out", id);
            let response = Response::from_error(id, &err);
            self.deliver(entry.original_response_hook.as_deref(), &response).await;
        });
        join_all(deliveries).await;

        count
    }

    async fn deliver(&self, hook: Option<&str>, response: &Response) {
        let Some(hook) = hook else {
            debug!("Request {} has no response hook, dropping response", response.id);
            return;
        };
        if let Err(e) = self.sink.deliver(hook, response).await {
            warn!("Failed to deliver response {} to {}: {}", response.id, hook, e);
        }
    }

    pub fn pending(&self) -> usize {
        self.entries().len()
    }

    pub fn is_tracking(&self, id: &str) -> bool {
        self.entries().contains_key(id)
    }

    /// Binds the response socket and starts the sweeper.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let server = UnixServer::bind(&self.config.response_socket)?;
        let tracker = self.clone();
        let server = server.spawn(move |response: Response| {
            let tracker = tracker.clone();
            async move {
                let id = response.id.clone();
                tokio::spawn(async move {
                    tracker.resolve(response).await;
                });
                Response::ack(id)
            }
        });

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let tracker = self.clone();
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tracker.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let expired = tracker.sweep().await;
                        if expired > 0 {
                            debug!("Swept {} expired request(s)", expired);
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        info!("Tracker accepting responses on {}", self.config.response_socket.display());
        *running = Some(Running {
            server,
            sweeper,
            shutdown_tx,
        });
        Ok(())
    }

    /// Stops the response socket and the sweeper, and forgets every pending
    /// entry without answering it.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        let _ = running.shutdown_tx.send(());
        if let Err(e) = running.sweeper.await {
            warn!("Sweeper task failed: {}", e);
        }
        running.server.shutdown().await;

        let dropped = {
            let mut entries = self.entries();
            let dropped = entries.len();
            for (id, entry) in entries.drain() {
                entry.abandon(&self.relay, &id);
            }
            dropped
        };
        info!("Tracker stopped, {} pending request(s) dropped", dropped);
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<RequestId, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
