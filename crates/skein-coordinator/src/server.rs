use skein_common::protocol::error::{Result, SkeinError};
use skein_common::transport::UnixServerHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::CoordinatorConfig;
use crate::gateway::Gateway;
use crate::registry::{ProviderRegistry, SocketDirRegistry};
use crate::relay::StreamRelay;
use crate::router::{ProxyRouter, Transmit, UnixTransmitter};
use crate::tracker::{HookSink, ResponseSink, Tracker, TrackerConfig};

struct Running {
    external_addr: SocketAddr,
    internal: UnixServerHandle,
    shutdown_tx: oneshot::Sender<()>,
    external: JoinHandle<()>,
}

#[derive(Default)]
struct Lifecycle {
    running: Option<Running>,
    stopped: bool,
}

/// The coordinator process: every component wired together with its
/// listeners.
///
/// # Lifecycle
///
/// [`start`](Coordinator::start) brings listeners up in dependency order
/// (tracker response socket, internal socket, external HTTP). If any of them
/// fails the ones already started are torn down again.
/// [`stop`](Coordinator::stop) tears everything down; only the first call
/// has any effect and a stopped coordinator cannot be restarted.
/// If the external server dies on its own,
/// [`stop_on_signal`](Coordinator::stop_on_signal) stops the rest and
/// reports the failure.
pub struct Coordinator {
    config: CoordinatorConfig,
    relay: Arc<StreamRelay>,
    tracker: Arc<Tracker>,
    gateway: Arc<Gateway>,
    lifecycle: Mutex<Lifecycle>,
    failure: Arc<watch::Sender<Option<String>>>,
}

impl Coordinator {
    /// Creates a coordinator that discovers providers in the socket
    /// directory and talks to them over Unix sockets.
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        let registry = Arc::new(SocketDirRegistry::new(config.socket_dir.clone()));
        let transmitter = Arc::new(UnixTransmitter::new(config.transmit_timeout));
        let sink = Arc::new(HookSink::new(config.transmit_timeout));
        Self::with_parts(config, registry, transmitter, sink)
    }

    /// Creates a coordinator from explicit collaborators.
    pub fn with_parts(
        config: CoordinatorConfig,
        registry: Arc<dyn ProviderRegistry>,
        transmitter: Arc<dyn Transmit>,
        sink: Arc<dyn ResponseSink>,
    ) -> Result<Self> {
        config.validate()?;

        let base_url = config
            .advertise_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", config.external_addr));
        let relay = Arc::new(StreamRelay::new(base_url, config.stream_idle_timeout));

        let tracker = Arc::new(Tracker::new(
            TrackerConfig {
                response_socket: config.response_socket(),
                sweep_interval: config.sweep_interval,
            },
            sink,
            relay.clone(),
        ));

        let router = Arc::new(ProxyRouter::new(
            registry,
            tracker.clone(),
            transmitter,
            config.request_timeout,
        ));
        let gateway = Arc::new(Gateway::new(router));

        Ok(Self {
            config,
            relay,
            tracker,
            gateway,
            lifecycle: Mutex::new(Lifecycle::default()),
            failure: Arc::new(watch::channel(None).0),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    /// Starts all listeners and returns the bound external address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.stopped {
            return Err(SkeinError::Config("coordinator has been stopped".to_string()));
        }
        if let Some(running) = &lifecycle.running {
            return Ok(running.external_addr);
        }

        // Bound up front so the relay can advertise the real port; nothing is
        // served on it until the other listeners are up.
        let listener = TcpListener::bind(self.config.external_addr)
            .await
            .map_err(|e| SkeinError::Transport(format!("Failed to bind to {}: {}", self.config.external_addr, e)))?;
        let external_addr = listener.local_addr()?;
        let advertise_url = self
            .config
            .advertise_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", external_addr));
        self.relay.set_base_url(&advertise_url);

        self.tracker.start().await?;

        let internal = match self.gateway.clone().serve_internal(self.config.internal_socket()) {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to start internal listener: {}", e);
                self.tracker.stop().await;
                return Err(e);
            }
        };

        let app = self.gateway.clone().http_app(self.relay.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let failure = self.failure.clone();
        let external = tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                error!("External server error: {}", e);
                failure.send_replace(Some(e.to_string()));
            }
        });

        info!("Coordinator HTTP server listening on {}", external_addr);
        info!("Coordinator internal socket at {}", internal.path().display());
        info!("Advertising {}", advertise_url);

        lifecycle.running = Some(Running {
            external_addr,
            internal,
            shutdown_tx,
            external,
        });
        Ok(external_addr)
    }

    /// The bound external address, once started.
    pub async fn external_addr(&self) -> Option<SocketAddr> {
        self.lifecycle
            .lock()
            .await
            .running
            .as_ref()
            .map(|running| running.external_addr)
    }

    /// Stops every listener. Only the first call has any effect.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.stopped {
            return;
        }
        lifecycle.stopped = true;

        let Some(running) = lifecycle.running.take() else {
            return;
        };

        info!("Stopping coordinator");
        let _ = running.shutdown_tx.send(());
        let mut external = running.external;
        match tokio::time::timeout(self.config.drain_timeout, &mut external).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("External server task failed: {}", e),
            Err(_) => {
                warn!(
                    "Connections still open after {:?}, closing them",
                    self.config.drain_timeout
                );
                external.abort();
            }
        }

        running.internal.shutdown().await;
        self.tracker.stop().await;
        info!("Coordinator stopped");
    }

    /// Why the external server exited on its own, if it did.
    pub fn failure(&self) -> Option<String> {
        self.failure.borrow().clone()
    }

    /// Waits for SIGINT or SIGTERM, then stops.
    ///
    /// Also stops when the external server fails, and returns that failure
    /// as an error.
    pub async fn stop_on_signal(&self) -> Result<()> {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut failure = self.failure.subscribe();
        let failed = tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                None
            }
            _ = terminate.recv() => None,
            reason = failure.wait_for(|reason| reason.is_some()) => {
                reason.ok().and_then(|reason| reason.clone())
            }
        };

        match failed {
            Some(reason) => {
                error!("External server failed, stopping: {}", reason);
                self.stop().await;
                Err(SkeinError::Transport(format!("external server failed: {}", reason)))
            }
            None => {
                info!("Shutdown signal received");
                self.stop().await;
                Ok(())
            }
        }
    }
}
