use serde::de::DeserializeOwned;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::protocol::error::{Result, SkeinError};
use crate::protocol::Response;
use crate::transport::codec::{read_message, write_frame};

/// Async Unix-socket server for the internal transport.
///
/// Each accepted connection carries exactly one inbound message (a request
/// or a response, depending on the endpoint) and gets exactly one
/// [`Response`] back before the connection is closed. Connections are
/// handled on their own tasks.
pub struct UnixServer {
    listener: UnixListener,
    path: PathBuf,
}

impl UnixServer {
    /// Binds a new server at `path`.
    ///
    /// Missing parent directories are created and a stale socket file left
    /// behind by a previous process at the same path is removed first.
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Removed stale socket {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&path)
            .map_err(|e| SkeinError::Transport(format!("Failed to bind to {}: {}", path.display(), e)))?;

        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Starts accepting connections on a background task.
    ///
    /// # Arguments
    /// * `handler` - Produces the reply for each decoded inbound message
    pub fn spawn<In, F, Fut>(self, handler: F) -> UnixServerHandle
    where
        In: DeserializeOwned + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let path = self.path.clone();
        info!("Unix listener accepting on {}", path.display());

        let join = tokio::spawn(self.accept_loop(Arc::new(handler), shutdown_rx));

        UnixServerHandle {
            path,
            shutdown_tx: Some(shutdown_tx),
            join: Some(join),
        }
    }

    async fn accept_loop<In, F, Fut>(self, handler: Arc<F>, mut shutdown: oneshot::Receiver<()>)
    where
        In: DeserializeOwned + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let handler = handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, handler).await {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection on {}: {}", self.path.display(), e);
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Unix listener on {} shutting down", self.path.display());
                    break;
                }
            }
        }
    }
}

/// Handles one connection: one message in, one response out.
async fn handle_connection<In, F, Fut>(mut stream: UnixStream, handler: Arc<F>) -> Result<()>
where
    In: DeserializeOwned,
    F: Fn(In) -> Fut,
    Fut: Future<Output = Response>,
{
    let reply = match read_message::<_, In>(&mut stream).await {
        Ok(msg) => handler(msg).await,
        Err(e @ SkeinError::MalformedRequest(_)) => {
            warn!("Failed to decode message: {}", e);
            Response::from_error(String::new(), &e)
        }
        Err(e) => return Err(e),
    };

    write_frame(&mut stream, &reply).await
}

/// Handle to a running [`UnixServer`].
///
/// Stopping the server (or dropping the handle) stops the accept loop and
/// removes the socket file. Connections already accepted run to completion.
pub struct UnixServerHandle {
    path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl UnixServerHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops accepting and waits for the accept loop to exit.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!("Unix listener task failed: {}", e);
            }
        }
        remove_socket(&self.path);
    }

    pub async fn shutdown(mut self) {
        self.stop().await;
    }
}

impl Drop for UnixServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            remove_socket(&self.path);
        }
    }
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove socket {}: {}", path.display(), e);
        }
    }
}
