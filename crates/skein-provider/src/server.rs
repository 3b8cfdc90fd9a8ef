use serde::de::DeserializeOwned;
use serde::Serialize;
use skein_common::namespace;
use skein_common::protocol::error::{Result, SkeinError};
use skein_common::protocol::{Request, Response};
use skein_common::transport::{HookDelivery, UnixServer, UnixServerHandle};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::handler::{FnHandler, TaskHandler, TaskOutput, TypedHandler};

/// Hosts task handlers on the provider side of the socket namespace.
///
/// For every registered task the server listens on
/// `<socket_dir>/<task>/<provider_id>.sock`, which is what makes the
/// coordinator discover it. An incoming request is acknowledged right away;
/// the handler then runs on its own task and its outcome is delivered to
/// the request's response hook.
///
/// # Example
///
/// ```no_run
/// use skein_provider::{ProviderConfig, ProviderServer};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Deserialize)]
/// struct EchoArgs { text: String }
///
/// #[derive(Serialize)]
/// struct EchoResult { text: String }
///
/// # #[tokio::main]
/// # async fn main() -> skein_common::Result<()> {
/// let mut server = ProviderServer::new(ProviderConfig::new("/run/skein", "echo"))?;
/// server.register_typed("echo", |args: EchoArgs| async move {
///     Ok(EchoResult { text: args.text })
/// })?;
/// server.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct ProviderServer {
    config: ProviderConfig,
    handlers: BTreeMap<String, Arc<dyn TaskHandler>>,
    delivery: HookDelivery,
    listeners: Vec<UnixServerHandle>,
}

impl ProviderServer {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        config.validate()?;
        let delivery = HookDelivery::new(config.delivery_timeout);
        Ok(Self {
            config,
            handlers: BTreeMap::new(),
            delivery,
            listeners: Vec::new(),
        })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Registers a handler for `task`. Each task can be registered once.
    pub fn register_handler(&mut self, task: &str, handler: Arc<dyn TaskHandler>) -> Result<&mut Self> {
        namespace::validate_task_name(task)?;
        if self.handlers.contains_key(task) {
            return Err(SkeinError::Config(format!("task '{}' is already registered", task)));
        }
        self.handlers.insert(task.to_string(), handler);
        Ok(self)
    }

    /// Registers a closure over the raw request.
    pub fn register_task<F, Fut>(&mut self, task: &str, f: F) -> Result<&mut Self>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskOutput>> + Send + 'static,
    {
        self.register_handler(task, Arc::new(FnHandler::new(f)))
    }

    /// Registers a closure over typed arguments and a serializable result.
    pub fn register_typed<A, O, F, Fut>(&mut self, task: &str, f: F) -> Result<&mut Self>
    where
        A: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        self.register_handler(task, Arc::new(TypedHandler::new(f)))
    }

    pub fn tasks(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn socket_path(&self, task: &str) -> PathBuf {
        namespace::provider_socket(&self.config.socket_dir, task, &self.config.provider_id)
    }

    /// Where a handler should bind a [`LocalStream`](crate::LocalStream) for
    /// request `id`. Ids that are not plain file names are refused.
    pub fn stream_path(&self, id: &str) -> Result<PathBuf> {
        namespace::stream_socket(&self.config.socket_dir, &self.config.provider_id, id)
    }

    /// Starts listening for every registered task.
    ///
    /// If any socket fails to bind, the ones already bound are removed again.
    pub async fn start(&mut self) -> Result<()> {
        if !self.listeners.is_empty() {
            return Ok(());
        }

        for (task, handler) in &self.handlers {
            let path = self.socket_path(task);
            let server = match UnixServer::bind(&path) {
                Ok(server) => server,
                Err(e) => {
                    for listener in self.listeners.drain(..) {
                        listener.shutdown().await;
                    }
                    return Err(e);
                }
            };

            let host = Arc::new(TaskHost {
                task: task.clone(),
                handler: handler.clone(),
                delivery: self.delivery.clone(),
                default_timeout: self.config.request_timeout,
            });
            let handle = server.spawn(move |request: Request| {
                let host = host.clone();
                async move { host.accept(request) }
            });

            info!("Serving task '{}' on {}", task, path.display());
            self.listeners.push(handle);
        }

        Ok(())
    }

    /// Stops every listener and removes the endpoint sockets.
    pub async fn stop(&mut self) {
        for listener in self.listeners.drain(..) {
            listener.shutdown().await;
        }
        info!("Provider {} stopped", self.config.provider_id);
    }
}

/// Per-task state shared by every connection on that task's socket.
struct TaskHost {
    task: String,
    handler: Arc<dyn TaskHandler>,
    delivery: HookDelivery,
    default_timeout: Duration,
}

impl TaskHost {
    /// Decides whether to take the request and, if so, starts it.
    fn accept(self: Arc<Self>, request: Request) -> Response {
        let id = request.id.clone();
        if let Err(e) = self.check(&request) {
            debug!("Refusing request {}: {}", id, e);
            return Response::from_error(id, &e);
        }

        tokio::spawn(self.execute(request));
        Response::ack(id)
    }

    fn check(&self, request: &Request) -> Result<()> {
        request.validate()?;
        if request.id.is_empty() {
            return Err(SkeinError::MissingField("id"));
        }
        if request.task != self.task {
            return Err(SkeinError::MalformedRequest(format!(
                "task '{}' sent to the socket for '{}'",
                request.task, self.task
            )));
        }
        Ok(())
    }

    async fn execute(self: Arc<Self>, request: Request) {
        let id = request.id.clone();
        let hook = request.response_hook.clone();
        let timeout = request.timeout().unwrap_or(self.default_timeout);

        let response = match tokio::time::timeout(timeout, self.handler.handle(request)).await {
            Ok(Ok(output)) => output.into_response(id),
            Ok(Err(e)) => {
                warn!("Task '{}' failed for request {}: {}", self.task, id, e);
                Response::from_error(id, &e)
            }
            Err(_) => {
                warn!("Task '{}' exceeded {:?} for request {}", self.task, timeout, id);
                Response::from_error(id, &SkeinError::Timeout(timeout.as_millis() as u64))
            }
        };

        let Some(hook) = hook else {
            debug!("Request {} has no response hook, dropping outcome", response.id);
            return;
        };
        if let Err(e) = self.delivery.deliver(&hook, &response).await {
            warn!("Failed to deliver response {} to {}: {}", response.id, hook, e);
        }
    }
}
