use serde_json::Value;
use skein_common::namespace;
use skein_common::protocol::error::{Result, SkeinError};
use skein_common::protocol::{Hook, Request, Response};
use skein_common::transport::{HttpTransport, JsonCodec, UnixServer, UnixTransport};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Default completion bound for a call (30 seconds)
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long past the request deadline to keep waiting for the coordinator's
/// own timeout response.
const RESPONSE_GRACE: Duration = Duration::from_secs(1);

/// Bound on getting the provisional acknowledgment.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
enum Target {
    Internal(PathBuf),
    External(String),
}

/// Skein client for submitting tasks
///
/// Each call opens a fresh connection for the submission and binds its own
/// hook socket for the final response, so calls from one client run fully
/// in parallel.
#[derive(Clone)]
pub struct SkeinClient {
    target: Target,
    hook_dir: PathBuf,
    timeout: Duration,
    unix: UnixTransport,
    http: HttpTransport,
}

impl SkeinClient {
    /// Create a client that talks to the coordinator's internal socket.
    pub fn internal(socket_dir: impl AsRef<Path>, service: &str) -> Result<Self> {
        namespace::validate_name(service)?;
        let path = namespace::coordinator_socket(socket_dir.as_ref(), service);
        Ok(Self::with_target(Target::Internal(path)))
    }

    /// Create a client that talks to the coordinator's external HTTP endpoint.
    ///
    /// Final responses still come back over a local Unix hook, so the
    /// coordinator must run on the same host.
    pub fn external(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(SkeinError::Config(format!(
                "coordinator URL must start with http:// or https://, got {}",
                url
            )));
        }
        Ok(Self::with_target(Target::External(url)))
    }

    fn with_target(target: Target) -> Self {
        Self {
            target,
            hook_dir: std::env::temp_dir().join("skein-client"),
            timeout: DEFAULT_CALL_TIMEOUT,
            unix: UnixTransport::with_timeout(SUBMIT_TIMEOUT),
            http: HttpTransport::new(),
        }
    }

    /// Directory the per-call hook sockets are created in.
    pub fn with_hook_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.hook_dir = dir.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Submits a request and returns the coordinator's provisional response.
    ///
    /// An error in the returned response means the request was never handed
    /// to a provider.
    pub async fn submit(&self, request: &Request) -> Result<Response> {
        match &self.target {
            Target::Internal(path) => self.unix.send_request(path, request).await,
            Target::External(url) => {
                let body = self.http.post_json(url, request, SUBMIT_TIMEOUT).await?;
                JsonCodec::decode_response(&body)
            }
        }
    }

    /// Runs a task and waits for its final response.
    ///
    /// Returns the successful response, which carries either an inline
    /// `result` or a `stream_url` to read the payload from. Errors reported
    /// by the coordinator or the provider come back as `SkeinError::Remote`.
    pub async fn call(&self, task: impl Into<String>, args: Value) -> Result<Response> {
        let mut request = Request::new(task, args).with_timeout(self.timeout.as_millis() as u64);
        let hook_path = self.hook_dir.join(format!("{}.sock", request.id));
        request.response_hook = Some(Hook::unix_url(&hook_path));

        let (tx, mut rx) = mpsc::channel::<Response>(1);
        let expected = request.id.clone();
        let hook = UnixServer::bind(&hook_path)?.spawn(move |response: Response| {
            let tx = tx.clone();
            let expected = expected.clone();
            async move {
                if response.id != expected {
                    debug!("Ignoring response for unknown request {}", response.id);
                    return Response::from_error(
                        response.id.clone(),
                        &SkeinError::MalformedRequest("unexpected request id".to_string()),
                    );
                }
                let id = response.id.clone();
                let _ = tx.try_send(response);
                Response::ack(id)
            }
        });

        let outcome = self.await_response(&request, &mut rx).await;
        hook.shutdown().await;
        outcome
    }

    async fn await_response(&self, request: &Request, rx: &mut mpsc::Receiver<Response>) -> Result<Response> {
        let ack = self.submit(request).await?;
        if let Some(err) = ack.error {
            return Err(SkeinError::Remote(err));
        }
        debug!("Request {} accepted for task {}", request.id, request.task);

        let wait = self.timeout + RESPONSE_GRACE;
        let response = tokio::time::timeout(wait, rx.recv())
            .await
            .map_err(|_| SkeinError::Timeout(wait.as_millis() as u64))?
            .ok_or_else(|| SkeinError::Transport("response hook closed".to_string()))?;

        match response.error {
            Some(err) => Err(SkeinError::Remote(err)),
            None => Ok(response),
        }
    }
}
