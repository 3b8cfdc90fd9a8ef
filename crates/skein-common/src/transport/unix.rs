use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tokio::net::UnixStream;

use crate::protocol::error::{Result, SkeinError};
use crate::protocol::{Request, Response};
use crate::transport::codec::{read_message, write_frame};

/// Default deadline for a whole Unix-socket exchange (5 seconds)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client side of the internal transport.
///
/// Every exchange opens a fresh connection, writes exactly one frame, reads
/// exactly one frame back and closes. Opening a connection per message keeps
/// concurrent callers fully independent.
///
/// # Example
///
/// ```no_run
/// use skein_common::transport::UnixTransport;
/// use skein_common::protocol::Request;
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() -> skein_common::Result<()> {
/// let transport = UnixTransport::new();
/// let request = Request::new("ping", json!({}));
/// let ack = transport.send_request("/run/skein/coordinator/coordinator.sock", &request).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct UnixTransport {
    timeout: Duration,
}

impl UnixTransport {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends a request and returns the receiver's immediate response.
    pub async fn send_request(&self, path: impl AsRef<Path>, request: &Request) -> Result<Response> {
        self.exchange(path.as_ref(), request).await
    }

    /// Delivers a response and returns the receiver's acknowledgment.
    pub async fn send_response(&self, path: impl AsRef<Path>, response: &Response) -> Result<Response> {
        self.exchange(path.as_ref(), response).await
    }

    /// Writes one message and reads one reply, bounded by the transport
    /// timeout.
    pub async fn exchange<T, R>(&self, path: &Path, msg: &T) -> Result<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let fut = async {
            let mut stream = UnixStream::connect(path).await.map_err(|e| {
                SkeinError::Transport(format!("Failed to connect to {}: {}", path.display(), e))
            })?;
            write_frame(&mut stream, msg).await?;
            read_message(&mut stream).await
        };

        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| SkeinError::Timeout(self.timeout.as_millis() as u64))?
    }
}

impl Default for UnixTransport {
    fn default() -> Self {
        Self::new()
    }
}
