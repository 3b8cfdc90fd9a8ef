use std::time::Duration;
use tracing::debug;

use crate::protocol::error::{Result, SkeinError};
use crate::protocol::{Hook, Response};
use crate::transport::http::HttpTransport;
use crate::transport::unix::UnixTransport;

/// Delivers a [`Response`] to a response hook of either scheme.
///
/// Unix hooks receive one framed response and must acknowledge it; an
/// acknowledgment that carries an error fails the delivery. HTTP hooks
/// receive a JSON POST and must answer 2xx.
#[derive(Clone)]
pub struct HookDelivery {
    unix: UnixTransport,
    http: HttpTransport,
    timeout: Duration,
}

impl HookDelivery {
    pub fn new(timeout: Duration) -> Self {
        Self {
            unix: UnixTransport::with_timeout(timeout),
            http: HttpTransport::new(),
            timeout,
        }
    }

    pub async fn deliver(&self, hook: &str, response: &Response) -> Result<()> {
        match Hook::parse(hook)? {
            Hook::Unix(path) => {
                let ack = self.unix.send_response(&path, response).await?;
                if let Some(error) = ack.error {
                    return Err(SkeinError::Remote(error));
                }
            }
            Hook::Http(url) => {
                self.http.post_json(&url, response, self.timeout).await?;
            }
        }
        debug!("Delivered response {} to {}", response.id, hook);
        Ok(())
    }
}

impl Default for HookDelivery {
    fn default() -> Self {
        Self::new(crate::transport::unix::DEFAULT_TIMEOUT)
    }
}
