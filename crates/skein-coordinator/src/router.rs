use async_trait::async_trait;
use skein_common::protocol::error::{Result, SkeinError};
use skein_common::protocol::Request;
use skein_common::transport::UnixTransport;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::registry::{Endpoint, ProviderRegistry};
use crate::tracker::Tracker;

/// Hands a request to one provider endpoint.
///
/// `Ok` means the provider accepted the request; it says nothing about
/// whether the task will succeed.
#[async_trait]
pub trait Transmit: Send + Sync {
    async fn transmit(&self, endpoint: &Endpoint, request: &Request) -> Result<()>;
}

/// Transmits over the provider's Unix socket and waits for its immediate
/// acknowledgment. An acknowledgment carrying an error is a rejection.
pub struct UnixTransmitter {
    transport: UnixTransport,
}

impl UnixTransmitter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            transport: UnixTransport::with_timeout(timeout),
        }
    }
}

#[async_trait]
impl Transmit for UnixTransmitter {
    async fn transmit(&self, endpoint: &Endpoint, request: &Request) -> Result<()> {
        let ack = self.transport.send_request(&endpoint.path, request).await?;
        match ack.error {
            Some(error) => Err(SkeinError::Remote(error)),
            None => Ok(()),
        }
    }
}

/// Tries `candidates` in order and returns the first one `attempt` accepts.
///
/// Stops at the first success. If every attempt fails the error of the last
/// attempt is returned.
pub async fn first_accepting<'a, T, F, Fut>(candidates: &'a [T], mut attempt: F) -> Result<&'a T>
where
    F: FnMut(&'a T) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut last_error = None;
    for candidate in candidates {
        match attempt(candidate).await {
            Ok(()) => return Ok(candidate),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| SkeinError::Transport("no candidates to try".to_string())))
}

/// Routes requests to the first provider willing to take them.
pub struct ProxyRouter {
    registry: Arc<dyn ProviderRegistry>,
    tracker: Arc<Tracker>,
    transmitter: Arc<dyn Transmit>,
    default_timeout: Duration,
}

impl ProxyRouter {
    pub fn new(
        registry: Arc<dyn ProviderRegistry>,
        tracker: Arc<Tracker>,
        transmitter: Arc<dyn Transmit>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            tracker,
            transmitter,
            default_timeout,
        }
    }

    /// Hands `request` to a provider.
    ///
    /// On success the tracker owns the request until its response or its
    /// deadline arrives. On failure nothing stays tracked and the error
    /// describes why no provider took the request.
    ///
    /// # Errors
    /// - `NoProvidersAvailable` - no provider serves the task
    /// - `AllProvidersUnreachable` - every candidate refused or could not be
    ///   reached; carries the last attempt's error
    /// - `TrackingConflict` - a request with the same id is still in flight
    pub async fn dispatch(&self, request: Request) -> Result<()> {
        let task = request.task.clone();
        let candidates = self.registry.discover(&task).await?;
        if candidates.is_empty() {
            return Err(SkeinError::NoProvidersAvailable(task));
        }

        let timeout = request.timeout().unwrap_or(self.default_timeout);
        let rewritten = self.tracker.track(request, timeout)?;
        let outbound = &rewritten;
        let transmitter = &self.transmitter;

        let accepted = first_accepting(&candidates, |endpoint| async move {
            let result = transmitter.transmit(endpoint, outbound).await;
            if let Err(e) = &result {
                warn!(
                    "Provider {} refused request {} for '{}': {}",
                    endpoint.provider_id, outbound.id, endpoint.task, e
                );
            }
            result
        })
        .await;

        match accepted {
            Ok(endpoint) => {
                debug!("Request {} accepted by provider {}", rewritten.id, endpoint.provider_id);
                Ok(())
            }
            Err(last) => {
                self.tracker.cancel(&rewritten.id);
                Err(SkeinError::AllProvidersUnreachable {
                    task,
                    source: Box::new(last),
                })
            }
        }
    }
}
