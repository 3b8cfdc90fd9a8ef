use skein_common::namespace;
use skein_common::protocol::error::{Result, SkeinError};
use std::path::PathBuf;
use std::time::Duration;

/// Provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Root of the socket namespace shared with the coordinator
    pub socket_dir: PathBuf,
    /// Names this provider's endpoint sockets
    pub provider_id: String,
    /// Upper bound on a handler run when the request carries no timeout
    pub request_timeout: Duration,
    /// Bound on delivering the outcome to the response hook
    pub delivery_timeout: Duration,
}

impl ProviderConfig {
    pub fn new(socket_dir: impl Into<PathBuf>, provider_id: impl Into<String>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            provider_id: provider_id.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.socket_dir.is_absolute() {
            return Err(SkeinError::Config(format!(
                "socket dir must be an absolute path, got {}",
                self.socket_dir.display()
            )));
        }
        if namespace::validate_name(&self.provider_id).is_err() {
            return Err(SkeinError::Config(format!("invalid provider id '{}'", self.provider_id)));
        }
        if self.request_timeout.is_zero() || self.delivery_timeout.is_zero() {
            return Err(SkeinError::Config("timeouts must be greater than zero".to_string()));
        }
        Ok(())
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/run/skein"),
            provider_id: format!("provider-{}", std::process::id()),
            request_timeout: Duration::from_secs(30),
            delivery_timeout: Duration::from_secs(5),
        }
    }
}
