use skein_common::namespace;
use skein_common::protocol::error::{Result, SkeinError};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Root of the socket namespace shared with providers
    pub socket_dir: PathBuf,
    /// Names this coordinator's own sockets
    pub service_name: String,
    /// External HTTP listen address
    pub external_addr: SocketAddr,
    /// Externally reachable base URL; derived from the bound address if unset
    pub advertise_url: Option<String>,
    /// Completion bound for requests that carry no timeout of their own
    pub request_timeout: Duration,
    /// How often expired tracker entries are reclaimed
    pub sweep_interval: Duration,
    /// Bound on a single hand-off to a provider, and on hook delivery
    pub transmit_timeout: Duration,
    /// How long in-flight HTTP connections may drain on stop
    pub drain_timeout: Duration,
    /// How long a stream producer may wait for the consumer to drain a chunk
    pub stream_idle_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/run/skein"),
            service_name: "coordinator".to_string(),
            external_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            advertise_url: None,
            request_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            transmit_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.socket_dir.is_absolute() {
            return Err(SkeinError::Config(format!(
                "socket dir must be an absolute path, got {}",
                self.socket_dir.display()
            )));
        }
        if namespace::validate_name(&self.service_name).is_err() {
            return Err(SkeinError::Config(format!("invalid service name '{}'", self.service_name)));
        }
        if let Some(url) = &self.advertise_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(SkeinError::Config(format!(
                    "advertise URL must start with http:// or https://, got {}",
                    url
                )));
            }
        }

        let durations = [
            ("request timeout", self.request_timeout),
            ("sweep interval", self.sweep_interval),
            ("transmit timeout", self.transmit_timeout),
            ("drain timeout", self.drain_timeout),
            ("stream idle timeout", self.stream_idle_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(SkeinError::Config(format!("{} must be greater than zero", name)));
            }
        }

        Ok(())
    }

    /// Socket accepting requests from local callers.
    pub fn internal_socket(&self) -> PathBuf {
        namespace::coordinator_socket(&self.socket_dir, &self.service_name)
    }

    /// Socket providers deliver final responses to.
    pub fn response_socket(&self) -> PathBuf {
        namespace::response_socket(&self.socket_dir, &self.service_name)
    }
}
