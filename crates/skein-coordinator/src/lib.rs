//! Skein Coordinator
//!
//! Accepts task requests over HTTP or a local Unix socket, finds a provider
//! that is willing to run the task, and makes sure the provider's eventual
//! response reaches whoever asked, exactly once.
//!
//! # Components
//!
//! - [`registry`]: which providers currently serve a task
//! - [`router`]: ordered failover across those providers
//! - [`tracker`]: correlation of late responses with their callers
//! - [`relay`]: HTTP relay for streamed task output
//! - [`gateway`]: external and internal entry points
//! - [`server`]: the [`Coordinator`] lifecycle

pub mod config;
pub mod gateway;
pub mod registry;
pub mod relay;
pub mod router;
pub mod server;
pub mod tracker;

pub use config::CoordinatorConfig;
pub use gateway::Gateway;
pub use registry::{Endpoint, MemoryRegistry, ProviderRegistry, SocketDirRegistry};
pub use relay::StreamRelay;
pub use router::{first_accepting, ProxyRouter, Transmit, UnixTransmitter};
pub use server::Coordinator;
pub use tracker::{HookSink, ResponseSink, Tracker, TrackerConfig};
