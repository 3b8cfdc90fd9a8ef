//! Skein Provider
//!
//! Hosting framework for processes that execute skein tasks. A provider
//! registers one handler per task it serves and starts the server; the
//! coordinator finds it through the socket directory.
//!
//! Handlers are asynchronous and may take as long as they need within the
//! request's timeout: the coordinator only waits for the immediate
//! acknowledgment, and the result travels back through the response hook.

pub mod config;
pub mod handler;
pub mod server;
pub mod stream;

pub use config::ProviderConfig;
pub use handler::{FnHandler, TaskHandler, TaskOutput, TypedHandler};
pub use server::ProviderServer;
pub use stream::{push_stream, LocalStream};
