//! Skein Common Types and Transport
//!
//! This crate provides the protocol envelope and the transport layer shared
//! by the coordinator, providers, and clients.
//!
//! # Overview
//!
//! Skein routes named tasks to whichever provider process is currently
//! willing to run them. Every component speaks the same envelope:
//!
//! - **Protocol Layer**: Request/Response types, error taxonomy, hook addresses
//! - **Transport Layer**: framed JSON over Unix sockets, JSON over HTTP
//! - **Namespace**: where every socket lives under the shared socket directory
//!
//! # Architecture
//!
//! - **Internal transport**: Unix domain sockets, one request per connection
//! - **Serialization**: JSON
//! - **Message Format**: `[4-byte length prefix as u32 big-endian] + [JSON data]`
//! - **Max Message Size**: 16 MiB
//!
//! # Example
//!
//! ```
//! use skein_common::{Request, Response};
//! use serde_json::json;
//!
//! let request = Request::new("zfs-list", json!({"name": "tank"}))
//!     .with_response_hook("unix:///run/skein/client.sock");
//!
//! let response = Response::success(request.id.clone(), json!({"datasets": []}));
//! assert!(response.error.is_none());
//! ```

pub mod namespace;
pub mod protocol;
pub mod transport;

pub use protocol::*;
