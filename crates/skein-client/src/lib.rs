//! Skein Client
//!
//! Submits tasks to a coordinator, either over its internal Unix socket or
//! its external HTTP endpoint, and waits for the final response on a
//! private hook socket.

pub mod client;

pub use client::SkeinClient;
