//! Transport layer
//!
//! - [`codec`]: length-prefixed JSON framing shared by every Unix socket
//! - [`unix`] / [`unix_server`]: one message per connection over Unix sockets
//! - [`http`]: JSON POST client for `http://` hooks
//! - [`delivery`]: hook-scheme dispatch for final responses

pub mod codec;
pub mod delivery;
pub mod http;
pub mod unix;
pub mod unix_server;

pub use codec::{read_frame, read_message, write_frame, JsonCodec, MAX_FRAME_SIZE};
pub use delivery::HookDelivery;
pub use http::{post_stream, HttpTransport};
pub use unix::UnixTransport;
pub use unix_server::{UnixServer, UnixServerHandle};
