//! Skein Response Types
//!
//! This module defines the response envelope and its wire error shape.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::{ErrorKind, SkeinError};
use super::RequestId;

/// Task result (JSON value), opaque outside the handler that produced it.
pub type TaskResult = serde_json::Value;

/// Error carried inside a [`Response`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ResponseError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A response to a [`Request`](super::Request).
///
/// # Response Flow
///
/// 1. The receiver of a request replies immediately with a provisional
///    response (no result, no error unless the hand-off itself failed)
/// 2. The provider later runs the task and sends the real response to the
///    request's `response_hook`
/// 3. The coordinator's tracker relays that response to the original caller
///
/// # Fields
///
/// - `id`: echoes the originating request
/// - `result`: success payload
/// - `stream_url`: set when the payload is delivered out-of-band as a stream
/// - `error`: failure, mutually exclusive with `result`
///
/// # Example
///
/// ```
/// use skein_common::protocol::responses::Response;
/// use serde_json::json;
///
/// let success = Response::success("req-1", json!({"pong": true}));
/// assert!(success.is_success());
///
/// let ack = Response::ack("req-2");
/// assert!(ack.result.is_none() && ack.error.is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    /// Request identifier this response corresponds to
    pub id: RequestId,
    /// Result value (present on success)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    /// Out-of-band stream location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
    /// Error (present on failure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    /// Creates a successful response carrying an inline result.
    pub fn success(id: impl Into<RequestId>, result: TaskResult) -> Self {
        Response {
            id: id.into(),
            result: Some(result),
            stream_url: None,
            error: None,
        }
    }

    /// Creates a successful response whose payload lives behind `stream_url`.
    pub fn stream(id: impl Into<RequestId>, stream_url: impl Into<String>) -> Self {
        Response {
            id: id.into(),
            result: None,
            stream_url: Some(stream_url.into()),
            error: None,
        }
    }

    /// Creates the provisional acknowledgment sent when a request is accepted.
    pub fn ack(id: impl Into<RequestId>) -> Self {
        Response {
            id: id.into(),
            result: None,
            stream_url: None,
            error: None,
        }
    }

    /// Creates an error response.
    pub fn error(id: impl Into<RequestId>, error: ResponseError) -> Self {
        Response {
            id: id.into(),
            result: None,
            stream_url: None,
            error: Some(error),
        }
    }

    /// Creates an error response from a local error, keeping its kind.
    pub fn from_error(id: impl Into<RequestId>, err: &SkeinError) -> Self {
        Self::error(id, err.to_response_error())
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
