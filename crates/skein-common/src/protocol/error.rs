use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::requests::RequestId;
use super::responses::ResponseError;

/// Wire-level error taxonomy carried in [`ResponseError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedRequest,
    MissingField,
    NoProvidersAvailable,
    AllProvidersUnreachable,
    TrackingConflict,
    Timeout,
    ProviderError,
    DiscoveryUnavailable,
    Transport,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::MalformedRequest => "malformed_request",
            ErrorKind::MissingField => "missing_field",
            ErrorKind::NoProvidersAvailable => "no_providers_available",
            ErrorKind::AllProvidersUnreachable => "all_providers_unreachable",
            ErrorKind::TrackingConflict => "tracking_conflict",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ProviderError => "provider_error",
            ErrorKind::DiscoveryUnavailable => "discovery_unavailable",
            ErrorKind::Transport => "transport",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum SkeinError {
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("No providers available for task '{0}'")]
    NoProvidersAvailable(String),

    #[error("All providers unreachable for task '{task}': {source}")]
    AllProvidersUnreachable {
        task: String,
        #[source]
        source: Box<SkeinError>,
    },

    #[error("Request '{0}' is already being tracked")]
    TrackingConflict(RequestId),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Discovery unavailable: {0}")]
    DiscoveryUnavailable(String),

    #[error("Invalid hook '{0}': must start with unix://, http:// or https://")]
    InvalidHook(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// An error reported by the other side of a connection.
    #[error("{0}")]
    Remote(ResponseError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

impl SkeinError {
    /// Maps a local error onto the wire taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SkeinError::MalformedRequest(_)
            | SkeinError::InvalidHook(_)
            | SkeinError::JsonSerialization(_) => ErrorKind::MalformedRequest,
            SkeinError::MissingField(_) => ErrorKind::MissingField,
            SkeinError::NoProvidersAvailable(_) => ErrorKind::NoProvidersAvailable,
            SkeinError::AllProvidersUnreachable { .. } => ErrorKind::AllProvidersUnreachable,
            SkeinError::TrackingConflict(_) => ErrorKind::TrackingConflict,
            SkeinError::Timeout(_) => ErrorKind::Timeout,
            SkeinError::Provider(_) => ErrorKind::ProviderError,
            SkeinError::DiscoveryUnavailable(_) => ErrorKind::DiscoveryUnavailable,
            SkeinError::Transport(_) | SkeinError::Io(_) => ErrorKind::Transport,
            SkeinError::Remote(e) => e.kind,
            SkeinError::Config(_) => ErrorKind::Internal,
        }
    }

    pub fn to_response_error(&self) -> ResponseError {
        match self {
            SkeinError::Remote(e) => e.clone(),
            other => ResponseError::new(other.kind(), other.to_string()),
        }
    }
}

impl From<ResponseError> for SkeinError {
    fn from(err: ResponseError) -> Self {
        SkeinError::Remote(err)
    }
}

pub type Result<T> = std::result::Result<T, SkeinError>;
