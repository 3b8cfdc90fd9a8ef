use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{Result, SkeinError};
use crate::namespace;

pub type RequestId = String;
pub type TaskName = String;
pub type TaskArgs = serde_json::Value;

/// A task request as it travels between callers, the coordinator, and
/// providers.
///
/// Every field except `task` may be omitted on the wire. The gateway assigns
/// an `id` when the caller left it empty, and the coordinator rewrites
/// `response_hook`/`stream_url` before handing the request to a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    /// Correlation identifier, immutable once assigned
    #[serde(default)]
    pub id: RequestId,
    /// Task name, selects the provider
    #[serde(default)]
    pub task: TaskName,
    /// Task-specific arguments, opaque to everything but the handler
    #[serde(default)]
    pub args: TaskArgs,
    /// Where the eventual response must be delivered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_hook: Option<String>,
    /// Where a pushed stream should be delivered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
    /// Completion bound for the whole round-trip
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Request {
    pub fn new(task: impl Into<String>, args: TaskArgs) -> Self {
        Request {
            id: generate_request_id(),
            task: task.into(),
            args,
            response_hook: None,
            stream_url: None,
            timeout_ms: None,
        }
    }

    pub fn with_response_hook(mut self, hook: impl Into<String>) -> Self {
        self.response_hook = Some(hook.into());
        self
    }

    pub fn with_stream_url(mut self, stream_url: impl Into<String>) -> Self {
        self.stream_url = Some(stream_url.into());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Assigns a fresh id if the caller did not supply one.
    pub fn ensure_id(&mut self) -> &RequestId {
        if self.id.is_empty() {
            self.id = generate_request_id();
        }
        &self.id
    }

    /// Structural validation performed by every receiver.
    ///
    /// An id, when present, must be usable as a file name: providers name
    /// per-request stream sockets after it.
    pub fn validate(&self) -> Result<()> {
        if self.task.is_empty() {
            return Err(SkeinError::MissingField("task"));
        }
        if !self.id.is_empty() && namespace::validate_name(&self.id).is_err() {
            return Err(SkeinError::MalformedRequest(format!("invalid request id '{}'", self.id)));
        }
        Ok(())
    }

    /// Decodes `args` into the handler's own argument type.
    ///
    /// Absent args decode as an empty object so argument structs made of
    /// optional or defaulted fields work without the caller sending `{}`.
    pub fn unmarshal_args<T: DeserializeOwned>(&self) -> Result<T> {
        let args = if self.args.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            self.args.clone()
        };
        serde_json::from_value(args)
            .map_err(|e| SkeinError::MalformedRequest(format!("invalid args for '{}': {}", self.task, e)))
    }
}

fn generate_request_id() -> RequestId {
    uuid::Uuid::new_v4().to_string()
}
