//! Socket directory layout.
//!
//! ```text
//! <socket_dir>/coordinator/<service>.sock    coordinator request socket
//! <socket_dir>/response/<service>.sock       coordinator response socket
//! <socket_dir>/streams/<provider>/<id>.sock  provider-local stream sockets
//! <socket_dir>/<task>/<provider>.sock        provider endpoints
//! ```

use std::path::{Path, PathBuf};

use crate::protocol::error::{Result, SkeinError};

pub const COORDINATOR_DIR: &str = "coordinator";
pub const RESPONSE_DIR: &str = "response";
pub const STREAMS_DIR: &str = "streams";

const RESERVED: [&str; 3] = [COORDINATOR_DIR, RESPONSE_DIR, STREAMS_DIR];

pub fn coordinator_socket(socket_dir: &Path, service: &str) -> PathBuf {
    socket_dir.join(COORDINATOR_DIR).join(format!("{}.sock", service))
}

pub fn response_socket(socket_dir: &Path, service: &str) -> PathBuf {
    socket_dir.join(RESPONSE_DIR).join(format!("{}.sock", service))
}

pub fn provider_socket(socket_dir: &Path, task: &str, provider_id: &str) -> PathBuf {
    socket_dir.join(task).join(format!("{}.sock", provider_id))
}

/// Stream socket for request `id`. Fails for ids that are not plain names.
pub fn stream_socket(socket_dir: &Path, provider_id: &str, id: &str) -> Result<PathBuf> {
    validate_name(provider_id)?;
    validate_name(id)?;
    Ok(socket_dir
        .join(STREAMS_DIR)
        .join(provider_id)
        .join(format!("{}.sock", id)))
}

/// Rejects names that would resolve outside their own directory.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name.contains('/') || name.contains("..") || name.contains('\0') {
        return Err(SkeinError::MalformedRequest(format!("invalid name '{}'", name)));
    }
    Ok(())
}

/// Task names double as directory names and must not collide with the
/// coordinator's own directories.
pub fn validate_task_name(task: &str) -> Result<()> {
    if RESERVED.contains(&task) {
        return Err(SkeinError::MalformedRequest(format!("task name '{}' is reserved", task)));
    }
    validate_name(task).map_err(|_| SkeinError::MalformedRequest(format!("invalid task name '{}'", task)))
}
