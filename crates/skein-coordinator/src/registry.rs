//! Provider discovery.
//!
//! A provider announces that it runs a task by listening on
//! `<socket_dir>/<task>/<provider-id>.sock`. The filesystem is the only
//! source of truth: nothing is cached, so a provider that comes or goes is
//! picked up by the very next lookup.

use async_trait::async_trait;
use skein_common::namespace::validate_task_name;
use skein_common::protocol::error::{Result, SkeinError};
use std::collections::HashMap;
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

/// One live provider socket for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub task: String,
    pub provider_id: String,
    pub path: PathBuf,
}

/// Source of candidate providers for a task.
///
/// Implementations return candidates in the order the router should try
/// them. An empty list means nobody currently serves the task.
#[async_trait]
pub trait ProviderRegistry: Send + Sync {
    async fn discover(&self, task: &str) -> Result<Vec<Endpoint>>;
}

/// Registry backed by the socket directory.
pub struct SocketDirRegistry {
    root: PathBuf,
}

impl SocketDirRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ProviderRegistry for SocketDirRegistry {
    async fn discover(&self, task: &str) -> Result<Vec<Endpoint>> {
        validate_task_name(task)?;
        let dir = self.root.join(task);

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No provider directory for task '{}'", task);
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(SkeinError::DiscoveryUnavailable(format!("{}: {}", dir.display(), e)));
            }
        };

        let mut endpoints = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    return Err(SkeinError::DiscoveryUnavailable(format!("{}: {}", dir.display(), e)));
                }
            };

            // Entries can vanish between listing and stat
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_socket() {
                continue;
            }

            let path = entry.path();
            let provider_id = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            endpoints.push(Endpoint {
                task: task.to_string(),
                provider_id,
                path,
            });
        }

        endpoints.sort_by(|a, b| a.path.cmp(&b.path));
        debug!("Discovered {} provider(s) for task '{}'", endpoints.len(), task);
        Ok(endpoints)
    }
}

/// In-memory registry for tests and embedding.
#[derive(Default)]
pub struct MemoryRegistry {
    tasks: Mutex<HashMap<String, Vec<Endpoint>>>,
    unavailable: Mutex<Option<String>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an endpoint for `task`; endpoints are returned in insertion order.
    pub fn add(&self, task: &str, provider_id: &str, path: impl Into<PathBuf>) {
        let endpoint = Endpoint {
            task: task.to_string(),
            provider_id: provider_id.to_string(),
            path: path.into(),
        };
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.entry(task.to_string()).or_default().push(endpoint);
    }

    pub fn remove(&self, task: &str, provider_id: &str) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(endpoints) = tasks.get_mut(task) {
            endpoints.retain(|e| e.provider_id != provider_id);
        }
    }

    /// Makes every lookup fail with `DiscoveryUnavailable` until cleared.
    pub fn set_unavailable(&self, reason: Option<&str>) {
        *self.unavailable.lock().unwrap_or_else(|e| e.into_inner()) = reason.map(str::to_string);
    }
}

#[async_trait]
impl ProviderRegistry for MemoryRegistry {
    async fn discover(&self, task: &str) -> Result<Vec<Endpoint>> {
        if let Some(reason) = self.unavailable.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Err(SkeinError::DiscoveryUnavailable(reason));
        }
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tasks.get(task).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_common::protocol::ErrorKind;
    use std::os::unix::net::UnixListener;

    #[tokio::test]
    async fn test_missing_directory_means_no_providers() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SocketDirRegistry::new(dir.path());
        assert!(registry.discover("ping").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_only_sockets_are_endpoints_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let task_dir = dir.path().join("ping");
        std::fs::create_dir_all(&task_dir).unwrap();

        let _b = UnixListener::bind(task_dir.join("b.sock")).unwrap();
        let _a = UnixListener::bind(task_dir.join("a.sock")).unwrap();
        std::fs::write(task_dir.join("notes.txt"), b"not a socket").unwrap();
        std::fs::create_dir(task_dir.join("subdir")).unwrap();

        let registry = SocketDirRegistry::new(dir.path());
        let endpoints = registry.discover("ping").await.unwrap();

        let ids: Vec<_> = endpoints.iter().map(|e| e.provider_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(endpoints.iter().all(|e| e.task == "ping"));
    }

    #[tokio::test]
    async fn test_discovery_sees_changes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let task_dir = dir.path().join("ping");
        std::fs::create_dir_all(&task_dir).unwrap();
        let registry = SocketDirRegistry::new(dir.path());

        assert!(registry.discover("ping").await.unwrap().is_empty());
        let _listener = UnixListener::bind(task_dir.join("p1.sock")).unwrap();
        assert_eq!(registry.discover("ping").await.unwrap().len(), 1);
        std::fs::remove_file(task_dir.join("p1.sock")).unwrap();
        assert!(registry.discover("ping").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_task_path_is_discovery_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the task directory should be
        std::fs::write(dir.path().join("ping"), b"").unwrap();

        let registry = SocketDirRegistry::new(dir.path());
        let err = registry.discover("ping").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DiscoveryUnavailable);
    }

    #[tokio::test]
    async fn test_escaping_task_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SocketDirRegistry::new(dir.path());
        for task in ["../etc", "a/b", "..", "coordinator", "response", "streams", ""] {
            let err = registry.discover(task).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedRequest, "task {:?}", task);
        }
    }

    #[tokio::test]
    async fn test_memory_registry() {
        let registry = MemoryRegistry::new();
        registry.add("ping", "p2", "/x/p2.sock");
        registry.add("ping", "p1", "/x/p1.sock");

        let ids: Vec<_> = registry
            .discover("ping")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.provider_id)
            .collect();
        assert_eq!(ids, vec!["p2", "p1"]);

        registry.remove("ping", "p2");
        assert_eq!(registry.discover("ping").await.unwrap().len(), 1);

        registry.set_unavailable(Some("down"));
        assert!(registry.discover("ping").await.is_err());
    }
}
