//! Streamed task output.
//!
//! A handler can hand back its payload as a stream in one of two ways:
//!
//! - serve it on a provider-local socket ([`LocalStream`]) and return that
//!   socket's `unix://` URL; the coordinator makes it reachable through its
//!   relay
//! - push it to the `stream_url` the request carries ([`push_stream`])

use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use skein_common::protocol::error::{Result, SkeinError};
use skein_common::protocol::Hook;
use skein_common::transport::post_stream;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tracing::{debug, warn};

/// A one-shot stream served on a local socket.
///
/// The first connection receives every chunk; the socket file is removed
/// once the stream has been served or abandoned.
pub struct LocalStream {
    listener: UnixListener,
    path: PathBuf,
}

impl LocalStream {
    /// Binds the stream socket at `path`, replacing a stale socket left
    /// there. Any other kind of file at `path` is left alone and the bind
    /// fails.
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Ok(meta) = std::fs::symlink_metadata(&path) {
            if meta.file_type().is_socket() {
                std::fs::remove_file(&path)?;
            }
        }
        let listener = UnixListener::bind(&path)
            .map_err(|e| SkeinError::Transport(format!("Failed to bind to {}: {}", path.display(), e)))?;
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The address to return from a handler.
    pub fn url(&self) -> String {
        Hook::unix_url(&self.path)
    }

    /// Waits up to `accept_timeout` for a reader and writes every chunk to
    /// it. Returns the number of bytes written.
    pub async fn serve<S>(self, chunks: S, accept_timeout: Duration) -> Result<u64>
    where
        S: Stream<Item = Bytes>,
    {
        let result = self.write_all(chunks, accept_timeout).await;
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Failed to remove stream socket {}: {}", self.path.display(), e);
        }
        result
    }

    async fn write_all<S>(&self, chunks: S, accept_timeout: Duration) -> Result<u64>
    where
        S: Stream<Item = Bytes>,
    {
        let (mut socket, _) = tokio::time::timeout(accept_timeout, self.listener.accept())
            .await
            .map_err(|_| {
                warn!("Nobody collected stream {}", self.path.display());
                SkeinError::Timeout(accept_timeout.as_millis() as u64)
            })??;

        let mut chunks = std::pin::pin!(chunks);
        let mut total = 0u64;
        while let Some(chunk) = chunks.next().await {
            socket.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        socket.shutdown().await?;
        Ok(total)
    }
}

/// Pushes `chunks` to the stream URL a request carries.
pub async fn push_stream<S>(stream_url: &str, chunks: S) -> Result<()>
where
    S: Stream<Item = Bytes> + Send + 'static,
{
    match Hook::parse(stream_url)? {
        Hook::Http(url) => post_stream(&url, chunks).await,
        Hook::Unix(path) => {
            let mut socket = tokio::net::UnixStream::connect(&path)
                .await
                .map_err(|e| SkeinError::Transport(format!("Failed to connect to {}: {}", path.display(), e)))?;
            let mut chunks = std::pin::pin!(chunks);
            while let Some(chunk) = chunks.next().await {
                socket.write_all(&chunk).await?;
            }
            socket.shutdown().await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixStream;

    #[tokio::test]
    async fn test_local_stream_serves_first_reader() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalStream::bind(dir.path().join("streams").join("s1.sock")).unwrap();
        let path = local.path().to_path_buf();
        assert_eq!(local.url(), format!("unix://{}", path.display()));

        let chunks = stream::iter(vec![Bytes::from("line 1\n"), Bytes::from("line 2\n")]);
        let server = tokio::spawn(local.serve(chunks, Duration::from_secs(5)));

        let mut socket = UnixStream::connect(&path).await.unwrap();
        let mut data = String::new();
        socket.read_to_string(&mut data).await.unwrap();

        assert_eq!(data, "line 1\nline 2\n");
        assert_eq!(server.await.unwrap().unwrap(), 14);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_unclaimed_stream_times_out_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalStream::bind(dir.path().join("s2.sock")).unwrap();
        let path = local.path().to_path_buf();

        let err = local
            .serve(stream::iter(vec![Bytes::from("x")]), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SkeinError::Timeout(50)));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_bind_never_replaces_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("victim");
        std::fs::write(&path, b"keep me").unwrap();

        assert!(LocalStream::bind(&path).is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());

        let local = LocalStream::bind(&path).unwrap();
        assert_eq!(local.path(), path.as_path());
    }

    #[tokio::test]
    async fn test_push_stream_to_unix_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sink.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let reader = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut data = Vec::new();
            socket.read_to_end(&mut data).await.unwrap();
            data
        });

        push_stream(&Hook::unix_url(&path), stream::iter(vec![Bytes::from("ab"), Bytes::from("cd")]))
            .await
            .unwrap();
        assert_eq!(reader.await.unwrap(), b"abcd");
    }
}
