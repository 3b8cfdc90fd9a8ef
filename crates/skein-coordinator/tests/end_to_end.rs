//! End-to-end tests
//!
//! A real coordinator and a real provider share a temporary socket
//! namespace. Requests go in over HTTP or the internal socket and final
//! responses come back on a caller-owned Unix hook.

use bytes::Bytes;
use futures_util::stream;
use serde_json::json;
use skein_client::SkeinClient;
use skein_common::namespace;
use skein_common::protocol::{ErrorKind, Hook, Request, Response, SkeinError};
use skein_common::transport::{UnixServer, UnixServerHandle};
use skein_coordinator::{Coordinator, CoordinatorConfig};
use skein_provider::{push_stream, LocalStream, ProviderConfig, ProviderServer, TaskOutput};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

const PROVIDER_ID: &str = "p1";

const BULK_CHUNKS: usize = 200;
const BULK_CHUNK_LEN: usize = 64 * 1024;

struct Harness {
    dir: tempfile::TempDir,
    coordinator: Coordinator,
    provider: ProviderServer,
    addr: SocketAddr,
}

impl Harness {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = CoordinatorConfig {
            socket_dir: dir.path().to_path_buf(),
            external_addr: "127.0.0.1:0".parse().unwrap(),
            request_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(50),
            drain_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let coordinator = Coordinator::new(config).unwrap();
        let addr = coordinator.start().await.unwrap();

        let mut provider = ProviderServer::new(ProviderConfig::new(dir.path(), PROVIDER_ID)).unwrap();
        register_tasks(&mut provider, dir.path());
        provider.start().await.unwrap();

        Self {
            dir,
            coordinator,
            provider,
            addr,
        }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    async fn post(&self, body: serde_json::Value) -> Response {
        reqwest::Client::new()
            .post(self.url())
            .json(&body)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn stop(mut self) {
        self.provider.stop().await;
        self.coordinator.stop().await;
    }
}

fn register_tasks(provider: &mut ProviderServer, socket_dir: &Path) {
    provider
        .register_typed("ping", |_args: serde_json::Value| async move { Ok(json!({"pong": true})) })
        .unwrap();

    provider
        .register_typed("slow", |_args: serde_json::Value| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(json!({"done": true}))
        })
        .unwrap();

    let stream_dir = socket_dir.to_path_buf();
    provider
        .register_task("dump", move |request: Request| {
            let path = namespace::stream_socket(&stream_dir, PROVIDER_ID, &request.id);
            async move {
                let local = LocalStream::bind(path?)?;
                let url = local.url();
                let chunks = stream::iter(vec![Bytes::from("hello\n"), Bytes::from("world\n")]);
                tokio::spawn(local.serve(chunks, Duration::from_secs(5)));
                Ok::<_, SkeinError>(TaskOutput::stream(url))
            }
        })
        .unwrap();

    provider
        .register_task("export", |request: Request| async move {
            let url = request
                .stream_url
                .clone()
                .ok_or(SkeinError::MissingField("stream_url"))?;
            let chunks = stream::iter(vec![Bytes::from("chunk-1;"), Bytes::from("chunk-2;")]);
            push_stream(&url, chunks).await?;
            Ok::<_, SkeinError>(TaskOutput::stream(url))
        })
        .unwrap();

    provider
        .register_task("bulk", |request: Request| async move {
            let url = request
                .stream_url
                .clone()
                .ok_or(SkeinError::MissingField("stream_url"))?;
            let chunks = stream::iter((0..BULK_CHUNKS).map(|_| Bytes::from(vec![b'x'; BULK_CHUNK_LEN])));
            push_stream(&url, chunks).await?;
            Ok::<_, SkeinError>(TaskOutput::stream(url))
        })
        .unwrap();
}

/// Leaves a socket file nobody listens on.
fn dead_provider(socket_dir: &Path, task: &str) {
    let path = namespace::provider_socket(socket_dir, task, "a-dead");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
}

/// Caller-side hook collecting every delivered response.
fn hook_receiver(path: PathBuf) -> (UnixServerHandle, mpsc::UnboundedReceiver<Response>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = UnixServer::bind(path).unwrap().spawn(move |response: Response| {
        let tx = tx.clone();
        async move {
            let id = response.id.clone();
            let _ = tx.send(response);
            Response::ack(id)
        }
    });
    (handle, rx)
}

async fn next_response(rx: &mut mpsc::UnboundedReceiver<Response>) -> Response {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no response delivered")
        .unwrap()
}

#[tokio::test]
async fn test_http_request_resolves_to_hook() {
    let harness = Harness::start().await;
    let hook_path = harness.path().join("hooks").join("caller.sock");
    let (_hook, mut rx) = hook_receiver(hook_path.clone());

    let ack = harness
        .post(json!({"task": "ping", "response_hook": Hook::unix_url(&hook_path)}))
        .await;
    assert!(!ack.id.is_empty());
    assert!(ack.error.is_none());
    assert!(ack.result.is_none());

    let response = next_response(&mut rx).await;
    assert_eq!(response.id, ack.id);
    assert_eq!(response.result, Some(json!({"pong": true})));
    assert_eq!(harness.coordinator.tracker().pending(), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_unknown_task_is_refused_synchronously() {
    let harness = Harness::start().await;

    let ack = harness.post(json!({"task": "zfs.destroy"})).await;
    assert_eq!(ack.error.unwrap().kind, ErrorKind::NoProvidersAvailable);

    let ack = harness.post(json!({"args": {}})).await;
    assert_eq!(ack.error.unwrap().kind, ErrorKind::MissingField);

    harness.stop().await;
}

#[tokio::test]
async fn test_fails_over_past_dead_provider() {
    let harness = Harness::start().await;

    // sorts before the live provider and refuses connections
    dead_provider(harness.path(), "ping");

    let hook_path = harness.path().join("hooks").join("failover.sock");
    let (_hook, mut rx) = hook_receiver(hook_path.clone());

    let ack = harness
        .post(json!({"task": "ping", "response_hook": Hook::unix_url(&hook_path)}))
        .await;
    assert!(ack.error.is_none());
    assert_eq!(next_response(&mut rx).await.result, Some(json!({"pong": true})));

    harness.stop().await;
}

#[tokio::test]
async fn test_all_providers_dead_reports_unreachable() {
    let harness = Harness::start().await;
    dead_provider(harness.path(), "fsck");

    let ack = harness.post(json!({"task": "fsck"})).await;
    assert_eq!(ack.error.unwrap().kind, ErrorKind::AllProvidersUnreachable);
    assert_eq!(harness.coordinator.tracker().pending(), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_local_stream_is_reachable_through_relay() {
    let harness = Harness::start().await;
    let hook_path = harness.path().join("hooks").join("dump.sock");
    let (_hook, mut rx) = hook_receiver(hook_path.clone());

    harness
        .post(json!({"task": "dump", "response_hook": Hook::unix_url(&hook_path)}))
        .await;
    let response = next_response(&mut rx).await;

    let stream_url = response.stream_url.unwrap();
    assert!(stream_url.starts_with(&format!("{}/stream?addr=", harness.url())));

    let body = reqwest::get(&stream_url).await.unwrap().text().await.unwrap();
    assert_eq!(body, "hello\nworld\n");

    harness.stop().await;
}

#[tokio::test]
async fn test_pushed_stream_is_forwarded_to_caller() {
    let harness = Harness::start().await;
    let hook_path = harness.path().join("hooks").join("export.sock");
    let (_hook, mut rx) = hook_receiver(hook_path.clone());

    let sink_path = harness.path().join("hooks").join("sink.sock");
    let sink = tokio::net::UnixListener::bind(&sink_path).unwrap();
    let reader = tokio::spawn(async move {
        let (mut socket, _) = sink.accept().await.unwrap();
        let mut data = String::new();
        socket.read_to_string(&mut data).await.unwrap();
        data
    });

    let ack = harness
        .post(json!({
            "task": "export",
            "response_hook": Hook::unix_url(&hook_path),
            "stream_url": Hook::unix_url(&sink_path),
        }))
        .await;
    assert!(ack.error.is_none());

    let response = next_response(&mut rx).await;
    assert_eq!(response.stream_url, Some(Hook::unix_url(&sink_path)));

    let data = tokio::time::timeout(Duration::from_secs(5), reader).await.unwrap().unwrap();
    assert_eq!(data, "chunk-1;chunk-2;");

    harness.stop().await;
}

#[tokio::test]
async fn test_large_push_completes_before_response() {
    let harness = Harness::start().await;
    let hook_path = harness.path().join("hooks").join("bulk.sock");
    let (_hook, mut rx) = hook_receiver(hook_path.clone());

    let sink_path = harness.path().join("hooks").join("bulk-sink.sock");
    let sink = tokio::net::UnixListener::bind(&sink_path).unwrap();
    let reader = tokio::spawn(async move {
        let (mut socket, _) = sink.accept().await.unwrap();
        let mut data = Vec::new();
        socket.read_to_end(&mut data).await.unwrap();
        data
    });

    let ack = harness
        .post(json!({
            "task": "bulk",
            "response_hook": Hook::unix_url(&hook_path),
            "stream_url": Hook::unix_url(&sink_path),
            "timeout_ms": 20000,
        }))
        .await;
    assert!(ack.error.is_none());

    let response = next_response(&mut rx).await;
    assert!(response.error.is_none(), "push failed: {:?}", response.error);
    assert_eq!(response.stream_url, Some(Hook::unix_url(&sink_path)));

    let data = tokio::time::timeout(Duration::from_secs(10), reader).await.unwrap().unwrap();
    assert_eq!(data.len(), BULK_CHUNKS * BULK_CHUNK_LEN);
    assert!(data.iter().all(|b| *b == b'x'));

    harness.stop().await;
}

#[tokio::test]
async fn test_hostile_request_id_is_refused() {
    let harness = Harness::start().await;

    let ack = harness.post(json!({"id": "../../../victim", "task": "dump"})).await;
    assert_eq!(ack.error.unwrap().kind, ErrorKind::MalformedRequest);
    assert_eq!(harness.coordinator.tracker().pending(), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_slow_task_times_out_once() {
    let harness = Harness::start().await;
    let hook_path = harness.path().join("hooks").join("slow.sock");
    let (_hook, mut rx) = hook_receiver(hook_path.clone());

    let ack = harness
        .post(json!({
            "task": "slow",
            "response_hook": Hook::unix_url(&hook_path),
            "timeout_ms": 200,
        }))
        .await;
    assert!(ack.error.is_none());

    let response = next_response(&mut rx).await;
    assert_eq!(response.id, ack.id);
    assert_eq!(response.error.unwrap().kind, ErrorKind::Timeout);

    // a late outcome from the provider is dropped
    let late = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
    assert!(late.is_err());
    assert!(!harness.coordinator.tracker().is_tracking(&ack.id));

    harness.stop().await;
}

#[tokio::test]
async fn test_client_calls_over_both_entry_points() {
    let harness = Harness::start().await;

    let internal = SkeinClient::internal(harness.path(), "coordinator")
        .unwrap()
        .with_hook_dir(harness.path().join("client"));
    let response = internal.call("ping", json!({})).await.unwrap();
    assert_eq!(response.result, Some(json!({"pong": true})));

    let external = SkeinClient::external(harness.url())
        .unwrap()
        .with_hook_dir(harness.path().join("client"));
    let response = external.call("ping", json!({})).await.unwrap();
    assert_eq!(response.result, Some(json!({"pong": true})));

    let err = external.call("missing", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoProvidersAvailable);

    harness.stop().await;
}

#[tokio::test]
async fn test_health_endpoint() {
    let harness = Harness::start().await;
    let status = reqwest::get(format!("{}/__health", harness.url())).await.unwrap().status();
    assert!(status.is_success());
    harness.stop().await;
}
