use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::Request as HttpRequest;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::convert::Infallible;
use std::time::Duration;

use crate::protocol::error::{Result, SkeinError};

/// JSON-over-HTTP client used for `http://` response hooks.
///
/// Only plain HTTP is supported; an `https://` hook parses but delivery
/// fails with a transport error.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    /// POSTs `body` as JSON to `url` and returns the response body.
    ///
    /// Any non-2xx status is reported as [`SkeinError::Transport`].
    pub async fn post_json<T: Serialize>(&self, url: &str, body: &T, timeout: Duration) -> Result<Bytes> {
        let payload = serde_json::to_vec(body)?;

        let http_request = HttpRequest::builder()
            .method("POST")
            .uri(url)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| SkeinError::Transport(format!("Failed to build request: {}", e)))?;

        let fut = async {
            let response = self
                .client
                .request(http_request)
                .await
                .map_err(|e| SkeinError::Transport(format!("HTTP request to {} failed: {}", url, e)))?;

            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| SkeinError::Transport(format!("Failed to read response: {}", e)))?
                .to_bytes();

            if !status.is_success() {
                return Err(SkeinError::Transport(format!("{} answered with status {}", url, status)));
            }
            Ok(body)
        };

        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| SkeinError::Timeout(timeout.as_millis() as u64))?
    }
}

/// POSTs `chunks` to `url` as one streamed request body.
///
/// There is no overall deadline: the request lasts as long as the stream.
pub async fn post_stream<S>(url: &str, chunks: S) -> Result<()>
where
    S: Stream<Item = Bytes> + Send + 'static,
{
    let body = chunks.map(|chunk| Ok::<_, Infallible>(Frame::data(chunk)));
    let http_request = HttpRequest::builder()
        .method("POST")
        .uri(url)
        .header("Content-Type", "application/octet-stream")
        .body(StreamBody::new(Box::pin(body)))
        .map_err(|e| SkeinError::Transport(format!("Failed to build request: {}", e)))?;

    let client = Client::builder(TokioExecutor::new()).build_http();
    let response = client
        .request(http_request)
        .await
        .map_err(|e| SkeinError::Transport(format!("Stream POST to {} failed: {}", url, e)))?;

    if !response.status().is_success() {
        return Err(SkeinError::Transport(format!(
            "{} answered stream POST with status {}",
            url,
            response.status()
        )));
    }
    Ok(())
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}
