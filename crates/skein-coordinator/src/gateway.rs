//! Inbound gateway
//!
//! Requests enter the coordinator either over HTTP or over the internal
//! Unix socket. Both paths share [`Gateway::handle`], and both answer
//! straight away with a provisional response: an acknowledgment when a
//! provider took the request, or the reason nobody did. The task's real
//! outcome only ever travels through the tracker to the request's hook.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use bytes::Bytes;
use skein_common::protocol::error::Result;
use skein_common::protocol::{Request, Response};
use skein_common::transport::{JsonCodec, UnixServer, UnixServerHandle};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::relay::StreamRelay;
use crate::router::ProxyRouter;

pub struct Gateway {
    router: Arc<ProxyRouter>,
}

impl Gateway {
    pub fn new(router: Arc<ProxyRouter>) -> Self {
        Self { router }
    }

    /// Validates and dispatches one request, returning the provisional
    /// response for the caller.
    pub async fn handle(&self, mut request: Request) -> Response {
        let id = request.ensure_id().clone();
        if let Err(e) = request.validate() {
            debug!("Rejecting request {}: {}", id, e);
            return Response::from_error(id, &e);
        }

        debug!("Dispatching request {} for task '{}'", id, request.task);
        match self.router.dispatch(request).await {
            Ok(()) => Response::ack(id),
            Err(e) => {
                warn!("Request {} not dispatched: {}", id, e);
                Response::from_error(id, &e)
            }
        }
    }

    /// Builds the external HTTP application, relay included.
    ///
    /// # Routes
    /// - `POST /` - submit a request
    /// - `GET /__health` - liveness probe
    /// - `/stream/...` - stream relay
    pub fn http_app(self: Arc<Self>, relay: Arc<StreamRelay>) -> axum::Router {
        axum::Router::new()
            .route("/", axum::routing::post(handle_request))
            .route("/__health", axum::routing::get(health_check))
            .with_state(self)
            .merge(relay.router())
            .layer(TraceLayer::new_for_http())
    }

    /// Starts the internal listener at `path`.
    pub fn serve_internal(self: Arc<Self>, path: impl Into<PathBuf>) -> Result<UnixServerHandle> {
        let server = UnixServer::bind(path)?;
        Ok(server.spawn(move |request: Request| {
            let gateway = self.clone();
            async move { gateway.handle(request).await }
        }))
    }
}

/// Handles request submissions.
///
/// Always answers 200: failures are reported inside the JSON response so
/// both transports look the same to callers.
async fn handle_request(State(gateway): State<Arc<Gateway>>, body: Bytes) -> Json<Response> {
    match JsonCodec::decode_request(&body) {
        Ok(request) => Json(gateway.handle(request).await),
        Err(e) => {
            debug!("Malformed request body: {}", e);
            Json(Response::from_error(String::new(), &e))
        }
    }
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
