//! HTTP ingress for UPnP event notifications.
//!
//! Renderers POST (well: NOTIFY) their LastChange documents to
//! `/Dlna/Eventing/{id}`. The endpoint answers 200 no matter what: a
//! confused renderer that gets errors back will only retry harder.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::any;
use axum::Router;

use crate::registry::SessionRegistry;

/// Router fragment the host application mounts on its HTTP server.
pub fn eventing_router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/Dlna/Eventing/{id}", any(handle_notify))
        .with_state(registry)
}

async fn handle_notify(
    State(registry): State<Arc<SessionRegistry>>,
    Path(id): Path<String>,
    body: Bytes,
) -> StatusCode {
    // Reconciliation talks SOAP (renewals, media probes); keep it off the
    // async workers.
    tokio::task::spawn_blocking(move || {
        let text = String::from_utf8_lossy(&body);
        registry.dispatch_event(&id, &text);
    });
    StatusCode::OK
}
