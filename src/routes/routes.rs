//! Defines routes for the upload service.
//!
//! ## Structure
//! - **Health**
//!   - `GET  /healthz`, `GET /readyz`
//!
//! - **Multipart session protocol** (JSON, `x-user-id` required)
//!   - `POST /api/uploads/multipart/initialize`
//!   - `POST /api/uploads/multipart/chunk`
//!   - `POST /api/uploads/multipart/complete`
//!   - `POST /api/uploads/multipart/abort`
//!   - `GET  /api/uploads/multipart/{session_id}/status`
//!
//! - **Whole-file routes** (`x-user-id` required)
//!   - `PUT  /api/uploads/direct` (raw body)
//!   - `POST /api/uploads/stream` (multipart form)
//!
//! - **Policy and read-back**
//!   - `GET  /api/uploads/policy`
//!   - `GET|HEAD /objects/{*key}`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{get_object, head_object},
        upload_handlers::{
            abort_upload, complete_upload, direct_upload, get_policy, initialize_upload,
            stream_upload, upload_chunk, upload_status,
        },
    },
    services::UploadService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// Slack on top of a base64-encoded chunk for the JSON envelope.
const CHUNK_BODY_SLACK: usize = 64 * 1024;

/// Largest JSON body the chunk route has to accept for `service`'s policy.
pub fn chunk_body_limit(service: &UploadService) -> usize {
    let max_chunk = usize::try_from(service.policy.max_chunk_size()).unwrap_or(usize::MAX);
    max_chunk
        .saturating_add(2)
        .saturating_div(3)
        .saturating_mul(4)
        .saturating_add(CHUNK_BODY_SLACK)
}

/// Build and return the router for all upload routes.
///
/// The chunk route gets a body limit sized to the largest base64 chunk; the
/// direct and stream routes lift the limit and are capped by the service.
pub fn routes(service: &UploadService) -> Router<UploadService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/uploads/policy", get(get_policy))
        // session protocol
        .route("/api/uploads/multipart/initialize", post(initialize_upload))
        .route(
            "/api/uploads/multipart/chunk",
            post(upload_chunk).layer(DefaultBodyLimit::max(chunk_body_limit(service))),
        )
        .route("/api/uploads/multipart/complete", post(complete_upload))
        .route("/api/uploads/multipart/abort", post(abort_upload))
        .route(
            "/api/uploads/multipart/{session_id}/status",
            get(upload_status),
        )
        // whole-file routes
        .route(
            "/api/uploads/direct",
            put(direct_upload).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/api/uploads/stream",
            post(stream_upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/objects/{*key}", get(get_object).head(head_object))
}

/// Router with its state attached, ready to serve.
pub fn build_router(service: UploadService) -> Router {
    routes(&service).with_state(service)
}
