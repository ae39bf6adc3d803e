//! Liveness and readiness probes.
//!
//! `/healthz` never touches a backend. `/readyz` pings the session store and
//! round-trips a tiny object through the object store.

use crate::services::UploadService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::io::AsyncReadExt;
use tracing::warn;
use uuid::Uuid;

const PROBE_BODY: &[u8] = b"readyz";

#[derive(Serialize)]
struct Probe {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    checks: Option<BTreeMap<&'static str, CheckStatus>>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn from_result(result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self {
                ok: true,
                error: None,
            },
            Err(error) => Self {
                ok: false,
                error: Some(error),
            },
        }
    }
}

/// `GET /healthz`
pub async fn healthz() -> impl IntoResponse {
    Json(Probe {
        status: "ok",
        checks: None,
    })
}

/// `GET /readyz`: 200 when every backend answers, 503 otherwise.
pub async fn readyz(State(service): State<UploadService>) -> impl IntoResponse {
    let sessions = service
        .sessions
        .ping()
        .await
        .map_err(|e| format!("session store unreachable: {}", e));
    let store = probe_store(&service).await;

    let checks = BTreeMap::from([
        ("sessions", CheckStatus::from_result(sessions)),
        ("object_store", CheckStatus::from_result(store)),
    ]);
    let ready = checks.values().all(|check| check.ok);
    if !ready {
        warn!("readiness probe failed");
    }

    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = Probe {
        status: if ready { "ok" } else { "error" },
        checks: Some(checks),
    };
    (code, Json(body))
}

/// Write, read back and delete a probe object.
async fn probe_store(service: &UploadService) -> Result<(), String> {
    let key = format!(".readyz/{}", Uuid::new_v4());
    service
        .store
        .put_object(&key, None, Bytes::from_static(PROBE_BODY))
        .await
        .map_err(|e| format!("could not write probe object: {}", e))?;

    let read_back = async {
        let (_, mut reader) = service
            .store
            .read_object(&key)
            .await
            .map_err(|e| format!("could not open probe object: {}", e))?;
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .await
            .map_err(|e| format!("could not read probe object: {}", e))?;
        if bytes == PROBE_BODY {
            Ok(())
        } else {
            Err("probe content mismatch".to_string())
        }
    }
    .await;

    // Leftover probe objects are harmless; only log a failed cleanup.
    if let Err(e) = service.store.delete_object(&key).await {
        warn!("could not remove probe object {}: {}", key, e);
    }
    read_back
}
