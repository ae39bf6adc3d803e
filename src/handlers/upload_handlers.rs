//! HTTP handlers for the upload protocol.
//!
//! JSON routes map one-to-one onto `UploadService` phases. The direct and
//! stream routes hand the request body to the service as a byte stream so
//! nothing here buffers a whole file.

use crate::{
    errors::AppError,
    handlers::auth::AuthUser,
    models::upload::{
        AbortResponse, AccessLevel, ChunkRequest, ChunkResponse, CompleteResponse,
        DirectUploadQuery, InitializeRequest, InitializeResponse, ObjectResponse, SessionRequest,
        StatusResponse, default_folder,
    },
    policy::{UploadPolicy, guess_content_type},
    services::{StreamTarget, UploadService},
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, header},
};
use futures::StreamExt;
use std::io;
use tracing::debug;

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| AppError::bad_request(rejection.body_text()))
}

/// `GET /api/uploads/policy`: the thresholds clients should apply.
pub async fn get_policy(State(service): State<UploadService>) -> Json<UploadPolicy> {
    Json(service.policy.as_ref().clone())
}

/// `POST /api/uploads/multipart/initialize`
pub async fn initialize_upload(
    State(service): State<UploadService>,
    AuthUser(user_id): AuthUser,
    payload: Result<Json<InitializeRequest>, JsonRejection>,
) -> Result<Json<InitializeResponse>, AppError> {
    let request = json_body(payload)?;
    Ok(Json(service.initialize(&user_id, request).await?))
}

/// `POST /api/uploads/multipart/chunk`
pub async fn upload_chunk(
    State(service): State<UploadService>,
    AuthUser(user_id): AuthUser,
    payload: Result<Json<ChunkRequest>, JsonRejection>,
) -> Result<Json<ChunkResponse>, AppError> {
    let request = json_body(payload)?;
    Ok(Json(service.upload_chunk(&user_id, request).await?))
}

/// `POST /api/uploads/multipart/complete`
pub async fn complete_upload(
    State(service): State<UploadService>,
    AuthUser(user_id): AuthUser,
    payload: Result<Json<SessionRequest>, JsonRejection>,
) -> Result<Json<CompleteResponse>, AppError> {
    let request = json_body(payload)?;
    Ok(Json(service.complete(&user_id, &request.session_id).await?))
}

/// `POST /api/uploads/multipart/abort`
pub async fn abort_upload(
    State(service): State<UploadService>,
    AuthUser(user_id): AuthUser,
    payload: Result<Json<SessionRequest>, JsonRejection>,
) -> Result<Json<AbortResponse>, AppError> {
    let request = json_body(payload)?;
    Ok(Json(service.abort(&user_id, &request.session_id).await?))
}

/// `GET /api/uploads/multipart/{session_id}/status`
pub async fn upload_status(
    State(service): State<UploadService>,
    AuthUser(user_id): AuthUser,
    Path(session_id): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    Ok(Json(service.status(&user_id, &session_id).await?))
}

/// `PUT /api/uploads/direct?fileName=&folder=&accessLevel=`, raw body.
pub async fn direct_upload(
    State(service): State<UploadService>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<DirectUploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<ObjectResponse>, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| guess_content_type(&query.file_name).to_string());
    let declared_size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let target = StreamTarget {
        file_name: query.file_name,
        content_type,
        folder: query.folder,
        access_level: query.access_level.unwrap_or_default(),
        declared_size,
    };
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(|err| io::Error::new(io::ErrorKind::Other, err)));

    Ok(Json(service.direct_upload(&user_id, target, stream).await?))
}

/// `POST /api/uploads/stream`, multipart form.
///
/// Text fields (`folder`, `accessLevel`, `fileSize`) must precede the `file`
/// field; the file is streamed to the service as soon as it is reached.
pub async fn stream_upload(
    State(service): State<UploadService>,
    AuthUser(user_id): AuthUser,
    mut multipart: Multipart,
) -> Result<Json<ObjectResponse>, AppError> {
    let mut folder = default_folder();
    let mut access_level = AccessLevel::default();
    let mut declared_size = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(err.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "folder" => {
                folder = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(err.body_text()))?;
            }
            "accessLevel" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(err.body_text()))?;
                access_level = raw.parse().map_err(AppError::bad_request)?;
            }
            "fileSize" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(err.body_text()))?;
                declared_size = Some(
                    raw.trim()
                        .parse::<u64>()
                        .map_err(|_| AppError::bad_request("fileSize must be an integer"))?,
                );
            }
            "file" => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| AppError::bad_request("file field has no file name"))?;
                let content_type = field
                    .content_type()
                    .map(str::to_string)
                    .unwrap_or_else(|| guess_content_type(&file_name).to_string());
                let target = StreamTarget {
                    file_name,
                    content_type,
                    folder,
                    access_level,
                    declared_size,
                };
                let stream = field
                    .map(|chunk| chunk.map_err(|err| io::Error::new(io::ErrorKind::Other, err)));
                return Ok(Json(service.stream_upload(&user_id, target, stream).await?));
            }
            other => debug!("ignoring form field `{}`", other),
        }
    }

    Err(AppError::bad_request(
        "multipart form is missing the `file` field",
    ))
}
