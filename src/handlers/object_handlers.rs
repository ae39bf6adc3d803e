//! Read-back of stored objects, for local development against the disk store.
//! Streams object bodies to avoid buffering in memory.
//!
//! Keys follow `{access}/products/{user}/...`. Public objects are readable by
//! anyone, protected objects by any signed-in caller, private objects (and
//! keys outside that layout) only by the owning user.

use crate::{
    errors::AppError,
    handlers::auth::AuthUser,
    models::{object::StoredObject, upload::AccessLevel},
    services::UploadService,
    store::StoreError,
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use tokio_util::io::ReaderStream;

fn read_error(key: &str, err: StoreError) -> AppError {
    match err {
        StoreError::NoSuchKey(_) | StoreError::InvalidKey => {
            AppError::not_found(format!("object `{}` not found", key))
        }
        other => AppError::new(StatusCode::BAD_GATEWAY, other.to_string()),
    }
}

/// Check `caller` may read `key`. Runs before the store is touched, so a
/// refused caller learns nothing about whether the object exists.
fn ensure_readable(key: &str, caller: Option<&AuthUser>) -> Result<(), AppError> {
    let mut segments = key.split('/');
    let access = segments.next().and_then(|s| s.parse::<AccessLevel>().ok());
    if access == Some(AccessLevel::Public) {
        return Ok(());
    }
    let Some(AuthUser(user_id)) = caller else {
        return Err(AppError::new(StatusCode::UNAUTHORIZED, "Unauthorized"));
    };
    if access == Some(AccessLevel::Protected) {
        return Ok(());
    }
    let owner = match (segments.next(), segments.next()) {
        (Some("products"), Some(owner)) => Some(owner),
        _ => None,
    };
    if access == Some(AccessLevel::Private) && owner == Some(user_id.as_str()) {
        Ok(())
    } else {
        Err(AppError::new(StatusCode::FORBIDDEN, "Forbidden"))
    }
}

/// `GET /objects/{*key}` as a streaming response.
pub async fn get_object(
    State(service): State<UploadService>,
    caller: Option<AuthUser>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    ensure_readable(&key, caller.as_ref())?;
    let (meta, reader) = service
        .store
        .read_object(&key)
        .await
        .map_err(|err| read_error(&key, err))?;
    let body = Body::from_stream(ReaderStream::new(reader));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// `HEAD /objects/{*key}`: same headers as GET but no body.
pub async fn head_object(
    State(service): State<UploadService>,
    caller: Option<AuthUser>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    ensure_readable(&key, caller.as_ref())?;
    let (meta, _reader) = service
        .store
        .read_object(&key)
        .await
        .map_err(|err| read_error(&key, err))?;
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, meta: &StoredObject) {
    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size));

    let quoted = format!("\"{}\"", meta.etag);
    if let Ok(value) = HeaderValue::from_str(&quoted) {
        headers.insert(header::ETAG, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> Option<AuthUser> {
        Some(AuthUser(id.to_string()))
    }

    fn status(key: &str, caller: Option<AuthUser>) -> StatusCode {
        match ensure_readable(key, caller.as_ref()) {
            Ok(()) => StatusCode::OK,
            Err(err) => err.status,
        }
    }

    #[test]
    fn access_follows_the_key_prefix() {
        let public = "public/products/u1/images/a.png";
        let protected = "protected/products/u1/images/a.png";
        let private = "private/products/u1/documents/a.pdf";

        assert_eq!(status(public, None), StatusCode::OK);
        assert_eq!(status(protected, None), StatusCode::UNAUTHORIZED);
        assert_eq!(status(protected, user("u2")), StatusCode::OK);
        assert_eq!(status(private, None), StatusCode::UNAUTHORIZED);
        assert_eq!(status(private, user("u2")), StatusCode::FORBIDDEN);
        assert_eq!(status(private, user("u1")), StatusCode::OK);
        assert_eq!(status("scratch/a.bin", user("u1")), StatusCode::FORBIDDEN);
    }
}
