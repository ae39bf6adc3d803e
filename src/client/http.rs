//! [`UploadBackend`] over the service's HTTP routes.

use super::{
    ClientError, ClientResult,
    backend::{Destination, UploadBackend, tracked_body},
    file::UploadFile,
    progress::ProgressTracker,
};
use crate::{
    handlers::auth::USER_ID_HEADER,
    models::upload::{
        AbortResponse, ChunkRequest, ChunkResponse, CompleteResponse, DirectUploadQuery,
        ErrorResponse, InitializeRequest, InitializeResponse, ObjectResponse, SessionRequest,
    },
    policy::UploadPolicy,
};
use async_trait::async_trait;
use reqwest::{
    Body, Client, Response,
    header::{CONTENT_LENGTH, CONTENT_TYPE},
    multipart::{Form, Part},
};
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    /// `base_url` is the service root, e.g. `http://127.0.0.1:3000`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// The policy the server enforces; pass it to `UploadManager::with_policy`.
    pub async fn fetch_policy(&self) -> ClientResult<UploadPolicy> {
        let resp = self.client.get(self.url("/api/uploads/policy")).send().await?;
        decode(resp).await
    }

    async fn post_json<B, T>(&self, path: &str, user_id: &str, body: &B) -> ClientResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        debug!("POST {}", path);
        let resp = self
            .client
            .post(self.url(path))
            .header(USER_ID_HEADER, user_id)
            .json(body)
            .send()
            .await?;
        decode(resp).await
    }
}

/// Decode a success body, or turn the service's error body into
/// [`ClientError::Server`].
async fn decode<T: DeserializeOwned>(resp: Response) -> ClientResult<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json::<T>().await?);
    }
    let message = match resp.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
    };
    Err(ClientError::Server {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl UploadBackend for HttpBackend {
    async fn direct_upload(
        &self,
        user_id: &str,
        file: &UploadFile,
        destination: &Destination,
        progress: Arc<ProgressTracker>,
    ) -> ClientResult<ObjectResponse> {
        let query = DirectUploadQuery {
            file_name: file.name.clone(),
            folder: destination.folder.clone(),
            access_level: Some(destination.access_level),
        };
        let resp = self
            .client
            .put(self.url("/api/uploads/direct"))
            .query(&query)
            .header(USER_ID_HEADER, user_id)
            .header(CONTENT_TYPE, file.content_type.as_str())
            .header(CONTENT_LENGTH, file.size)
            .body(Body::wrap_stream(tracked_body(file, progress)))
            .send()
            .await?;
        decode(resp).await
    }

    async fn initialize(
        &self,
        user_id: &str,
        request: InitializeRequest,
    ) -> ClientResult<InitializeResponse> {
        self.post_json("/api/uploads/multipart/initialize", user_id, &request)
            .await
    }

    async fn upload_chunk(
        &self,
        user_id: &str,
        request: ChunkRequest,
    ) -> ClientResult<ChunkResponse> {
        self.post_json("/api/uploads/multipart/chunk", user_id, &request)
            .await
    }

    async fn complete(&self, user_id: &str, session_id: &str) -> ClientResult<CompleteResponse> {
        let body = SessionRequest {
            session_id: session_id.to_string(),
        };
        self.post_json("/api/uploads/multipart/complete", user_id, &body)
            .await
    }

    async fn abort(&self, user_id: &str, session_id: &str) -> ClientResult<AbortResponse> {
        let body = SessionRequest {
            session_id: session_id.to_string(),
        };
        self.post_json("/api/uploads/multipart/abort", user_id, &body)
            .await
    }

    async fn stream_upload(
        &self,
        user_id: &str,
        file: &UploadFile,
        destination: &Destination,
        progress: Arc<ProgressTracker>,
    ) -> ClientResult<ObjectResponse> {
        let body = Body::wrap_stream(tracked_body(file, progress));
        let part = Part::stream_with_length(body, file.size)
            .file_name(file.name.clone())
            .mime_str(&file.content_type)?;
        // Text fields go first: the server reads them before the file.
        let form = Form::new()
            .text("folder", destination.folder.clone())
            .text("accessLevel", destination.access_level.as_str())
            .text("fileSize", file.size.to_string())
            .part("file", part);

        let resp = self
            .client
            .post(self.url("/api/uploads/stream"))
            .header(USER_ID_HEADER, user_id)
            .multipart(form)
            .send()
            .await?;
        decode(resp).await
    }
}
