//! What the upload manager needs from the server side.

use super::{ClientResult, file::UploadFile, progress::ProgressTracker};
use crate::{
    models::upload::{
        AbortResponse, AccessLevel, ChunkRequest, ChunkResponse, CompleteResponse,
        InitializeRequest, InitializeResponse, ObjectResponse,
    },
    services::{StreamTarget, UploadService},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{TryStreamExt, stream::BoxStream};
use std::{io, sync::Arc};

/// Where the uploaded object should land.
#[derive(Debug, Clone)]
pub struct Destination {
    pub folder: String,
    pub access_level: AccessLevel,
}

/// Server operations behind the three strategies.
///
/// `direct_upload` and `stream_upload` send the whole file body and advance
/// `progress` as bytes leave the client.
#[async_trait]
pub trait UploadBackend: Send + Sync {
    async fn direct_upload(
        &self,
        user_id: &str,
        file: &UploadFile,
        destination: &Destination,
        progress: Arc<ProgressTracker>,
    ) -> ClientResult<ObjectResponse>;

    async fn initialize(
        &self,
        user_id: &str,
        request: InitializeRequest,
    ) -> ClientResult<InitializeResponse>;

    async fn upload_chunk(&self, user_id: &str, request: ChunkRequest)
    -> ClientResult<ChunkResponse>;

    async fn complete(&self, user_id: &str, session_id: &str) -> ClientResult<CompleteResponse>;

    async fn abort(&self, user_id: &str, session_id: &str) -> ClientResult<AbortResponse>;

    async fn stream_upload(
        &self,
        user_id: &str,
        file: &UploadFile,
        destination: &Destination,
        progress: Arc<ProgressTracker>,
    ) -> ClientResult<ObjectResponse>;
}

/// The file body, reporting every slice to `progress` as it is pulled.
pub(crate) fn tracked_body(
    file: &UploadFile,
    progress: Arc<ProgressTracker>,
) -> BoxStream<'static, io::Result<Bytes>> {
    Box::pin(
        file.byte_stream()
            .inspect_ok(move |chunk| progress.advance(chunk.len() as u64)),
    )
}

/// Calls an [`UploadService`] in the same process.
#[derive(Clone)]
pub struct LocalBackend {
    service: UploadService,
}

impl LocalBackend {
    pub fn new(service: UploadService) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &UploadService {
        &self.service
    }

    fn target(file: &UploadFile, destination: &Destination) -> StreamTarget {
        StreamTarget {
            file_name: file.name.clone(),
            content_type: file.content_type.clone(),
            folder: destination.folder.clone(),
            access_level: destination.access_level,
            declared_size: Some(file.size),
        }
    }
}

#[async_trait]
impl UploadBackend for LocalBackend {
    async fn direct_upload(
        &self,
        user_id: &str,
        file: &UploadFile,
        destination: &Destination,
        progress: Arc<ProgressTracker>,
    ) -> ClientResult<ObjectResponse> {
        let body = tracked_body(file, progress);
        Ok(self
            .service
            .direct_upload(user_id, Self::target(file, destination), body)
            .await?)
    }

    async fn initialize(
        &self,
        user_id: &str,
        request: InitializeRequest,
    ) -> ClientResult<InitializeResponse> {
        Ok(self.service.initialize(user_id, request).await?)
    }

    async fn upload_chunk(
        &self,
        user_id: &str,
        request: ChunkRequest,
    ) -> ClientResult<ChunkResponse> {
        Ok(self.service.upload_chunk(user_id, request).await?)
    }

    async fn complete(&self, user_id: &str, session_id: &str) -> ClientResult<CompleteResponse> {
        Ok(self.service.complete(user_id, session_id).await?)
    }

    async fn abort(&self, user_id: &str, session_id: &str) -> ClientResult<AbortResponse> {
        Ok(self.service.abort(user_id, session_id).await?)
    }

    async fn stream_upload(
        &self,
        user_id: &str,
        file: &UploadFile,
        destination: &Destination,
        progress: Arc<ProgressTracker>,
    ) -> ClientResult<ObjectResponse> {
        let body = tracked_body(file, progress);
        Ok(self
            .service
            .stream_upload(user_id, Self::target(file, destination), body)
            .await?)
    }
}
