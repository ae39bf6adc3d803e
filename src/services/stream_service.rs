//! Direct and streaming uploads.
//!
//! Both routes receive the raw file body. The direct route buffers it and
//! writes the object in one call. The streaming route decides on its own,
//! from the shared policy, whether to write a single object or to drive a
//! store-managed multipart upload while bytes are still arriving.

use super::upload_service::{ServiceResult, UploadError, UploadService, ensure_user};
use crate::{
    models::{
        multipart::CompletedPart,
        upload::{AccessLevel, ObjectResponse, WriteMode},
    },
    policy::{self, PolicyViolation},
    store::StoreError,
};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, pin_mut};
use std::io;
use tracing::{debug, info, instrument, warn};

/// Describes the file carried by a direct or streaming request body.
#[derive(Debug, Clone)]
pub struct StreamTarget {
    pub file_name: String,
    pub content_type: String,
    pub folder: String,
    pub access_level: AccessLevel,
    /// Size announced by the client, if any. Only used to decide early.
    pub declared_size: Option<u64>,
}

/// Store-side multipart upload fed from a byte stream. Exists only once the
/// store has issued an upload id.
struct PartWriter {
    key: String,
    upload_id: String,
    chunk_size: usize,
    parts: Vec<CompletedPart>,
}

impl PartWriter {
    async fn open(
        service: &UploadService,
        key: &str,
        content_type: &str,
        chunk_size: usize,
    ) -> ServiceResult<Self> {
        let upload_id = service
            .store
            .create_multipart_upload(key, Some(content_type))
            .await?;
        Ok(Self {
            key: key.to_string(),
            upload_id,
            chunk_size,
            parts: Vec::new(),
        })
    }

    async fn flush_part(&mut self, service: &UploadService, body: Bytes) -> ServiceResult<()> {
        let part_number = self.parts.len() as u32 + 1;
        let etag = service
            .store
            .upload_part(&self.key, &self.upload_id, part_number, body)
            .await?;
        self.parts.push(CompletedPart { part_number, etag });
        Ok(())
    }

    /// Send every full part held in `buffer`.
    async fn drain_full_parts(
        &mut self,
        service: &UploadService,
        buffer: &mut BytesMut,
    ) -> ServiceResult<()> {
        while buffer.len() >= self.chunk_size {
            let part = buffer.split_to(self.chunk_size).freeze();
            self.flush_part(service, part).await?;
        }
        Ok(())
    }
}

impl UploadService {
    fn check_target(&self, user_id: &str, target: &StreamTarget) -> ServiceResult<()> {
        ensure_user(user_id)?;
        if target.file_name.trim().is_empty() {
            return Err(UploadError::Invalid("fileName is required".into()));
        }
        policy::ensure_folder_name(&target.folder)?;
        policy::ensure_type_for_folder(&target.content_type, &target.folder)?;
        if let Some(size) = target.declared_size {
            self.policy.ensure_size(size)?;
        }
        Ok(())
    }

    async fn abort_quietly(&self, writer: &PartWriter, context: &str) {
        if let Err(err) = self
            .store
            .abort_multipart_upload(&writer.key, &writer.upload_id)
            .await
        {
            warn!(upload_id = %writer.upload_id, "{} failed: {}", context, err);
        }
    }

    fn too_large(&self, size: u64, limit: u64) -> UploadError {
        UploadError::Policy(PolicyViolation::TooLarge {
            size,
            limit_label: policy::size_label(limit),
        })
    }

    /// Buffer the whole body and write it with one store call.
    ///
    /// Bodies are capped at the streaming route's multipart threshold; larger
    /// files belong on the multipart or streaming routes.
    #[instrument(skip(self, target, body), fields(file = %target.file_name))]
    pub async fn direct_upload<S>(
        &self,
        user_id: &str,
        target: StreamTarget,
        body: S,
    ) -> ServiceResult<ObjectResponse>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.check_target(user_id, &target)?;
        let limit = self
            .policy
            .stream_multipart_threshold
            .min(self.policy.max_file_size);
        if let Some(size) = target.declared_size.filter(|size| *size > limit) {
            return Err(self.too_large(size, limit));
        }

        let mut buffer = BytesMut::new();
        pin_mut!(body);
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(StoreError::Io)?;
            buffer.extend_from_slice(&chunk);
            if buffer.len() as u64 > limit {
                return Err(self.too_large(buffer.len() as u64, limit));
            }
        }
        if buffer.is_empty() {
            return Err(PolicyViolation::Empty.into());
        }

        let key = self.object_key(user_id, &target.folder, target.access_level, &target.file_name);
        let object = self
            .store
            .put_object(&key, Some(&target.content_type), buffer.freeze())
            .await?;
        info!(key = %object.key, size = object.size, "stored direct upload");
        Ok(ObjectResponse {
            success: true,
            url: self.location.public_url(&object.key),
            key: object.key,
            size: object.size,
            etag: object.etag,
            write_mode: WriteMode::Single,
        })
    }

    /// Stream a body into the store, switching to multipart once it reaches
    /// the policy's `stream_multipart_threshold` (or immediately, when the
    /// declared size already does).
    #[instrument(skip(self, target, body), fields(file = %target.file_name))]
    pub async fn stream_upload<S>(
        &self,
        user_id: &str,
        target: StreamTarget,
        body: S,
    ) -> ServiceResult<ObjectResponse>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.check_target(user_id, &target)?;
        let threshold = self.policy.stream_multipart_threshold;
        let max = self.policy.max_file_size;
        let multipart_from_start = target
            .declared_size
            .is_some_and(|size| size >= threshold);
        let chunk_size = self
            .policy
            .chunk_size_for(target.declared_size.unwrap_or(max));

        let key = self.object_key(
            user_id,
            &target.folder,
            target.access_level,
            &target.file_name,
        );
        let chunk_size = usize::try_from(chunk_size).unwrap_or(usize::MAX).max(1);
        let mut writer: Option<PartWriter> = None;
        let mut buffer = BytesMut::new();
        let mut total: u64 = 0;

        let streamed: ServiceResult<()> = async {
            if multipart_from_start {
                writer =
                    Some(PartWriter::open(self, &key, &target.content_type, chunk_size).await?);
            }
            pin_mut!(body);
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(StoreError::Io)?;
                total += chunk.len() as u64;
                if total > max {
                    return Err(self.too_large(total, max));
                }
                buffer.extend_from_slice(&chunk);

                if writer.is_none() && buffer.len() as u64 >= threshold {
                    debug!(total, "body reached multipart threshold");
                    writer =
                        Some(PartWriter::open(self, &key, &target.content_type, chunk_size).await?);
                }
                if let Some(writer) = writer.as_mut() {
                    writer.drain_full_parts(self, &mut buffer).await?;
                }
            }
            if total == 0 {
                return Err(PolicyViolation::Empty.into());
            }
            if let Some(writer) = writer.as_mut().filter(|_| !buffer.is_empty()) {
                let last = buffer.split().freeze();
                writer.flush_part(self, last).await?;
            }
            Ok(())
        }
        .await;

        if let Err(err) = streamed {
            if let Some(writer) = &writer {
                self.abort_quietly(writer, "abort of failed stream upload").await;
            }
            return Err(err);
        }

        if let Some(size) = target.declared_size.filter(|size| *size != total) {
            warn!(declared = size, received = total, "stream size differs from declared size");
        }

        let (object, write_mode) = match writer {
            Some(writer) => {
                match self
                    .store
                    .complete_multipart_upload(&key, &writer.upload_id, &writer.parts)
                    .await
                {
                    Ok(object) => (object, WriteMode::Multipart),
                    Err(err) => {
                        self.abort_quietly(&writer, "abort after failed completion").await;
                        return Err(err.into());
                    }
                }
            }
            None => (
                self.store
                    .put_object(&key, Some(&target.content_type), buffer.freeze())
                    .await?,
                WriteMode::Single,
            ),
        };

        info!(key = %object.key, size = object.size, mode = ?write_mode, "stored streamed upload");
        Ok(ObjectResponse {
            success: true,
            url: self.location.public_url(&object.key),
            key: object.key,
            size: object.size,
            etag: object.etag,
            write_mode,
        })
    }
}
