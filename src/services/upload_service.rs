//! src/services/upload_service.rs
//!
//! UploadService: the session-oriented multipart protocol layered over an
//! [`ObjectStore`]. Four phases (initialize, upload chunk, complete, abort)
//! plus a read-only status query. The session registry is the only state the
//! phases share.

use crate::{
    codec::{self, CodecError},
    models::{
        multipart::UploadSession,
        upload::{
            AbortResponse, AccessLevel, ChunkRequest, ChunkResponse, CompleteResponse,
            InitializeRequest, InitializeResponse, StatusResponse,
        },
    },
    policy::{MAX_PARTS, PolicyViolation, UploadPolicy},
    sessions::{SessionStore, SessionStoreError},
    store::{ObjectStore, StoreError},
};
use axum::http::StatusCode;
use chrono::{Duration as ChronoDuration, Utc};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Unauthorized")]
    Unauthenticated,
    #[error("Unauthorized access to upload session")]
    NotSessionOwner,
    #[error("Upload session not found or expired")]
    SessionNotFound,
    #[error("No parts uploaded")]
    NoParts,
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Policy(#[from] PolicyViolation),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Session store error: {0}")]
    Sessions(#[from] SessionStoreError),
}

impl UploadError {
    /// HTTP status this error is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::Unauthenticated => StatusCode::UNAUTHORIZED,
            UploadError::NotSessionOwner => StatusCode::FORBIDDEN,
            UploadError::SessionNotFound => StatusCode::NOT_FOUND,
            UploadError::NoParts => StatusCode::CONFLICT,
            UploadError::Invalid(_) | UploadError::Codec(_) => StatusCode::BAD_REQUEST,
            UploadError::Policy(PolicyViolation::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::Policy(
                PolicyViolation::UnsupportedType(_) | PolicyViolation::FolderMismatch { .. },
            ) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            UploadError::Policy(_) => StatusCode::BAD_REQUEST,
            UploadError::Store(StoreError::InvalidPart { .. } | StoreError::InvalidKey) => {
                StatusCode::BAD_REQUEST
            }
            UploadError::Store(_) => StatusCode::BAD_GATEWAY,
            UploadError::Sessions(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type ServiceResult<T> = Result<T, UploadError>;

/// Bucket coordinates used to build public URLs.
#[derive(Clone, Debug)]
pub struct StorageLocation {
    pub bucket: String,
    pub region: String,
}

impl StorageLocation {
    pub fn public_url(&self, key: &str) -> String {
        format!(
            "https://{}.s3.{}.amazonaws.com/{}",
            self.bucket, self.region, key
        )
    }
}

/// Retry schedule for the compensating abort after a failed completion.
#[derive(Clone, Copy, Debug)]
pub struct CompensationPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

/// Longest pause between two compensating abort attempts.
const MAX_COMPENSATION_DELAY: Duration = Duration::from_secs(10);

impl CompensationPolicy {
    /// Backoff before retry number `attempt + 1`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(MAX_COMPENSATION_DELAY)
    }
}

impl Default for CompensationPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// UploadService drives the four-phase multipart protocol plus the direct
/// and streaming routes (see `stream_service.rs`).
#[derive(Clone)]
pub struct UploadService {
    pub store: Arc<dyn ObjectStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub policy: Arc<UploadPolicy>,
    pub location: StorageLocation,
    /// Sessions older than this are swept on the next `initialize`.
    pub session_ttl: ChronoDuration,
    pub compensation: CompensationPolicy,
}

impl UploadService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        sessions: Arc<dyn SessionStore>,
        location: StorageLocation,
    ) -> Self {
        Self {
            store,
            sessions,
            policy: Arc::new(UploadPolicy::default()),
            location,
            session_ttl: ChronoDuration::hours(24),
            compensation: CompensationPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: UploadPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn with_session_ttl(mut self, ttl: ChronoDuration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_compensation(mut self, compensation: CompensationPolicy) -> Self {
        self.compensation = compensation;
        self
    }

    /// Destination key: `{access}/products/{user}/{folder}/{uuid}{.ext}`.
    pub fn object_key(
        &self,
        user_id: &str,
        folder: &str,
        access: AccessLevel,
        file_name: &str,
    ) -> String {
        let ext = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(|ext| format!(".{}", ext))
            .unwrap_or_default();
        format!(
            "{}/products/{}/{}/{}{}",
            access.as_str(),
            user_id,
            folder,
            Uuid::new_v4(),
            ext
        )
    }

    /// Drop sessions past their TTL and release their store-side uploads.
    async fn sweep_expired(&self) -> ServiceResult<()> {
        let cutoff = Utc::now() - self.session_ttl;
        let swept = self.sessions.sweep_expired(cutoff).await?;
        for session in swept {
            info!(
                session_id = %session.session_id,
                upload_id = %session.upload_id,
                "swept expired upload session"
            );
            if let Err(err) = self
                .store
                .abort_multipart_upload(&session.key, &session.upload_id)
                .await
            {
                debug!(
                    "abort of expired upload {} failed: {}",
                    session.upload_id, err
                );
            }
        }
        Ok(())
    }

    /// Load a session and check that `user_id` owns it.
    async fn owned_session(&self, user_id: &str, session_id: &str) -> ServiceResult<UploadSession> {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or(UploadError::SessionNotFound)?;
        if !session.is_owned_by(user_id) {
            warn!(session_id, user_id, "upload session owner mismatch");
            return Err(UploadError::NotSessionOwner);
        }
        Ok(session)
    }

    /// Phase 1: validate, open a store-side multipart upload, register a session.
    #[instrument(skip(self, request), fields(file = %request.file_name, size = request.file_size))]
    pub async fn initialize(
        &self,
        user_id: &str,
        request: InitializeRequest,
    ) -> ServiceResult<InitializeResponse> {
        ensure_user(user_id)?;
        // Every initialize sweeps, rejected ones included.
        self.sweep_expired().await?;

        if request.file_name.trim().is_empty() {
            return Err(UploadError::Invalid("fileName is required".into()));
        }
        self.policy
            .validate_for_folder(request.file_size, &request.file_type, &request.folder)?;

        let (chunk_size, total_chunks) = self.policy.chunk_plan(request.file_size);
        if total_chunks > MAX_PARTS {
            return Err(UploadError::Invalid(format!(
                "file would need {} parts, more than the {} allowed",
                total_chunks, MAX_PARTS
            )));
        }

        let access = request.access_level.unwrap_or_default();
        let key = self.object_key(user_id, &request.folder, access, &request.file_name);
        let upload_id = self
            .store
            .create_multipart_upload(&key, Some(&request.file_type))
            .await?;

        let session = UploadSession {
            session_id: Uuid::new_v4().to_string(),
            upload_id: upload_id.clone(),
            key: key.clone(),
            user_id: user_id.to_string(),
            content_type: request.file_type.clone(),
            file_size: request.file_size,
            chunk_size,
            total_chunks,
            parts: BTreeMap::new(),
            created_at: Utc::now(),
        };
        let session_id = session.session_id.clone();
        if let Err(err) = self.sessions.insert(session).await {
            // Do not leave a store-side upload nobody can reach.
            if let Err(abort_err) = self.store.abort_multipart_upload(&key, &upload_id).await {
                warn!("abort after failed session insert failed: {}", abort_err);
            }
            return Err(err.into());
        }

        info!(%session_id, %upload_id, chunk_size, total_chunks, "initialized multipart upload");
        Ok(InitializeResponse {
            success: true,
            session_id,
            upload_id,
            key,
            chunk_size,
            total_chunks,
            bucket_name: self.location.bucket.clone(),
            region: self.location.region.clone(),
        })
    }

    /// Phase 2: forward one decoded part to the store and record its ETag.
    #[instrument(
        skip(self, request),
        fields(session_id = %request.session_id, part = request.part_number)
    )]
    pub async fn upload_chunk(
        &self,
        user_id: &str,
        request: ChunkRequest,
    ) -> ServiceResult<ChunkResponse> {
        ensure_user(user_id)?;
        let session = self.owned_session(user_id, &request.session_id).await?;

        let part_number = request.part_number;
        if part_number == 0 || part_number > session.total_chunks {
            return Err(UploadError::Invalid(format!(
                "partNumber must be between 1 and {}",
                session.total_chunks
            )));
        }
        let body = codec::decode_chunk(&request.base64_data)?;
        if body.len() as u64 > session.chunk_size {
            return Err(UploadError::Invalid(format!(
                "chunk of {} bytes exceeds the session chunk size of {}",
                body.len(),
                session.chunk_size
            )));
        }

        let etag = self
            .store
            .upload_part(&session.key, &session.upload_id, part_number, body)
            .await?;
        let parts_uploaded = self
            .sessions
            .record_part(&session.session_id, part_number, &etag)
            .await?
            .ok_or(UploadError::SessionNotFound)?;

        debug!(part_number, parts_uploaded, "uploaded chunk");
        Ok(ChunkResponse {
            success: true,
            chunk_number: part_number,
            etag,
            parts_uploaded,
        })
    }

    /// Phase 3: claim the session, then ask the store to stitch the parts.
    ///
    /// The session is removed before the store call, so a concurrent
    /// duplicate sees "session not found". A failed completion triggers the
    /// compensating abort.
    #[instrument(skip(self))]
    pub async fn complete(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> ServiceResult<CompleteResponse> {
        ensure_user(user_id)?;
        let session = self.owned_session(user_id, session_id).await?;
        if session.ordered_parts().is_empty() {
            return Err(UploadError::NoParts);
        }

        let session = self
            .sessions
            .take(session_id)
            .await?
            .ok_or(UploadError::SessionNotFound)?;
        // Parts recorded between the check and the claim are included here.
        let parts = session.ordered_parts();

        match self
            .store
            .complete_multipart_upload(&session.key, &session.upload_id, &parts)
            .await
        {
            Ok(object) => {
                let url = self.location.public_url(&object.key);
                info!(
                    key = %object.key,
                    size = object.size,
                    parts = parts.len(),
                    "completed multipart upload"
                );
                Ok(CompleteResponse {
                    success: true,
                    location: url.clone(),
                    url,
                    key: object.key,
                })
            }
            Err(err) => {
                warn!("completing upload {} failed: {}", session.upload_id, err);
                self.compensate(&session).await;
                Err(err.into())
            }
        }
    }

    /// Compensating action for a failed completion: abort the store-side
    /// upload with bounded retries. Failures here are logged only.
    async fn compensate(&self, session: &UploadSession) {
        let attempts = self.compensation.attempts.max(1);
        for attempt in 0..attempts {
            match self
                .store
                .abort_multipart_upload(&session.key, &session.upload_id)
                .await
            {
                Ok(()) => {
                    info!(upload_id = %session.upload_id, "compensating abort succeeded");
                    return;
                }
                Err(StoreError::NoSuchUpload(_)) => return,
                Err(err) => {
                    warn!(
                        upload_id = %session.upload_id,
                        "compensating abort attempt {}/{} failed: {}",
                        attempt + 1,
                        attempts,
                        err
                    );
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.compensation.delay(attempt)).await;
                    }
                }
            }
        }
    }

    /// Phase 4: abort. Unknown sessions are a successful no-op.
    #[instrument(skip(self))]
    pub async fn abort(&self, user_id: &str, session_id: &str) -> ServiceResult<AbortResponse> {
        ensure_user(user_id)?;
        let Some(existing) = self.sessions.get(session_id).await? else {
            debug!("abort of unknown session is a no-op");
            return Ok(AbortResponse { success: true });
        };
        if !existing.is_owned_by(user_id) {
            return Err(UploadError::NotSessionOwner);
        }

        // Another caller may have claimed it since the lookup.
        let Some(session) = self.sessions.take(session_id).await? else {
            return Ok(AbortResponse { success: true });
        };
        match self
            .store
            .abort_multipart_upload(&session.key, &session.upload_id)
            .await
        {
            Ok(()) | Err(StoreError::NoSuchUpload(_)) => {
                info!(upload_id = %session.upload_id, "aborted multipart upload");
                Ok(AbortResponse { success: true })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Ask the store which parts it already holds.
    #[instrument(skip(self))]
    pub async fn status(&self, user_id: &str, session_id: &str) -> ServiceResult<StatusResponse> {
        ensure_user(user_id)?;
        let session = self.owned_session(user_id, session_id).await?;
        let parts = self
            .store
            .list_parts(&session.key, &session.upload_id)
            .await?;
        Ok(StatusResponse {
            success: true,
            upload_id: session.upload_id,
            key: session.key,
            parts_uploaded: parts.len(),
            parts,
        })
    }
}

pub(crate) fn ensure_user(user_id: &str) -> ServiceResult<()> {
    if user_id.trim().is_empty() {
        Err(UploadError::Unauthenticated)
    } else {
        Ok(())
    }
}
