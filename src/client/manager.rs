//! UploadManager picks a strategy per file and reduces every outcome to one
//! [`UploadResult`].
//!
//! - **Direct** (below `direct_threshold`): one request with the whole body.
//! - **Multipart**: the four-phase session protocol, one base64 chunk per
//!   request, parts uploaded in ascending order with at most `concurrency`
//!   in flight.
//! - **Streaming** (at or above `streaming_threshold`): the whole body goes to
//!   the streaming route, which picks single-shot or multipart on its own.
//!
//! `cancel()` stops the active upload: the streaming and direct requests are
//! dropped, a multipart upload finishes its in-flight chunks, starts no more
//! and releases the remote session.

use super::{
    ClientError, ClientResult,
    backend::{Destination, UploadBackend},
    file::UploadFile,
    progress::{ProgressCallback, ProgressTracker, UploadProgress},
};
use crate::{
    codec::{self, ChunkRange},
    models::upload::{
        AccessLevel, ChunkRequest, InitializeRequest, UploadResult, default_folder,
    },
    policy::{UploadMethod, UploadPolicy},
};
use futures::{StreamExt, TryStreamExt, stream};
use std::{
    fmt,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PART_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

pub type ErrorCallback = Arc<dyn Fn(&ClientError) + Send + Sync>;
pub type CompleteCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Per-call options for [`UploadManager::upload`].
#[derive(Clone)]
pub struct UploadOptions {
    pub folder: String,
    pub access_level: AccessLevel,
    /// Use the session protocol whatever the file size.
    pub force_multipart: bool,
    /// Parts in flight at once. `1` uploads strictly one after another.
    pub concurrency: usize,
    /// Extra attempts per part after a retryable failure.
    pub part_retries: u32,
    pub on_progress: Option<ProgressCallback>,
    pub on_error: Option<ErrorCallback>,
    /// Called with `(url, key)`.
    pub on_complete: Option<CompleteCallback>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            folder: default_folder(),
            access_level: AccessLevel::default(),
            force_multipart: false,
            concurrency: 1,
            part_retries: 0,
            on_progress: None,
            on_error: None,
            on_complete: None,
        }
    }
}

impl fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadOptions")
            .field("folder", &self.folder)
            .field("access_level", &self.access_level)
            .field("force_multipart", &self.force_multipart)
            .field("concurrency", &self.concurrency)
            .field("part_retries", &self.part_retries)
            .finish_non_exhaustive()
    }
}

impl UploadOptions {
    pub fn folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = folder.into();
        self
    }

    pub fn access_level(mut self, access_level: AccessLevel) -> Self {
        self.access_level = access_level;
        self
    }

    pub fn force_multipart(mut self, force: bool) -> Self {
        self.force_multipart = force;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn part_retries(mut self, retries: u32) -> Self {
        self.part_retries = retries;
        self
    }

    pub fn on_progress(
        mut self,
        callback: impl Fn(UploadProgress) + Send + Sync + 'static,
    ) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&ClientError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn on_complete(mut self, callback: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(callback));
        self
    }
}

/// State of one upload that `cancel()` can reach.
struct UploadHandle {
    token: CancellationToken,
    /// `(user_id, session_id)` while a remote session is open and nobody has
    /// claimed it for completion or abort.
    session: Mutex<Option<(String, String)>>,
}

impl UploadHandle {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            session: Mutex::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<(String, String)>> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the session visible to `cancel()`. Returns false when the upload
    /// was cancelled first.
    fn register(&self, user_id: &str, session_id: &str) -> bool {
        let mut session = self.lock();
        if self.token.is_cancelled() {
            return false;
        }
        *session = Some((user_id.to_string(), session_id.to_string()));
        true
    }

    /// Take the session for completion. Returns false when cancelled.
    fn claim(&self) -> bool {
        let mut session = self.lock();
        if self.token.is_cancelled() {
            return false;
        }
        *session = None;
        true
    }

    /// Take the session for abort, unless `cancel()` already did.
    fn release(&self) -> Option<(String, String)> {
        self.lock().take()
    }

    fn cancel(&self) -> Option<(String, String)> {
        let mut session = self.lock();
        self.token.cancel();
        session.take()
    }
}

/// Where a successful upload ended up.
struct Uploaded {
    url: String,
    key: String,
}

pub struct UploadManager<B> {
    backend: Arc<B>,
    policy: UploadPolicy,
    active: Mutex<Option<Arc<UploadHandle>>>,
}

impl<B: UploadBackend> UploadManager<B> {
    pub fn new(backend: B) -> Self {
        Self::from_arc(Arc::new(backend))
    }

    pub fn from_arc(backend: Arc<B>) -> Self {
        Self {
            backend,
            policy: UploadPolicy::default(),
            active: Mutex::new(None),
        }
    }

    /// Use thresholds published by the server instead of the built-in ones.
    pub fn with_policy(mut self, policy: UploadPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Upload `file` on behalf of `user_id`.
    ///
    /// Never fails: every error is reported once through `on_error` and
    /// returned as an unsuccessful result.
    pub async fn upload(
        &self,
        file: &UploadFile,
        user_id: &str,
        options: UploadOptions,
    ) -> UploadResult {
        let started = Instant::now();
        let method = self.policy.select_strategy(file.size, options.force_multipart);
        let tracker = Arc::new(ProgressTracker::new(file.size, options.on_progress.clone()));

        let outcome = match self.policy.validate_file(file.size, &file.content_type) {
            Err(violation) => Err(ClientError::Validation(violation)),
            Ok(()) => {
                let handle = self.begin();
                debug!(file = %file.name, size = file.size, %method, "starting upload");
                let outcome = self
                    .run(method, file, user_id, &options, &handle, tracker.clone())
                    .await;
                self.end(&handle);
                outcome
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(uploaded) => {
                tracker.finish();
                if let Some(callback) = &options.on_complete {
                    callback(&uploaded.url, &uploaded.key);
                }
                info!(key = %uploaded.key, %method, duration_ms, "upload finished");
                UploadResult {
                    success: true,
                    url: Some(uploaded.url),
                    key: Some(uploaded.key),
                    error: None,
                    method,
                    duration_ms,
                }
            }
            Err(err) => {
                warn!(file = %file.name, %method, "upload failed: {}", err);
                if let Some(callback) = &options.on_error {
                    callback(&err);
                }
                UploadResult {
                    success: false,
                    url: None,
                    key: None,
                    error: Some(err.to_string()),
                    method,
                    duration_ms,
                }
            }
        }
    }

    /// Cancel the active upload, if any.
    ///
    /// An open multipart session is aborted here; the upload itself returns
    /// "Upload cancelled" once its in-flight work settles. The manager forgets
    /// the upload, so the next `upload` starts clean.
    pub async fn cancel(&self) {
        let Some(handle) = self.lock_active().take() else {
            return;
        };
        if let Some((user_id, session_id)) = handle.cancel() {
            info!(%session_id, "cancelling multipart upload");
            self.abort_quietly(&user_id, &session_id).await;
        }
    }

    async fn run(
        &self,
        method: UploadMethod,
        file: &UploadFile,
        user_id: &str,
        options: &UploadOptions,
        handle: &UploadHandle,
        tracker: Arc<ProgressTracker>,
    ) -> ClientResult<Uploaded> {
        let destination = Destination {
            folder: options.folder.clone(),
            access_level: options.access_level,
        };
        let token = &handle.token;
        match method {
            UploadMethod::Direct => {
                let request = self
                    .backend
                    .direct_upload(user_id, file, &destination, tracker);
                let object = tokio::select! {
                    _ = token.cancelled() => return Err(ClientError::Cancelled),
                    object = request => object?,
                };
                Ok(Uploaded {
                    url: object.url,
                    key: object.key,
                })
            }
            UploadMethod::Streaming => {
                let request = self
                    .backend
                    .stream_upload(user_id, file, &destination, tracker);
                let object = tokio::select! {
                    _ = token.cancelled() => return Err(ClientError::Cancelled),
                    object = request => object?,
                };
                Ok(Uploaded {
                    url: object.url,
                    key: object.key,
                })
            }
            UploadMethod::Multipart => {
                self.multipart(file, user_id, options, handle, &tracker)
                    .await
            }
        }
    }

    async fn multipart(
        &self,
        file: &UploadFile,
        user_id: &str,
        options: &UploadOptions,
        handle: &UploadHandle,
        tracker: &ProgressTracker,
    ) -> ClientResult<Uploaded> {
        let init = self
            .backend
            .initialize(
                user_id,
                InitializeRequest {
                    file_name: file.name.clone(),
                    file_type: file.content_type.clone(),
                    file_size: file.size,
                    folder: options.folder.clone(),
                    access_level: Some(options.access_level),
                },
            )
            .await?;
        let session_id = init.session_id.clone();

        if !handle.register(user_id, &session_id) {
            self.abort_quietly(user_id, &session_id).await;
            return Err(ClientError::Cancelled);
        }

        let ranges: Vec<ChunkRange> = codec::chunk_ranges(file.size, init.chunk_size).collect();
        if ranges.len() != init.total_chunks as usize {
            warn!(
                expected = init.total_chunks,
                planned = ranges.len(),
                "chunk count differs from the server's plan"
            );
        }
        debug!(%session_id, chunks = ranges.len(), chunk_size = init.chunk_size, "uploading parts");

        let backend = &*self.backend;
        let token = &handle.token;
        let retries = options.part_retries;
        let session = session_id.as_str();
        let uploaded: ClientResult<Vec<u32>> = stream::iter(ranges)
            .map(|range| async move {
                if token.is_cancelled() {
                    return Err(ClientError::Cancelled);
                }
                let chunk = file.read_range(range.offset, range.len).await?;
                upload_part(backend, user_id, session, range.part_number, &chunk, retries, token)
                    .await?;
                tracker.advance(range.len);
                Ok::<u32, ClientError>(range.part_number)
            })
            .buffer_unordered(options.concurrency.max(1))
            .try_collect()
            .await;

        if let Err(err) = uploaded {
            if let Some((user_id, session_id)) = handle.release() {
                self.abort_quietly(&user_id, &session_id).await;
            }
            return Err(if token.is_cancelled() {
                ClientError::Cancelled
            } else {
                err
            });
        }

        // Once claimed, a cancel can no longer reach the session and the
        // server owns any cleanup after a failed completion.
        if !handle.claim() {
            return Err(ClientError::Cancelled);
        }
        let done = self.backend.complete(user_id, &session_id).await?;
        Ok(Uploaded {
            url: done.url,
            key: done.key,
        })
    }

    fn begin(&self) -> Arc<UploadHandle> {
        let handle = Arc::new(UploadHandle::new());
        if self.lock_active().replace(handle.clone()).is_some() {
            debug!("replacing the handle of an upload that is still running");
        }
        handle
    }

    /// Forget `handle`, unless a newer upload already replaced it.
    fn end(&self, handle: &Arc<UploadHandle>) {
        let mut active = self.lock_active();
        if active
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            *active = None;
        }
    }

    async fn abort_quietly(&self, user_id: &str, session_id: &str) {
        if let Err(err) = self.backend.abort(user_id, session_id).await {
            warn!(%session_id, "abort of multipart session failed: {}", err);
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<Arc<UploadHandle>>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Send one part, retrying retryable failures with exponential backoff.
async fn upload_part<B: UploadBackend + ?Sized>(
    backend: &B,
    user_id: &str,
    session_id: &str,
    part_number: u32,
    chunk: &[u8],
    retries: u32,
    token: &CancellationToken,
) -> ClientResult<()> {
    let payload = codec::encode_chunk(chunk);
    let mut attempt = 0u32;
    loop {
        let request = ChunkRequest {
            session_id: session_id.to_string(),
            base64_data: payload.clone(),
            part_number,
        };
        match backend.upload_chunk(user_id, request).await {
            Ok(_) => return Ok(()),
            Err(err) if attempt < retries && err.is_retryable() && !token.is_cancelled() => {
                let delay = PART_RETRY_BASE_DELAY * 2u32.saturating_pow(attempt);
                warn!(part_number, attempt = attempt + 1, "part upload failed, retrying: {}", err);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
