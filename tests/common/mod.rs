#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use media_upload::{
    models::{
        multipart::{CompletedPart, PartInfo},
        object::StoredObject,
    },
    policy::{ChunkTier, KIB, UploadPolicy},
    services::{CompensationPolicy, StorageLocation, UploadService},
    sessions::{MemorySessionStore, SessionStore},
    store::{MemoryObjectStore, ObjectReader, ObjectStore, StoreResult},
};
use std::{sync::Arc, time::Duration};

pub const USER: &str = "user-1";
pub const BUCKET: &str = "media";
pub const REGION: &str = "us-east-1";

pub struct Harness {
    pub service: UploadService,
    pub store: Arc<MemoryObjectStore>,
    pub sessions: Arc<MemorySessionStore>,
}

pub fn location() -> StorageLocation {
    StorageLocation {
        bucket: BUCKET.into(),
        region: REGION.into(),
    }
}

/// Service over in-memory stores with the production policy.
pub fn harness() -> Harness {
    let store = Arc::new(MemoryObjectStore::new());
    let sessions = Arc::new(MemorySessionStore::new());
    let service = UploadService::new(store.clone(), sessions.clone(), location())
        .with_compensation(CompensationPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        });
    Harness {
        service,
        store,
        sessions,
    }
}

/// Service over the given session store, with the production policy.
pub fn harness_with_sessions(
    sessions: Arc<dyn SessionStore>,
) -> (UploadService, Arc<MemoryObjectStore>) {
    let store = Arc::new(MemoryObjectStore::new());
    let service = UploadService::new(store.clone(), sessions, location());
    (service, store)
}

/// Like [`harness_with_sessions`], but the store yields to the scheduler
/// before completing, so concurrent `complete` calls interleave.
pub fn yielding_harness(
    sessions: Arc<dyn SessionStore>,
) -> (UploadService, Arc<MemoryObjectStore>) {
    let store = Arc::new(MemoryObjectStore::new());
    let yielding = Arc::new(YieldingStore(store.clone()));
    let service = UploadService::new(yielding, sessions, location());
    (service, store)
}

/// Delegates to a [`MemoryObjectStore`], yielding once before each
/// completion.
pub struct YieldingStore(pub Arc<MemoryObjectStore>);

#[async_trait]
impl ObjectStore for YieldingStore {
    fn backend_tag(&self) -> &'static str {
        "yielding-memory"
    }

    async fn put_object(
        &self,
        key: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> StoreResult<StoredObject> {
        self.0.put_object(key, content_type, body).await
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: Option<&str>,
    ) -> StoreResult<String> {
        self.0.create_multipart_upload(key, content_type).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StoreResult<String> {
        self.0.upload_part(key, upload_id, part_number, body).await
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StoreResult<StoredObject> {
        tokio::task::yield_now().await;
        self.0.complete_multipart_upload(key, upload_id, parts).await
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StoreResult<()> {
        self.0.abort_multipart_upload(key, upload_id).await
    }

    async fn list_parts(&self, key: &str, upload_id: &str) -> StoreResult<Vec<PartInfo>> {
        self.0.list_parts(key, upload_id).await
    }

    async fn read_object(&self, key: &str) -> StoreResult<(StoredObject, ObjectReader)> {
        self.0.read_object(key).await
    }

    async fn delete_object(&self, key: &str) -> StoreResult<()> {
        self.0.delete_object(key).await
    }
}

/// The production policy scaled down by 1024 so whole files fit in a test:
/// direct below 10 KiB, streaming from 500 KiB, 5/10/25/50 KiB chunks.
pub fn scaled_policy() -> UploadPolicy {
    UploadPolicy {
        max_file_size: 5 * 1024 * KIB,
        direct_threshold: 10 * KIB,
        streaming_threshold: 500 * KIB,
        stream_multipart_threshold: 100 * KIB,
        chunk_tiers: vec![
            ChunkTier {
                up_to: 100 * KIB,
                chunk_size: 5 * KIB,
            },
            ChunkTier {
                up_to: 500 * KIB,
                chunk_size: 10 * KIB,
            },
            ChunkTier {
                up_to: 1024 * KIB,
                chunk_size: 25 * KIB,
            },
        ],
        fallback_chunk_size: 50 * KIB,
        ..UploadPolicy::default()
    }
}

pub fn scaled_harness() -> Harness {
    let mut h = harness();
    h.service = h.service.with_policy(scaled_policy());
    h
}

/// Deterministic, non-repeating-looking payload.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 31 + i / 251) % 256) as u8)
        .collect()
}
