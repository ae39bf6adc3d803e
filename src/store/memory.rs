//! In-process object store. Keeps payloads in memory, counts every call and
//! can be told to fail specific operations, which makes it the store of
//! choice for tests and for embedding the upload service without a disk.

use super::{
    ObjectReader, ObjectStore, StoreError, StoreResult, check_completion_parts, ensure_key_safe,
    multipart_etag,
};
use crate::{
    codec,
    models::{
        multipart::{CompletedPart, PartInfo},
        object::StoredObject,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    io::Cursor,
    sync::Mutex,
};
use uuid::Uuid;

/// Operations that can be counted or made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    PutObject,
    CreateMultipartUpload,
    UploadPart,
    CompleteMultipartUpload,
    AbortMultipartUpload,
    ListParts,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    content_type: Option<String>,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: HashMap<String, (StoredObject, Bytes)>,
    uploads: HashMap<String, PendingUpload>,
    calls: HashMap<StoreOp, usize>,
    failing: HashSet<StoreOp>,
}

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    inner: Mutex<Inner>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `op` has been invoked, failed calls included.
    pub fn calls(&self, op: StoreOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    /// Make every subsequent `op` fail with a backend error.
    pub fn fail(&self, op: StoreOp) {
        self.lock().failing.insert(op);
    }

    pub fn recover(&self, op: StoreOp) {
        self.lock().failing.remove(&op);
    }

    pub fn pending_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    pub fn object_bytes(&self, key: &str) -> Option<Bytes> {
        self.lock().objects.get(key).map(|(_, body)| body.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the maps half-updated.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count the call and report an injected failure, if any.
    fn enter(&self, inner: &mut Inner, op: StoreOp) -> StoreResult<()> {
        *inner.calls.entry(op).or_default() += 1;
        if inner.failing.contains(&op) {
            return Err(StoreError::Backend(format!("injected failure for {:?}", op)));
        }
        Ok(())
    }
}

fn pending<'a>(
    inner: &'a mut Inner,
    key: &str,
    upload_id: &str,
) -> StoreResult<&'a mut PendingUpload> {
    match inner.uploads.get_mut(upload_id) {
        Some(upload) if upload.key == key => Ok(upload),
        _ => Err(StoreError::NoSuchUpload(upload_id.to_string())),
    }
}

fn list(upload: &PendingUpload) -> Vec<PartInfo> {
    upload
        .parts
        .iter()
        .map(|(part_number, (etag, body))| PartInfo {
            part_number: *part_number,
            etag: etag.clone(),
            size: body.len() as u64,
        })
        .collect()
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn backend_tag(&self) -> &'static str {
        "memory"
    }

    async fn put_object(
        &self,
        key: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> StoreResult<StoredObject> {
        let mut inner = self.lock();
        self.enter(&mut inner, StoreOp::PutObject)?;
        ensure_key_safe(key)?;
        let object = StoredObject {
            key: key.to_string(),
            etag: format!("{:x}", md5::compute(&body)),
            size: body.len() as u64,
            content_type: content_type.map(str::to_string),
        };
        inner
            .objects
            .insert(key.to_string(), (object.clone(), body));
        Ok(object)
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: Option<&str>,
    ) -> StoreResult<String> {
        let mut inner = self.lock();
        self.enter(&mut inner, StoreOp::CreateMultipartUpload)?;
        ensure_key_safe(key)?;
        let upload_id = Uuid::new_v4().simple().to_string();
        inner.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                content_type: content_type.map(str::to_string),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StoreResult<String> {
        let mut inner = self.lock();
        self.enter(&mut inner, StoreOp::UploadPart)?;
        if part_number == 0 {
            return Err(StoreError::InvalidPart {
                part_number,
                reason: "part numbers start at 1".into(),
            });
        }
        let upload = pending(&mut inner, key, upload_id)?;
        let etag = format!("{:x}", md5::compute(&body));
        upload.parts.insert(part_number, (etag.clone(), body));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StoreResult<StoredObject> {
        let mut inner = self.lock();
        self.enter(&mut inner, StoreOp::CompleteMultipartUpload)?;
        let upload = pending(&mut inner, key, upload_id)?;
        check_completion_parts(parts, &list(upload))?;

        let chunks = parts.iter().filter_map(|part| {
            upload
                .parts
                .get(&part.part_number)
                .map(|(_, body)| (part.part_number, body.clone()))
        });
        let body = codec::reassemble(chunks);
        let etags: Vec<String> = parts
            .iter()
            .map(|part| part.etag.trim_matches('"').to_string())
            .collect();
        let object = StoredObject {
            key: key.to_string(),
            etag: multipart_etag(&etags),
            size: body.len() as u64,
            content_type: upload.content_type.clone(),
        };
        inner.uploads.remove(upload_id);
        inner
            .objects
            .insert(key.to_string(), (object.clone(), body));
        Ok(object)
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        self.enter(&mut inner, StoreOp::AbortMultipartUpload)?;
        pending(&mut inner, key, upload_id)?;
        inner.uploads.remove(upload_id);
        Ok(())
    }

    async fn list_parts(&self, key: &str, upload_id: &str) -> StoreResult<Vec<PartInfo>> {
        let mut inner = self.lock();
        self.enter(&mut inner, StoreOp::ListParts)?;
        let upload = pending(&mut inner, key, upload_id)?;
        Ok(list(upload))
    }

    async fn read_object(&self, key: &str) -> StoreResult<(StoredObject, ObjectReader)> {
        let inner = self.lock();
        let (object, body) = inner
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NoSuchKey(key.to_string()))?;
        Ok((object, Box::pin(Cursor::new(body))))
    }

    async fn delete_object(&self, key: &str) -> StoreResult<()> {
        self.lock()
            .objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NoSuchKey(key.to_string()))
    }
}
