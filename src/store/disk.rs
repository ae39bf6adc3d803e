//! DiskObjectStore: a local stand-in for the remote object store.
//!
//! Object payloads are sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{key}` with a JSON metadata sidecar in a
//! parallel `.meta` tree. In-flight multipart uploads are staged under
//! `base_path/.multipart/{upload_id}/` as one file per part plus an `.etag`
//! sidecar, and stitched together in part-number order on completion.

use super::{
    ObjectReader, ObjectStore, StoreError, StoreResult, check_completion_parts, ensure_key_safe,
    multipart_etag,
};
use crate::models::{
    multipart::{CompletedPart, PartInfo},
    object::StoredObject,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const STAGING_DIR: &str = ".multipart";
const META_DIR: &str = ".meta";
const UPLOAD_MANIFEST: &str = "upload.json";

#[derive(Clone, Debug)]
pub struct DiskObjectStore {
    /// Base directory on disk where payloads and staging areas live.
    pub base_path: PathBuf,

    /// Bucket name; the first path segment beneath `base_path`.
    pub bucket: String,
}

/// Written next to staged parts so later calls can check the key.
#[derive(Serialize, Deserialize, Debug)]
struct UploadManifest {
    key: String,
    content_type: Option<String>,
    initiated_at: DateTime<Utc>,
}

impl DiskObjectStore {
    pub fn new(base_path: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            bucket: bucket.into(),
        }
    }

    fn bucket_root(&self) -> PathBuf {
        self.base_path.join(&self.bucket)
    }

    /// Two-level shard identifiers from MD5(bucket/key), as lowercase hex.
    fn object_shards(&self, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", self.bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = self.object_shards(key);
        self.bucket_root().join(shard_a).join(shard_b).join(key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = self.object_shards(key);
        self.bucket_root()
            .join(META_DIR)
            .join(shard_a)
            .join(shard_b)
            .join(format!("{}.json", key))
    }

    fn staging_path(&self, upload_id: &str) -> StoreResult<PathBuf> {
        let well_formed = !upload_id.is_empty()
            && upload_id
                .chars()
                .all(|c| c.is_ascii_hexdigit() || c == '-');
        if !well_formed {
            return Err(StoreError::NoSuchUpload(upload_id.to_string()));
        }
        Ok(self.base_path.join(STAGING_DIR).join(upload_id))
    }

    fn part_path(staging: &Path, part_number: u32) -> PathBuf {
        staging.join(format!("part-{:05}", part_number))
    }

    /// Load the staging manifest and confirm it belongs to `key`.
    async fn load_manifest(
        &self,
        key: &str,
        upload_id: &str,
    ) -> StoreResult<(PathBuf, UploadManifest)> {
        let staging = self.staging_path(upload_id)?;
        let raw = match fs::read(staging.join(UPLOAD_MANIFEST)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NoSuchUpload(upload_id.to_string()));
            }
            Err(err) => return Err(StoreError::Io(err)),
        };
        let manifest: UploadManifest = serde_json::from_slice(&raw)
            .map_err(|err| StoreError::Backend(format!("corrupt upload manifest: {}", err)))?;
        if manifest.key != key {
            return Err(StoreError::NoSuchUpload(upload_id.to_string()));
        }
        Ok((staging, manifest))
    }

    async fn write_meta(&self, object: &StoredObject) -> StoreResult<()> {
        let path = self.meta_path(&object.key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_vec(object)
            .map_err(|err| StoreError::Backend(format!("encoding object metadata: {}", err)))?;
        write_atomically(&path, &raw).await
    }

    /// Recursively remove empty directories up to `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for DiskObjectStore {
    fn backend_tag(&self) -> &'static str {
        "disk"
    }

    async fn put_object(
        &self,
        key: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> StoreResult<StoredObject> {
        ensure_key_safe(key)?;
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        write_atomically(&path, &body).await?;

        let object = StoredObject {
            key: key.to_string(),
            etag: format!("{:x}", md5::compute(&body)),
            size: body.len() as u64,
            content_type: content_type.map(str::to_string),
        };
        if let Err(err) = self.write_meta(&object).await {
            let _ = fs::remove_file(&path).await;
            return Err(err);
        }
        debug!(key, size = object.size, "stored object");
        Ok(object)
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: Option<&str>,
    ) -> StoreResult<String> {
        ensure_key_safe(key)?;
        let upload_id = Uuid::new_v4().simple().to_string();
        let staging = self.staging_path(&upload_id)?;
        fs::create_dir_all(&staging).await?;

        let manifest = UploadManifest {
            key: key.to_string(),
            content_type: content_type.map(str::to_string),
            initiated_at: Utc::now(),
        };
        let raw = serde_json::to_vec(&manifest)
            .map_err(|err| StoreError::Backend(format!("encoding upload manifest: {}", err)))?;
        if let Err(err) = write_atomically(&staging.join(UPLOAD_MANIFEST), &raw).await {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(err);
        }
        debug!(key, upload_id, "created multipart upload");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StoreResult<String> {
        if part_number == 0 {
            return Err(StoreError::InvalidPart {
                part_number,
                reason: "part numbers start at 1".into(),
            });
        }
        let (staging, _) = self.load_manifest(key, upload_id).await?;
        let part_path = Self::part_path(&staging, part_number);
        let etag = format!("{:x}", md5::compute(&body));

        write_atomically(&part_path, &body).await?;
        write_atomically(&part_path.with_extension("etag"), etag.as_bytes()).await?;
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StoreResult<StoredObject> {
        let (staging, manifest) = self.load_manifest(key, upload_id).await?;
        let stored = self.list_parts(key, upload_id).await?;
        check_completion_parts(parts, &stored)?;

        let path = self.object_path(key);
        let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let stitched = async {
            let mut out = File::create(&tmp_path).await?;
            let mut size = 0u64;
            for part in parts {
                let mut input = File::open(Self::part_path(&staging, part.part_number)).await?;
                size += tokio::io::copy(&mut input, &mut out).await?;
            }
            out.flush().await?;
            out.sync_all().await?;
            Ok::<u64, io::Error>(size)
        }
        .await;
        let size = match stitched {
            Ok(size) => size,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        };
        if let Err(err) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        let etags: Vec<String> = parts
            .iter()
            .map(|part| part.etag.trim_matches('"').to_string())
            .collect();
        let object = StoredObject {
            key: key.to_string(),
            etag: multipart_etag(&etags),
            size,
            content_type: manifest.content_type,
        };
        self.write_meta(&object).await?;

        if let Err(err) = fs::remove_dir_all(&staging).await {
            debug!("failed to remove staging dir {}: {}", staging.display(), err);
        }
        debug!(key, upload_id, size, parts = parts.len(), "completed multipart upload");
        Ok(object)
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StoreResult<()> {
        let (staging, _) = self.load_manifest(key, upload_id).await?;
        fs::remove_dir_all(&staging).await?;
        debug!(key, upload_id, "aborted multipart upload");
        Ok(())
    }

    async fn list_parts(&self, key: &str, upload_id: &str) -> StoreResult<Vec<PartInfo>> {
        let (staging, _) = self.load_manifest(key, upload_id).await?;
        let mut parts = Vec::new();
        let mut entries = fs::read_dir(&staging).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(number) = name
                .to_str()
                .and_then(|name| name.strip_prefix("part-"))
                .filter(|rest| !rest.contains('.'))
                .and_then(|rest| rest.parse::<u32>().ok())
            else {
                continue;
            };
            let etag_path = entry.path().with_extension("etag");
            let etag = match fs::read_to_string(&etag_path).await {
                Ok(etag) => etag.trim().to_string(),
                // Part written but its tag not yet; the store has not accepted it.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(StoreError::Io(err)),
            };
            let size = entry.metadata().await?.len();
            parts.push(PartInfo {
                part_number: number,
                etag,
                size,
            });
        }
        parts.sort_by_key(|part| part.part_number);
        Ok(parts)
    }

    async fn read_object(&self, key: &str) -> StoreResult<(StoredObject, ObjectReader)> {
        ensure_key_safe(key)?;
        let not_found = |err: io::Error| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::NoSuchKey(key.to_string())
            } else {
                StoreError::Io(err)
            }
        };
        let raw = fs::read(self.meta_path(key)).await.map_err(not_found)?;
        let object: StoredObject = serde_json::from_slice(&raw)
            .map_err(|err| StoreError::Backend(format!("corrupt object metadata: {}", err)))?;
        let file = File::open(self.object_path(key)).await.map_err(not_found)?;
        Ok((object, Box::pin(file)))
    }

    async fn delete_object(&self, key: &str) -> StoreResult<()> {
        ensure_key_safe(key)?;
        let path = self.object_path(key);
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed physical file {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NoSuchKey(key.to_string()));
            }
            Err(err) => return Err(StoreError::Io(err)),
        }
        let meta = self.meta_path(key);
        if let Err(err) = fs::remove_file(&meta).await {
            debug!("failed to remove metadata {}: {}", meta.display(), err);
        }

        let root = self.bucket_root();
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent, &root).await;
        }
        if let Some(parent) = meta.parent() {
            self.prune_empty_dirs(parent, &root).await;
        }
        Ok(())
    }
}

/// Write to a temporary sibling, fsync, then rename over `path`.
async fn write_atomically(path: &Path, data: &[u8]) -> StoreResult<()> {
    let parent = path.parent().ok_or_else(|| {
        StoreError::Io(io::Error::new(ErrorKind::Other, "path missing parent directory"))
    })?;
    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
    let written = async {
        let mut file = File::create(&tmp_path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_all().await?;
        fs::rename(&tmp_path, path).await
    }
    .await;
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(StoreError::Io(err));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn put_then_read_back() {
        let dir = tempdir().unwrap();
        let store = DiskObjectStore::new(dir.path(), "media");
        let stored = store
            .put_object("public/a.txt", Some("text/plain"), Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(stored.etag, format!("{:x}", md5::compute(b"hello")));

        let (meta, mut reader) = store.read_object("public/a.txt").await.unwrap();
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"hello");
        assert_eq!(meta.content_type.as_deref(), Some("text/plain"));

        store.delete_object("public/a.txt").await.unwrap();
        assert!(matches!(
            store.read_object("public/a.txt").await,
            Err(StoreError::NoSuchKey(_))
        ));
    }

    #[tokio::test]
    async fn multipart_stitches_parts_in_order() {
        let dir = tempdir().unwrap();
        let store = DiskObjectStore::new(dir.path(), "media");
        let key = "public/products/u1/videos/clip.mp4";
        let upload_id = store.create_multipart_upload(key, Some("video/mp4")).await.unwrap();

        // Parts arrive out of order.
        let e2 = store
            .upload_part(key, &upload_id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let e1 = store
            .upload_part(key, &upload_id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();

        let listed = store.list_parts(key, &upload_id).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].part_number, 1);
        assert_eq!(listed[1].size, 5);

        let parts: Vec<CompletedPart> = [(1, e1), (2, e2)]
            .into_iter()
            .map(|(part_number, etag)| CompletedPart { part_number, etag })
            .collect();
        let object = store
            .complete_multipart_upload(key, &upload_id, &parts)
            .await
            .unwrap();
        assert_eq!(object.size, 11);
        assert!(object.etag.ends_with("-2"));

        let (_, mut reader) = store.read_object(key).await.unwrap();
        let mut body = String::new();
        reader.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "hello world");

        assert!(matches!(
            store.list_parts(key, &upload_id).await,
            Err(StoreError::NoSuchUpload(_))
        ));
    }

    #[tokio::test]
    async fn abort_discards_staging_and_rejects_unknown_ids() {
        let dir = tempdir().unwrap();
        let store = DiskObjectStore::new(dir.path(), "media");
        let upload_id = store.create_multipart_upload("k.bin", None).await.unwrap();
        store
            .upload_part("k.bin", &upload_id, 1, Bytes::from_static(b"x"))
            .await
            .unwrap();
        store.abort_multipart_upload("k.bin", &upload_id).await.unwrap();
        assert!(matches!(
            store.abort_multipart_upload("k.bin", &upload_id).await,
            Err(StoreError::NoSuchUpload(_))
        ));
        assert!(matches!(
            store.upload_part("k.bin", "../escape", 1, Bytes::new()).await,
            Err(StoreError::NoSuchUpload(_))
        ));
    }

    #[tokio::test]
    async fn upload_id_is_bound_to_its_key() {
        let dir = tempdir().unwrap();
        let store = DiskObjectStore::new(dir.path(), "media");
        let upload_id = store.create_multipart_upload("one.bin", None).await.unwrap();
        assert!(matches!(
            store
                .upload_part("two.bin", &upload_id, 1, Bytes::from_static(b"x"))
                .await,
            Err(StoreError::NoSuchUpload(_))
        ));
    }
}
