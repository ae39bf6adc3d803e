//! Object store abstraction: the remote multipart API the upload protocol
//! orchestrates.
//!
//! The five multipart operations mirror the S3 calls of the same name. A real
//! deployment plugs an S3 client in behind [`ObjectStore`]; this crate ships a
//! local on-disk store and an in-memory fake.

use crate::models::{
    multipart::{CompletedPart, PartInfo},
    object::StoredObject,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{io, pin::Pin};
use thiserror::Error;
use tokio::io::AsyncRead;

pub mod disk;
pub mod memory;

pub use disk::DiskObjectStore;
pub use memory::{MemoryObjectStore, StoreOp};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("multipart upload `{0}` not found")]
    NoSuchUpload(String),
    #[error("object `{0}` not found")]
    NoSuchKey(String),
    #[error("invalid part {part_number}: {reason}")]
    InvalidPart { part_number: u32, reason: String },
    #[error("invalid object key")]
    InvalidKey,
    #[error("object store failure: {0}")]
    Backend(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Object payload opened for reading.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short label used in logs and readiness output.
    fn backend_tag(&self) -> &'static str;

    /// Single-shot write of a whole object.
    async fn put_object(
        &self,
        key: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> StoreResult<StoredObject>;

    /// Start a multipart transaction and return its upload id.
    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: Option<&str>,
    ) -> StoreResult<String>;

    /// Store one part and return its ETag. Re-sending a part number replaces it.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StoreResult<String>;

    /// Stitch `parts` (ascending part numbers) into the final object.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StoreResult<StoredObject>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StoreResult<()>;

    /// Parts the store has already accepted, ascending by part number.
    async fn list_parts(&self, key: &str, upload_id: &str) -> StoreResult<Vec<PartInfo>>;

    async fn read_object(&self, key: &str) -> StoreResult<(StoredObject, ObjectReader)>;

    async fn delete_object(&self, key: &str) -> StoreResult<()>;
}

/// Reject keys that could escape the store root.
pub(crate) fn ensure_key_safe(key: &str) -> StoreResult<()> {
    const MAX_OBJECT_KEY_LEN: usize = 1024;
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(StoreError::InvalidKey);
    }
    if key.starts_with('/') || key.contains("..") {
        return Err(StoreError::InvalidKey);
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(StoreError::InvalidKey);
    }
    Ok(())
}

/// S3-style multipart ETag: MD5 over the concatenated binary part digests,
/// suffixed with the part count.
pub(crate) fn multipart_etag(part_etags: &[String]) -> String {
    let mut ctx = md5::Context::new();
    for etag in part_etags {
        match decode_hex(etag) {
            Some(raw) => ctx.consume(&raw),
            None => ctx.consume(etag.as_bytes()),
        }
    }
    format!("{:x}-{}", ctx.compute(), part_etags.len())
}

/// Validate a completion list against the parts the store holds.
pub(crate) fn check_completion_parts(
    requested: &[CompletedPart],
    stored: &[PartInfo],
) -> StoreResult<()> {
    if requested.is_empty() {
        return Err(StoreError::InvalidPart {
            part_number: 0,
            reason: "no parts supplied".into(),
        });
    }
    let mut previous = 0;
    for part in requested {
        if part.part_number <= previous {
            return Err(StoreError::InvalidPart {
                part_number: part.part_number,
                reason: "part numbers must be strictly ascending".into(),
            });
        }
        previous = part.part_number;
        let held = stored
            .iter()
            .find(|info| info.part_number == part.part_number)
            .ok_or_else(|| StoreError::InvalidPart {
                part_number: part.part_number,
                reason: "part was never uploaded".into(),
            })?;
        if held.etag != part.etag.trim_matches('"') {
            return Err(StoreError::InvalidPart {
                part_number: part.part_number,
                reason: "etag mismatch".into(),
            });
        }
    }
    Ok(())
}

fn decode_hex(value: &str) -> Option<Vec<u8>> {
    let value = value.trim_matches('"');
    if value.len() % 2 != 0 {
        return None;
    }
    (0..value.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(value.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_safety() {
        assert!(ensure_key_safe("public/products/u/videos/a.mp4").is_ok());
        assert!(ensure_key_safe("").is_err());
        assert!(ensure_key_safe("/abs").is_err());
        assert!(ensure_key_safe("a/../b").is_err());
        assert!(ensure_key_safe("a\\b").is_err());
    }

    #[test]
    fn multipart_etag_has_part_suffix() {
        let a = format!("{:x}", md5::compute(b"a"));
        let b = format!("{:x}", md5::compute(b"b"));
        let etag = multipart_etag(&[a.clone(), b.clone()]);
        assert!(etag.ends_with("-2"));
        assert_ne!(etag, multipart_etag(&[b, a]));
    }

    #[test]
    fn completion_list_must_match_store() {
        let held = |part_number, etag: &str| PartInfo {
            part_number,
            etag: etag.into(),
            size: 1,
        };
        let part = |part_number, etag: &str| CompletedPart {
            part_number,
            etag: etag.into(),
        };
        let stored = vec![held(1, "aa"), held(2, "bb")];
        let ok = vec![part(1, "\"aa\""), part(2, "bb")];
        assert!(check_completion_parts(&ok, &stored).is_ok());

        let unordered = vec![ok[1].clone(), ok[0].clone()];
        assert!(check_completion_parts(&unordered, &stored).is_err());

        let wrong_tag = vec![part(1, "zz")];
        assert!(check_completion_parts(&wrong_tag, &stored).is_err());

        let missing = vec![part(3, "cc")];
        assert!(check_completion_parts(&missing, &stored).is_err());
        assert!(check_completion_parts(&[], &stored).is_err());
    }
}
