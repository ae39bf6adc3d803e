//! Size and content-type policy shared by the upload server and its clients.
//!
//! Every size-based decision (which strategy a client picks, how large each
//! multipart chunk is, when the streaming route switches to a provider-managed
//! multipart upload) reads from one [`UploadPolicy`]. The server publishes its
//! active policy on `GET /api/uploads/policy` so clients never need to carry a
//! private copy of the thresholds.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Bumped whenever a threshold or tier changes meaning.
pub const POLICY_VERSION: u32 = 1;

/// Object stores cap a multipart upload at this many parts.
pub const MAX_PARTS: u32 = 10_000;

const IMAGE_PREFIX: &str = "image/";

const VIDEO_TYPES: [&str; 6] = [
    "video/mp4",
    "video/quicktime",
    "video/webm",
    "video/x-msvideo",
    "video/x-matroska",
    "video/mpeg",
];

const DOCUMENT_TYPES: [&str; 7] = [
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "text/plain",
    "text/csv",
];

/// The three ways a file can reach the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMethod {
    /// One request carrying the whole body.
    Direct,
    /// The four-phase session protocol, one base64 chunk per request.
    Multipart,
    /// The whole body forwarded to the streaming route.
    Streaming,
}

impl fmt::Display for UploadMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UploadMethod::Direct => "direct",
            UploadMethod::Multipart => "multipart",
            UploadMethod::Streaming => "streaming",
        };
        f.write_str(label)
    }
}

/// Broad content classes used for the allow-lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Document,
}

impl MediaKind {
    /// Classify a MIME type, ignoring parameters such as `; charset=utf-8`.
    pub fn classify(mime: &str) -> Option<Self> {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if essence.len() > IMAGE_PREFIX.len() && essence.starts_with(IMAGE_PREFIX) {
            Some(MediaKind::Image)
        } else if VIDEO_TYPES.contains(&essence.as_str()) {
            Some(MediaKind::Video)
        } else if DOCUMENT_TYPES.contains(&essence.as_str()) {
            Some(MediaKind::Document)
        } else {
            None
        }
    }
}

/// Chunk size used for files up to `up_to` bytes (inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkTier {
    pub up_to: u64,
    pub chunk_size: u64,
}

/// Thresholds that drive strategy selection and chunking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPolicy {
    pub version: u32,
    /// Hard ceiling for any single file.
    pub max_file_size: u64,
    /// Files strictly below this size use a direct upload.
    pub direct_threshold: u64,
    /// Files at or above this size go to the streaming route.
    pub streaming_threshold: u64,
    /// The streaming route switches to multipart once a body reaches this size.
    pub stream_multipart_threshold: u64,
    /// Ascending tiers; sizes past the last tier use `fallback_chunk_size`.
    pub chunk_tiers: Vec<ChunkTier>,
    pub fallback_chunk_size: u64,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            version: POLICY_VERSION,
            max_file_size: 5 * GIB,
            direct_threshold: 10 * MIB,
            streaming_threshold: 500 * MIB,
            stream_multipart_threshold: 100 * MIB,
            chunk_tiers: vec![
                ChunkTier {
                    up_to: 100 * MIB,
                    chunk_size: 5 * MIB,
                },
                ChunkTier {
                    up_to: 500 * MIB,
                    chunk_size: 10 * MIB,
                },
                ChunkTier {
                    up_to: GIB,
                    chunk_size: 25 * MIB,
                },
            ],
            fallback_chunk_size: 50 * MIB,
        }
    }
}

/// Why a file was refused before any network activity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyViolation {
    #[error("File is empty")]
    Empty,
    #[error("File size exceeds {limit_label} limit")]
    TooLarge { size: u64, limit_label: String },
    #[error("File type `{0}` is not allowed")]
    UnsupportedType(String),
    #[error("File type `{content_type}` is not allowed in folder `{folder}`")]
    FolderMismatch {
        content_type: String,
        folder: String,
    },
    #[error("Invalid folder name `{0}`")]
    InvalidFolder(String),
}

impl UploadPolicy {
    /// Pick the strategy for a file of `size` bytes.
    pub fn select_strategy(&self, size: u64, force_multipart: bool) -> UploadMethod {
        if force_multipart {
            UploadMethod::Multipart
        } else if size < self.direct_threshold {
            UploadMethod::Direct
        } else if size < self.streaming_threshold {
            UploadMethod::Multipart
        } else {
            UploadMethod::Streaming
        }
    }

    /// Chunk size for a multipart upload of `size` bytes.
    ///
    /// Small parts keep retries cheap; large files move up a tier so the part
    /// count stays well below [`MAX_PARTS`].
    pub fn chunk_size_for(&self, size: u64) -> u64 {
        self.chunk_tiers
            .iter()
            .find(|tier| size <= tier.up_to)
            .map(|tier| tier.chunk_size)
            .unwrap_or(self.fallback_chunk_size)
    }

    /// `(chunk_size, total_chunks)` for a multipart upload of `size` bytes.
    pub fn chunk_plan(&self, size: u64) -> (u64, u32) {
        let chunk_size = self.chunk_size_for(size);
        (chunk_size, crate::codec::total_chunks(size, chunk_size))
    }

    /// Largest chunk any session can negotiate.
    pub fn max_chunk_size(&self) -> u64 {
        self.chunk_tiers
            .iter()
            .map(|tier| tier.chunk_size)
            .chain(std::iter::once(self.fallback_chunk_size))
            .max()
            .unwrap_or(self.fallback_chunk_size)
    }

    pub fn ensure_size(&self, size: u64) -> Result<(), PolicyViolation> {
        if size == 0 {
            return Err(PolicyViolation::Empty);
        }
        if size > self.max_file_size {
            return Err(PolicyViolation::TooLarge {
                size,
                limit_label: size_label(self.max_file_size),
            });
        }
        Ok(())
    }

    /// Client-side check: size ceiling plus the global type allow-list.
    pub fn validate_file(&self, size: u64, content_type: &str) -> Result<(), PolicyViolation> {
        self.ensure_size(size)?;
        MediaKind::classify(content_type)
            .map(|_| ())
            .ok_or_else(|| PolicyViolation::UnsupportedType(content_type.to_string()))
    }

    /// Server-side check: size ceiling plus the per-folder allow-list.
    pub fn validate_for_folder(
        &self,
        size: u64,
        content_type: &str,
        folder: &str,
    ) -> Result<MediaKind, PolicyViolation> {
        ensure_folder_name(folder)?;
        self.ensure_size(size)?;
        ensure_type_for_folder(content_type, folder)
    }
}

/// Type check alone, for routes that learn the size while streaming.
pub fn ensure_type_for_folder(
    content_type: &str,
    folder: &str,
) -> Result<MediaKind, PolicyViolation> {
    let kind = MediaKind::classify(content_type)
        .ok_or_else(|| PolicyViolation::UnsupportedType(content_type.to_string()))?;
    let allowed = match folder {
        "images" => kind == MediaKind::Image,
        "videos" => kind == MediaKind::Video,
        "documents" => kind == MediaKind::Document,
        _ => true,
    };
    if allowed {
        Ok(kind)
    } else {
        Err(PolicyViolation::FolderMismatch {
            content_type: content_type.to_string(),
            folder: folder.to_string(),
        })
    }
}

pub fn ensure_folder_name(folder: &str) -> Result<(), PolicyViolation> {
    let valid = !folder.is_empty()
        && folder.len() <= 64
        && folder
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(PolicyViolation::InvalidFolder(folder.to_string()))
    }
}

/// Best-effort MIME guess from a file extension.
pub fn guess_content_type(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "avif" => "image/avif",
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "mpeg" | "mpg" => "video/mpeg",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "txt" => "text/plain",
        "csv" => "text/csv",
        _ => "application/octet-stream",
    }
}

pub(crate) fn size_label(bytes: u64) -> String {
    if bytes % GIB == 0 {
        format!("{}GB", bytes / GIB)
    } else if bytes % MIB == 0 {
        format!("{}MB", bytes / MIB)
    } else {
        format!("{} bytes", bytes)
    }
}
