//! Server-side bookkeeping for one in-flight multipart upload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A multipart upload session, created by `initialize` and removed by
/// `complete` or `abort`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UploadSession {
    /// Client-visible identifier (UUID v4).
    pub session_id: String,

    /// Upload identifier issued by the object store.
    pub upload_id: String,

    /// Destination object key.
    pub key: String,

    /// Owner; every later phase is re-checked against this.
    pub user_id: String,

    pub content_type: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,

    /// ETags of accepted parts, keyed by 1-based part number.
    pub parts: BTreeMap<u32, String>,

    pub created_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }

    pub fn is_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.created_at < cutoff
    }

    /// Accepted parts in ascending part-number order.
    pub fn ordered_parts(&self) -> Vec<CompletedPart> {
        self.parts
            .iter()
            .filter(|(_, etag)| !etag.is_empty())
            .map(|(part_number, etag)| CompletedPart {
                part_number: *part_number,
                etag: etag.clone(),
            })
            .collect()
    }
}

/// A part as handed to the store's completion call.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// A part as reported by the store's list-parts call.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PartInfo {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session() -> UploadSession {
        UploadSession {
            session_id: "s".into(),
            upload_id: "u".into(),
            key: "k".into(),
            user_id: "alice".into(),
            content_type: "video/mp4".into(),
            file_size: 30,
            chunk_size: 10,
            total_chunks: 3,
            parts: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn ordered_parts_sorts_and_skips_blank_tags() {
        let mut s = session();
        s.parts.insert(3, "c".into());
        s.parts.insert(1, "a".into());
        s.parts.insert(2, String::new());
        let numbers: Vec<u32> = s.ordered_parts().iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 3]);
    }

    #[test]
    fn expiry_is_strictly_before_cutoff() {
        let s = session();
        assert!(!s.is_expired(s.created_at));
        assert!(s.is_expired(s.created_at + Duration::seconds(1)));
        assert!(s.is_owned_by("alice"));
        assert!(!s.is_owned_by("bob"));
    }
}
