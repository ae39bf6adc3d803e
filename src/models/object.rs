//! Represents an object (file) that landed in the object store.

use serde::{Deserialize, Serialize};

/// Metadata of a stored object. The payload itself stays in the store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// MD5 of the payload, or `md5(part digests)-N` for multipart objects.
    pub etag: String,

    /// Size in bytes.
    pub size: u64,

    /// Content type (MIME type).
    pub content_type: Option<String>,
}
