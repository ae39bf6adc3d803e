//! JSON bodies exchanged on the upload routes.
//!
//! Field names are camelCase on the wire. Every success body carries
//! `"success": true`; failures are rendered by `AppError` as
//! `{"success": false, "error": ..., "status": ...}`.

use crate::{models::multipart::PartInfo, policy::UploadMethod};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Visibility prefix of the destination key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    #[default]
    Public,
    Protected,
    Private,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Public => "public",
            AccessLevel::Protected => "protected",
            AccessLevel::Private => "private",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AccessLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "public" | "guest" => Ok(AccessLevel::Public),
            "protected" => Ok(AccessLevel::Protected),
            "private" => Ok(AccessLevel::Private),
            other => Err(format!("unknown access level `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequest {
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub folder: String,
    #[serde(default)]
    pub access_level: Option<AccessLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    pub success: bool,
    pub session_id: String,
    pub upload_id: String,
    pub key: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub bucket_name: String,
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRequest {
    pub session_id: String,
    /// Base64 payload of one part.
    #[serde(alias = "chunk")]
    pub base64_data: String,
    pub part_number: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResponse {
    pub success: bool,
    pub chunk_number: u32,
    pub etag: String,
    pub parts_uploaded: usize,
}

/// Body of `complete` and `abort`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub success: bool,
    pub url: String,
    pub key: String,
    pub location: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub success: bool,
    pub upload_id: String,
    pub key: String,
    pub parts_uploaded: usize,
    pub parts: Vec<PartInfo>,
}

/// Query string of `PUT /api/uploads/direct`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectUploadQuery {
    pub file_name: String,
    #[serde(default = "default_folder")]
    pub folder: String,
    #[serde(default)]
    pub access_level: Option<AccessLevel>,
}

/// How the server physically wrote an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    Single,
    Multipart,
}

/// Result of the direct and streaming routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectResponse {
    pub success: bool,
    pub url: String,
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub write_mode: WriteMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub status: u16,
}

/// Normalized outcome of one `UploadManager::upload` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub success: bool,
    pub url: Option<String>,
    pub key: Option<String>,
    pub error: Option<String>,
    pub method: UploadMethod,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

pub fn default_folder() -> String {
    "uploads".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_request_accepts_both_payload_names() {
        let a: ChunkRequest =
            serde_json::from_str(r#"{"sessionId":"s","base64Data":"AA==","partNumber":1}"#)
                .unwrap();
        let b: ChunkRequest =
            serde_json::from_str(r#"{"sessionId":"s","chunk":"AA==","partNumber":2}"#).unwrap();
        assert_eq!(a.base64_data, "AA==");
        assert_eq!(b.part_number, 2);
    }

    #[test]
    fn access_level_parses_loosely() {
        assert_eq!("guest".parse::<AccessLevel>(), Ok(AccessLevel::Public));
        assert_eq!("Private".parse::<AccessLevel>(), Ok(AccessLevel::Private));
        assert!("world".parse::<AccessLevel>().is_err());
    }
}
