//! Upload orchestration: the multipart session protocol plus the direct and
//! streaming routes.

pub mod stream_service;
pub mod upload_service;

pub use stream_service::StreamTarget;
pub use upload_service::{
    CompensationPolicy, ServiceResult, StorageLocation, UploadError, UploadService,
};
