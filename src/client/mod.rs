//! Client side of the upload protocol.
//!
//! [`UploadManager`] validates a file against the shared policy, picks a
//! strategy and drives it through an [`UploadBackend`]: in-process
//! ([`LocalBackend`]) or over HTTP ([`HttpBackend`]).

pub mod backend;
pub mod file;
pub mod http;
pub mod manager;
pub mod progress;

pub use backend::{Destination, LocalBackend, UploadBackend};
pub use file::{FileSource, UploadFile};
pub use http::HttpBackend;
pub use manager::{UploadManager, UploadOptions};
pub use progress::{ProgressTracker, UploadProgress};

use crate::{codec::CodecError, policy::PolicyViolation, services::UploadError};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Validation(#[from] PolicyViolation),
    #[error("Upload cancelled")]
    Cancelled,
    /// The server (or in-process service) refused the request.
    #[error("{message}")]
    Server { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl ClientError {
    /// Whether sending the same part again can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Server { status, .. } => *status >= 500,
            ClientError::Transport(err) => !err.is_builder() && !err.is_decode(),
            ClientError::Io(_) => true,
            ClientError::Validation(_) | ClientError::Cancelled | ClientError::Codec(_) => false,
        }
    }
}

impl From<UploadError> for ClientError {
    fn from(err: UploadError) -> Self {
        ClientError::Server {
            status: err.status().as_u16(),
            message: err.to_string(),
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
