//! Adaptive large-file uploads.
//!
//! The server half exposes a four-phase multipart session protocol plus direct
//! and streaming routes over an [`store::ObjectStore`]. The client half,
//! [`client::UploadManager`], picks one of the three strategies per file from
//! the shared [`policy::UploadPolicy`] and drives it to a single
//! [`models::upload::UploadResult`].

pub mod client;
pub mod codec;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod policy;
pub mod routes;
pub mod services;
pub mod sessions;
pub mod store;

pub use client::{UploadFile, UploadManager, UploadOptions};
pub use policy::{UploadMethod, UploadPolicy};
pub use routes::build_router;
pub use services::{StorageLocation, UploadError, UploadService};
