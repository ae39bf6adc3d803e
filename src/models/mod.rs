//! Core data models for the upload service.
//!
//! `multipart` holds the server-side session record, `object` the metadata of
//! stored objects, and `upload` the JSON bodies of every route.

pub mod multipart;
pub mod object;
pub mod upload;
