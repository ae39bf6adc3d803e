//! Registry of in-flight multipart sessions.
//!
//! Terminal transitions go through [`SessionStore::take`], which removes and
//! returns a session in one atomic step: of two callers racing to finish the
//! same session, exactly one receives it.

use crate::models::multipart::UploadSession;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod memory;
pub mod sqlite;

pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("corrupt session record `{session_id}`: {reason}")]
    Corrupt { session_id: String, reason: String },
}

pub type SessionResult<T> = Result<T, SessionStoreError>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    fn backend_tag(&self) -> &'static str;

    async fn insert(&self, session: UploadSession) -> SessionResult<()>;

    async fn get(&self, session_id: &str) -> SessionResult<Option<UploadSession>>;

    /// Record the ETag of an accepted part and return how many parts the
    /// session now holds, or `None` when the session is gone.
    async fn record_part(
        &self,
        session_id: &str,
        part_number: u32,
        etag: &str,
    ) -> SessionResult<Option<usize>>;

    /// Atomically remove and return a session.
    async fn take(&self, session_id: &str) -> SessionResult<Option<UploadSession>>;

    /// Remove and return every session created before `cutoff`.
    async fn sweep_expired(&self, cutoff: DateTime<Utc>) -> SessionResult<Vec<UploadSession>>;

    async fn count(&self) -> SessionResult<usize>;

    /// Cheap round-trip used by the readiness probe.
    async fn ping(&self) -> SessionResult<()>;
}
