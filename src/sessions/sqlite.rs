//! Session registry backed by SQLite, shared by every instance that points at
//! the same database file.
//!
//! Terminal transitions use `DELETE ... RETURNING` inside a transaction, so
//! the row is claimed by exactly one caller before its parts are read.

use super::{SessionResult, SessionStore, SessionStoreError};
use crate::models::multipart::UploadSession;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};
use std::{collections::BTreeMap, sync::Arc};

const SESSION_COLUMNS: &str = "id, upload_id, object_key, user_id, content_type, file_size, \
                               chunk_size, total_chunks, created_at";

#[derive(Clone)]
pub struct SqliteSessionStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

#[derive(FromRow, Debug)]
struct SessionRow {
    id: String,
    upload_id: String,
    object_key: String,
    user_id: String,
    content_type: String,
    file_size: i64,
    chunk_size: i64,
    total_chunks: i64,
    created_at: DateTime<Utc>,
}

impl SessionRow {
    fn into_session(self, parts: Vec<(i64, String)>) -> SessionResult<UploadSession> {
        let corrupt = |reason: &str| SessionStoreError::Corrupt {
            session_id: self.id.clone(),
            reason: reason.to_string(),
        };
        let parts = parts
            .into_iter()
            .map(|(number, etag)| {
                u32::try_from(number)
                    .map(|number| (number, etag))
                    .map_err(|_| corrupt("part number out of range"))
            })
            .collect::<SessionResult<BTreeMap<u32, String>>>()?;
        Ok(UploadSession {
            file_size: u64::try_from(self.file_size).map_err(|_| corrupt("negative file size"))?,
            chunk_size: u64::try_from(self.chunk_size)
                .map_err(|_| corrupt("negative chunk size"))?,
            total_chunks: u32::try_from(self.total_chunks)
                .map_err(|_| corrupt("chunk count out of range"))?,
            session_id: self.id,
            upload_id: self.upload_id,
            key: self.object_key,
            user_id: self.user_id,
            content_type: self.content_type,
            parts,
            created_at: self.created_at,
        })
    }
}

impl SqliteSessionStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    async fn load_parts(
        tx: &mut Transaction<'_, Sqlite>,
        session_id: &str,
    ) -> SessionResult<Vec<(i64, String)>> {
        Ok(sqlx::query_as::<_, (i64, String)>(
            "SELECT part_number, etag FROM upload_session_parts
             WHERE session_id = ? ORDER BY part_number",
        )
        .bind(session_id)
        .fetch_all(&mut **tx)
        .await?)
    }

    /// Read and delete the parts of a session already claimed in `tx`.
    async fn drain_parts(
        tx: &mut Transaction<'_, Sqlite>,
        row: SessionRow,
    ) -> SessionResult<UploadSession> {
        let parts = Self::load_parts(tx, &row.id).await?;
        sqlx::query("DELETE FROM upload_session_parts WHERE session_id = ?")
            .bind(&row.id)
            .execute(&mut **tx)
            .await?;
        row.into_session(parts)
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    fn backend_tag(&self) -> &'static str {
        "sqlite"
    }

    async fn insert(&self, session: UploadSession) -> SessionResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO upload_sessions (id, upload_id, object_key, user_id, content_type,
                                          file_size, chunk_size, total_chunks, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.session_id)
        .bind(&session.upload_id)
        .bind(&session.key)
        .bind(&session.user_id)
        .bind(&session.content_type)
        .bind(to_i64(session.file_size))
        .bind(to_i64(session.chunk_size))
        .bind(i64::from(session.total_chunks))
        .bind(session.created_at)
        .execute(&mut *tx)
        .await?;
        for (part_number, etag) in &session.parts {
            sqlx::query(
                "INSERT INTO upload_session_parts (session_id, part_number, etag) VALUES (?, ?, ?)",
            )
            .bind(&session.session_id)
            .bind(i64::from(*part_number))
            .bind(etag)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, session_id: &str) -> SessionResult<Option<UploadSession>> {
        let mut tx = self.db.begin().await?;
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM upload_sessions WHERE id = ?",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?;
        let session = match row {
            Some(row) => {
                let parts = Self::load_parts(&mut tx, session_id).await?;
                Some(row.into_session(parts)?)
            }
            None => None,
        };
        tx.commit().await?;
        Ok(session)
    }

    async fn record_part(
        &self,
        session_id: &str,
        part_number: u32,
        etag: &str,
    ) -> SessionResult<Option<usize>> {
        let mut tx = self.db.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO upload_session_parts (session_id, part_number, etag)
             SELECT ?, ?, ? WHERE EXISTS (SELECT 1 FROM upload_sessions WHERE id = ?)
             ON CONFLICT (session_id, part_number) DO UPDATE SET etag = excluded.etag",
        )
        .bind(session_id)
        .bind(i64::from(part_number))
        .bind(etag)
        .bind(session_id)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM upload_session_parts WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&mut *tx)
                .await?;
        tx.commit().await?;
        Ok(Some(usize::try_from(count).unwrap_or_default()))
    }

    async fn take(&self, session_id: &str) -> SessionResult<Option<UploadSession>> {
        let mut tx = self.db.begin().await?;
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "DELETE FROM upload_sessions WHERE id = ? RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?;
        let session = match row {
            Some(row) => Some(Self::drain_parts(&mut tx, row).await?),
            None => None,
        };
        tx.commit().await?;
        Ok(session)
    }

    async fn sweep_expired(&self, cutoff: DateTime<Utc>) -> SessionResult<Vec<UploadSession>> {
        let mut tx = self.db.begin().await?;
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "DELETE FROM upload_sessions WHERE created_at < ? RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;
        let mut swept = Vec::with_capacity(rows.len());
        for row in rows {
            swept.push(Self::drain_parts(&mut tx, row).await?);
        }
        tx.commit().await?;
        Ok(swept)
    }

    async fn count(&self) -> SessionResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_sessions")
            .fetch_one(&*self.db)
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn ping(&self) -> SessionResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}
