//! Process-local session map. Sessions are invisible to other instances and
//! lost on restart; use [`super::SqliteSessionStore`] when either matters.

use super::{SessionResult, SessionStore};
use crate::models::multipart::UploadSession;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, UploadSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, UploadSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    fn backend_tag(&self) -> &'static str {
        "memory"
    }

    async fn insert(&self, session: UploadSession) -> SessionResult<()> {
        self.lock().insert(session.session_id.clone(), session);
        Ok(())
    }

    async fn get(&self, session_id: &str) -> SessionResult<Option<UploadSession>> {
        Ok(self.lock().get(session_id).cloned())
    }

    async fn record_part(
        &self,
        session_id: &str,
        part_number: u32,
        etag: &str,
    ) -> SessionResult<Option<usize>> {
        let mut sessions = self.lock();
        Ok(sessions.get_mut(session_id).map(|session| {
            session.parts.insert(part_number, etag.to_string());
            session.parts.len()
        }))
    }

    async fn take(&self, session_id: &str) -> SessionResult<Option<UploadSession>> {
        Ok(self.lock().remove(session_id))
    }

    async fn sweep_expired(&self, cutoff: DateTime<Utc>) -> SessionResult<Vec<UploadSession>> {
        let mut sessions = self.lock();
        let expired: Vec<String> = sessions
            .values()
            .filter(|session| session.is_expired(cutoff))
            .map(|session| session.session_id.clone())
            .collect();
        Ok(expired
            .iter()
            .filter_map(|id| sessions.remove(id))
            .collect())
    }

    async fn count(&self) -> SessionResult<usize> {
        Ok(self.lock().len())
    }

    async fn ping(&self) -> SessionResult<()> {
        Ok(())
    }
}
