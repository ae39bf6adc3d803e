use serde::Serialize;
use std::sync::{Arc, Mutex};

/// One progress report: bytes accepted so far out of `total`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub loaded: u64,
    pub total: u64,
    pub percentage: f64,
}

pub type ProgressCallback = Arc<dyn Fn(UploadProgress) + Send + Sync>;

/// Aggregates progress from every in-flight transfer of one upload.
///
/// Reports never go backwards and the same `loaded` value is never reported
/// twice. The callback runs under the tracker's lock, so concurrent parts
/// cannot interleave their reports.
pub struct ProgressTracker {
    total: u64,
    callback: Option<ProgressCallback>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    loaded: u64,
    reported: Option<u64>,
}

impl ProgressTracker {
    pub fn new(total: u64, callback: Option<ProgressCallback>) -> Self {
        Self {
            total,
            callback,
            state: Mutex::new(State::default()),
        }
    }

    pub fn loaded(&self) -> u64 {
        self.lock().loaded
    }

    /// Add `bytes` to the running total.
    pub fn advance(&self, bytes: u64) {
        let mut state = self.lock();
        let loaded = state.loaded.saturating_add(bytes).min(self.total);
        self.report(&mut state, loaded);
    }

    /// Move to an absolute position; positions behind the current one are ignored.
    pub fn set(&self, loaded: u64) {
        let mut state = self.lock();
        let loaded = loaded.min(self.total).max(state.loaded);
        self.report(&mut state, loaded);
    }

    /// Report `(total, total, 100%)` unless that was already the last report.
    pub fn finish(&self) {
        self.set(self.total);
    }

    fn report(&self, state: &mut State, loaded: u64) {
        state.loaded = loaded;
        if state.reported == Some(loaded) {
            return;
        }
        state.reported = Some(loaded);
        if let Some(callback) = &self.callback {
            callback(UploadProgress {
                loaded,
                total: self.total,
                percentage: percentage(loaded, self.total),
            });
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn percentage(loaded: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        loaded as f64 / total as f64 * 100.0
    }
}
