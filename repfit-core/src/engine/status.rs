//! Observable sync status.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::queue::DeadLetter;

/// Default number of failures kept in [`SyncStatus::recent_errors`].
pub const DEFAULT_RECENT_ERRORS: usize = 10;

/// A failure worth surfacing to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncFailure {
    /// Queue row that was evicted, if the failure concerns one.
    pub op_id: Option<i64>,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl SyncFailure {
    pub fn evicted(letter: &DeadLetter) -> Self {
        Self {
            op_id: Some(letter.op_id),
            message: letter.describe(),
            at: letter.failed_at,
        }
    }

    /// A failure that left the operation queued.
    pub fn operation(op_id: i64, message: impl Into<String>) -> Self {
        Self {
            op_id: Some(op_id),
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            op_id: None,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub pending_count: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Newest last.
    pub recent_errors: Vec<SyncFailure>,
}

#[derive(Debug)]
pub(crate) struct StatusBoard {
    tx: watch::Sender<SyncStatus>,
    limit: usize,
}

impl StatusBoard {
    pub(crate) fn new(limit: usize) -> Self {
        let (tx, _rx) = watch::channel(SyncStatus::default());
        Self { tx, limit }
    }

    pub(crate) fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub(crate) fn set_syncing(&self, syncing: bool) {
        self.tx.send_modify(|s| s.is_syncing = syncing);
    }

    pub(crate) fn set_pending(&self, pending: u64) {
        self.tx.send_modify(|s| s.pending_count = pending);
    }

    pub(crate) fn finish(&self, pending: u64, at: DateTime<Utc>) {
        self.tx.send_modify(|s| {
            s.is_syncing = false;
            s.pending_count = pending;
            s.last_sync_at = Some(at);
        });
    }

    pub(crate) fn push_error(&self, failure: SyncFailure) {
        let limit = self.limit;
        self.tx.send_modify(|s| {
            s.recent_errors.push(failure);
            if s.recent_errors.len() > limit {
                let excess = s.recent_errors.len() - limit;
                s.recent_errors.drain(..excess);
            }
        });
    }
}
