//! Shared status cache: the last-known outcome of every source.
//!
//! One writer per key (the poll loop that owns the source), any number of
//! readers. Records are replaced whole under the map's shard lock, never
//! field-patched across writes, so a reader can never observe a half-updated
//! record. On failure the previous successful payload is carried forward;
//! only the success flag, diagnostic comment, and observation time move.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Last-known outcome for one source.
///
/// The default record (`is_success: false`, empty payload and comment,
/// `observed_at: None`) stands for "never polled".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Whether the most recent poll succeeded.
    pub is_success: bool,
    /// Payload of the most recent successful poll. Kept across failures.
    pub payload: String,
    /// When the source was last polled, success or failure.
    pub observed_at: Option<DateTime<Utc>>,
    /// Diagnostic text for the most recent failure; empty after a success.
    pub comment: String,
}

/// Concurrent map from source key to its latest [`StatusRecord`].
///
/// Shared via `Arc` between the supervisor, the poll loops, and readers
/// such as the usage aggregator.
#[derive(Debug, Default)]
pub struct StatusCache {
    records: DashMap<String, StatusRecord>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful poll. The payload replaces the previous one, the
    /// comment is cleared, and the observation time advances.
    pub fn update_success(&self, key: &str, payload: impl Into<String>) {
        let record = StatusRecord {
            is_success: true,
            payload: payload.into(),
            observed_at: Some(Utc::now()),
            comment: String::new(),
        };
        self.records.insert(key.to_owned(), record);
    }

    /// Record a failed poll. The previous payload is carried forward (empty
    /// if the key was never written), the comment is replaced, and the
    /// observation time still advances.
    pub fn update_failure(&self, key: &str, comment: impl Into<String>) {
        let mut entry = self.records.entry(key.to_owned()).or_default();
        let payload = std::mem::take(&mut entry.payload);
        *entry = StatusRecord {
            is_success: false,
            payload,
            observed_at: Some(Utc::now()),
            comment: comment.into(),
        };
    }

    /// Current record for `key`, or the default record if the key has never
    /// been written. Never blocks on a poll and never inserts.
    pub fn get(&self, key: &str) -> StatusRecord {
        self.records
            .get(key)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Snapshot of every written record, sorted by key.
    pub fn get_all(&self) -> BTreeMap<String, StatusRecord> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
