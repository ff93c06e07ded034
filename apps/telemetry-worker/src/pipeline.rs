use anyhow::Result;
use chrono::Utc;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

/// Counters updated by the ingestion loop and logged after every batch.
#[derive(Debug)]
pub struct IngestStats {
    pub messages_polled: AtomicU64,
    pub messages_handled: AtomicU64,
    pub messages_failed: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub rows_inserted: AtomicU64,
    pub last_commit_unix_ms: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub messages_polled: u64,
    pub messages_handled: u64,
    pub messages_failed: u64,
    pub dead_lettered: u64,
    pub rows_inserted: u64,
    pub last_commit_unix_ms: u64,
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            messages_polled: AtomicU64::new(0),
            messages_handled: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            rows_inserted: AtomicU64::new(0),
            last_commit_unix_ms: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn mark_committed(&self) {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.last_commit_unix_ms.store(now, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_polled: self.messages_polled.load(Ordering::Relaxed),
            messages_handled: self.messages_handled.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            rows_inserted: self.rows_inserted.load(Ordering::Relaxed),
            last_commit_unix_ms: self.last_commit_unix_ms.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self, context: &str) {
        let snap = self.snapshot();
        tracing::info!(
            polled = snap.messages_polled,
            handled = snap.messages_handled,
            failed = snap.messages_failed,
            dead_lettered = snap.dead_lettered,
            rows_inserted = snap.rows_inserted,
            last_commit_unix_ms = snap.last_commit_unix_ms,
            last_error = self.last_error().as_deref().unwrap_or(""),
            "{context}"
        );
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}
