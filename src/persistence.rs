//! Snapshot persistence collaborator.
//!
//! Rows are append-only: one [`SnapshotRecord`] per flush, keyed by user and
//! time. Writers from several devices race at row granularity (last write wins);
//! there is no conflict resolution.

use crate::error::{TrackerError, TrackerResult};
use crate::types::ActivitySnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub user_id: String,
    pub snapshot: ActivitySnapshot,
    pub device_label: String,
    pub recorded_at: DateTime<Utc>,
}

pub type SubscriptionId = u64;

/// Realtime feed of rows inserted for one user, from any device.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub updates: mpsc::UnboundedReceiver<SnapshotRecord>,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn insert_snapshot(
        &self,
        user_id: &str,
        snapshot: &ActivitySnapshot,
        device_label: &str,
        recorded_at: DateTime<Utc>,
    ) -> TrackerResult<()>;

    async fn query_latest_snapshot(&self, user_id: &str) -> TrackerResult<Option<SnapshotRecord>>;

    /// Rows recorded at or after `since`, ascending by time.
    async fn query_historical_snapshots(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> TrackerResult<Vec<SnapshotRecord>>;

    async fn subscribe(&self, user_id: &str) -> TrackerResult<Subscription>;

    async fn unsubscribe(&self, id: SubscriptionId) -> TrackerResult<()>;
}

struct Subscriber {
    user_id: String,
    tx: mpsc::UnboundedSender<SnapshotRecord>,
}

/// In-memory store, optionally mirrored to an append-only JSON-lines journal.
pub struct MemorySnapshotStore {
    rows: RwLock<Vec<SnapshotRecord>>,
    subscribers: Mutex<HashMap<SubscriptionId, Subscriber>>,
    next_subscription: AtomicU64,
    journal: Option<PathBuf>,
    journal_lock: tokio::sync::Mutex<()>,
}

impl Default for MemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            journal: None,
            journal_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open a journal-backed store, replaying existing rows. Lines that fail to
    /// parse are skipped with a warning.
    pub async fn open_journal(path: &Path) -> TrackerResult<Self> {
        let mut rows = Vec::new();
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                for (line_no, line) in contents.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<SnapshotRecord>(line) {
                        Ok(record) => rows.push(record),
                        Err(e) => warn!(
                            "[store] skipping journal line {} of {}: {}",
                            line_no + 1,
                            path.display(),
                            e
                        ),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!("[store] loaded {} rows from {}", rows.len(), path.display());

        let mut store = Self::new();
        store.rows = RwLock::new(rows);
        store.journal = Some(path.to_path_buf());
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_rows(&self) -> Vec<SnapshotRecord> {
        self.rows.read().map(|r| r.clone()).unwrap_or_default()
    }

    async fn append_journal(&self, record: &SnapshotRecord) -> TrackerResult<()> {
        let Some(path) = &self.journal else {
            return Ok(());
        };
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.journal_lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    fn publish(&self, record: &SnapshotRecord) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        // Receivers dropped without unsubscribe are pruned here.
        subscribers.retain(|id, sub| {
            if sub.user_id != record.user_id {
                return true;
            }
            let delivered = sub.tx.send(record.clone()).is_ok();
            if !delivered {
                debug!("[store] pruning closed subscription {}", id);
            }
            delivered
        });
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn insert_snapshot(
        &self,
        user_id: &str,
        snapshot: &ActivitySnapshot,
        device_label: &str,
        recorded_at: DateTime<Utc>,
    ) -> TrackerResult<()> {
        let record = SnapshotRecord {
            user_id: user_id.to_string(),
            snapshot: *snapshot,
            device_label: device_label.to_string(),
            recorded_at,
        };

        self.append_journal(&record).await?;
        {
            let mut rows = self
                .rows
                .write()
                .map_err(|_| TrackerError::PersistenceFailure("row lock poisoned".into()))?;
            rows.push(record.clone());
        }
        self.publish(&record);
        Ok(())
    }

    async fn query_latest_snapshot(&self, user_id: &str) -> TrackerResult<Option<SnapshotRecord>> {
        let rows = self
            .rows
            .read()
            .map_err(|_| TrackerError::PersistenceFailure("row lock poisoned".into()))?;
        // max_by_key keeps the last of equal timestamps, i.e. the latest insert.
        Ok(rows
            .iter()
            .filter(|r| r.user_id == user_id)
            .max_by_key(|r| r.recorded_at)
            .cloned())
    }

    async fn query_historical_snapshots(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> TrackerResult<Vec<SnapshotRecord>> {
        let rows = self
            .rows
            .read()
            .map_err(|_| TrackerError::PersistenceFailure("row lock poisoned".into()))?;
        let mut history: Vec<SnapshotRecord> = rows
            .iter()
            .filter(|r| r.user_id == user_id && r.recorded_at >= since)
            .cloned()
            .collect();
        history.sort_by_key(|r| r.recorded_at);
        Ok(history)
    }

    async fn subscribe(&self, user_id: &str) -> TrackerResult<Subscription> {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|_| TrackerError::PersistenceFailure("subscriber lock poisoned".into()))?;
        subscribers.insert(
            id,
            Subscriber {
                user_id: user_id.to_string(),
                tx,
            },
        );
        Ok(Subscription { id, updates: rx })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> TrackerResult<()> {
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|_| TrackerError::PersistenceFailure("subscriber lock poisoned".into()))?;
        subscribers.remove(&id);
        Ok(())
    }
}
