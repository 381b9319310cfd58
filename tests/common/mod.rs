#![allow(dead_code)]

use async_trait::async_trait;
use pg_publisher::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use pg_publisher::config::PublisherConfig;
use pg_publisher::metrics::PublisherMetrics;
use pg_publisher::postgres::{Row, Value, Watermark};
use pg_publisher::sink::RowSink;
use pg_publisher::source::ChangeSource;
use pg_publisher::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const ID: &str = "publisher-0";
pub const TABLE: &str = "flags";
pub const COLUMN: &str = "version";

pub fn publisher_config(page_size: i64, default_watermark: Watermark) -> PublisherConfig {
    PublisherConfig {
        id: ID.to_string(),
        table: TABLE.to_string(),
        column: COLUMN.to_string(),
        page_size,
        default_watermark,
        tick_interval_ms: 20,
        call_timeout_ms: 1000,
        shutdown_timeout_ms: 200,
        list_retry_limit: 3,
        checkpoint_file: None,
    }
}

pub fn flag_row(version: Watermark) -> Row {
    Row::new()
        .with("id", version * 10)
        .with("name", format!("flag-{}", version))
        .with(COLUMN, version)
}

/// An in-memory watched table.
///
/// Each row is stored with the position it sorts by, so rows with a broken
/// version column can still be placed in the table.
#[derive(Default)]
pub struct MemoryTable {
    rows: Mutex<Vec<(Watermark, Row)>>,
    list_calls: Mutex<Vec<(Watermark, i64)>>,
    latest_failures: AtomicU32,
    list_failures: AtomicU32,
    page_cap: Mutex<Option<usize>>,
}

impl MemoryTable {
    pub fn with_versions(versions: &[Watermark]) -> Self {
        let table = Self::default();
        for v in versions {
            table.push(flag_row(*v));
        }
        table
    }

    pub fn push(&self, row: Row) {
        let position = row
            .get(COLUMN)
            .and_then(Value::as_watermark)
            .expect("use push_at for rows without a valid version");
        self.push_at(position, row);
    }

    pub fn push_at(&self, position: Watermark, row: Row) {
        let mut rows = self.rows.lock().unwrap();
        rows.push((position, row));
        rows.sort_by_key(|(p, _)| *p);
    }

    pub fn fail_latest(&self, times: u32) {
        self.latest_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_list(&self, times: u32) {
        self.list_failures.store(times, Ordering::SeqCst);
    }

    /// Makes every page at most `cap` rows long regardless of the limit.
    pub fn cap_pages(&self, cap: usize) {
        *self.page_cap.lock().unwrap() = Some(cap);
    }

    /// The `after` argument of every list call so far.
    pub fn list_calls(&self) -> Vec<Watermark> {
        self.list_calls.lock().unwrap().iter().map(|(after, _)| *after).collect()
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl ChangeSource for MemoryTable {
    async fn latest_watermark(&self, _table: &str, _column: &str) -> Result<Watermark> {
        if take_failure(&self.latest_failures) {
            return Err(Error::Query {
                message: "connection refused".to_string(),
            });
        }
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _)| *p)
            .max()
            .unwrap_or(0))
    }

    async fn list_from(
        &self,
        _table: &str,
        _column: &str,
        after: Watermark,
        limit: i64,
    ) -> Result<Vec<Row>> {
        self.list_calls.lock().unwrap().push((after, limit));
        if take_failure(&self.list_failures) {
            return Err(Error::Query {
                message: "connection reset by peer".to_string(),
            });
        }

        let mut take = limit as usize;
        if let Some(cap) = *self.page_cap.lock().unwrap() {
            take = take.min(cap);
        }
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| *p > after)
            .take(take)
            .map(|(_, row)| row.clone())
            .collect())
    }
}

/// Collects submitted rows; can be told to reject particular versions.
#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<Row>>,
    reject: Mutex<HashMap<Watermark, u32>>,
}

impl RecordingSink {
    /// Rejects the row with this version the next `times` submissions.
    pub fn reject(&self, version: Watermark, times: u32) {
        self.reject.lock().unwrap().insert(version, times);
    }

    pub fn delivered(&self) -> Vec<Row> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn delivered_versions(&self) -> Vec<Watermark> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter_map(|row| row.get(COLUMN).and_then(Value::as_watermark))
            .collect()
    }
}

#[async_trait]
impl RowSink for RecordingSink {
    async fn submit(&self, row: &Row) -> Result<()> {
        if let Some(version) = row.get(COLUMN).and_then(Value::as_watermark) {
            let mut reject = self.reject.lock().unwrap();
            if let Some(remaining) = reject.get_mut(&version) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::Timeout {
                        message: "broker did not acknowledge".to_string(),
                    });
                }
            }
        }
        self.delivered.lock().unwrap().push(row.clone());
        Ok(())
    }
}

/// Checkpoint store that records writes and can be made to misbehave.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryCheckpointStore,
    sets: Mutex<Vec<Watermark>>,
    fail_get: AtomicBool,
    fail_sets: AtomicBool,
    hang_sets: AtomicBool,
}

impl RecordingStore {
    pub fn with_checkpoint(watermark: Watermark) -> Self {
        Self {
            inner: MemoryCheckpointStore::with_checkpoint(ID, watermark),
            ..Default::default()
        }
    }

    pub fn fail_get(&self, fail: bool) {
        self.fail_get.store(fail, Ordering::SeqCst);
    }

    pub fn fail_sets(&self, fail: bool) {
        self.fail_sets.store(fail, Ordering::SeqCst);
    }

    pub fn hang_sets(&self, hang: bool) {
        self.hang_sets.store(hang, Ordering::SeqCst);
    }

    pub fn sets(&self) -> Vec<Watermark> {
        self.sets.lock().unwrap().clone()
    }

    pub async fn stored(&self) -> Option<Watermark> {
        self.inner.get(ID).await.ok()
    }
}

#[async_trait]
impl CheckpointStore for RecordingStore {
    async fn get(&self, id: &str) -> Result<Watermark> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(Error::Query {
                message: "password authentication failed".to_string(),
            });
        }
        self.inner.get(id).await
    }

    async fn set(&self, id: &str, watermark: Watermark) -> Result<()> {
        if self.hang_sets.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if self.fail_sets.load(Ordering::SeqCst) {
            return Err(Error::Query {
                message: "connection refused".to_string(),
            });
        }
        self.sets.lock().unwrap().push(watermark);
        self.inner.set(id, watermark).await
    }
}

#[derive(Default)]
pub struct CountingMetrics {
    pub last_published: AtomicI64,
    pub rows: AtomicU64,
    pub publish_errors: AtomicU64,
    pub checkpoint_errors: AtomicU64,
    pub ticks: AtomicU64,
}

impl CountingMetrics {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::SeqCst)
    }
}

impl PublisherMetrics for CountingMetrics {
    fn set_last_published(&self, watermark: i64) {
        self.last_published.store(watermark, Ordering::SeqCst);
    }

    fn row_published(&self) {
        self.rows.fetch_add(1, Ordering::SeqCst);
    }

    fn publish_error(&self) {
        self.publish_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn checkpoint_error(&self) {
        self.checkpoint_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn tick_completed(&self, _latency: Duration) {
        self.ticks.fetch_add(1, Ordering::SeqCst);
    }
}
