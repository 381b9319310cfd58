//! The publish loop.
//!
//! A [`Publisher`] loads its checkpoint, then on every tick asks the
//! [`ChangeSource`] for rows above its cursor, forwards them to the
//! [`RowSink`] in watermark order, and flushes the cursor to the
//! [`CheckpointStore`] after every page. When the run token is cancelled it
//! flushes once more under its own timeout and stops.
//!
//! Delivery is at-least-once: the cursor only moves past a row after the
//! sink accepted it and its watermark was read, so a failed row is fetched
//! again on a later tick. Rows forwarded after the last flush are sent again
//! if the process dies before the next one.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::PublisherConfig;
use crate::metrics::PublisherMetrics;
use crate::postgres::Watermark;
use crate::sink::RowSink;
use crate::source::ChangeSource;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Initializing,
    Running,
    Draining,
    Stopped,
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The latest watermark could not be read.
    SourceUnavailable,
    /// Nothing above the cursor.
    Idle,
    /// Pagination ran to a short page.
    Published { rows: u64 },
    /// A submit or watermark parse failed; the tick stopped at that row.
    Truncated { rows: u64 },
    /// Listing kept failing and the retry budget ran out.
    ListFailed { rows: u64 },
    /// The run was cancelled between pages.
    Cancelled { rows: u64 },
}

enum PageOutcome {
    Complete,
    Stopped,
}

pub struct Publisher {
    config: PublisherConfig,
    source: Arc<dyn ChangeSource>,
    store: Arc<dyn CheckpointStore>,
    sink: Arc<dyn RowSink>,
    metrics: Arc<dyn PublisherMetrics>,
    cursor: Watermark,
    state: PublisherState,
}

impl Publisher {
    pub fn new(
        config: PublisherConfig,
        source: Arc<dyn ChangeSource>,
        store: Arc<dyn CheckpointStore>,
        sink: Arc<dyn RowSink>,
        metrics: Arc<dyn PublisherMetrics>,
    ) -> Result<Self> {
        if config.id.is_empty() {
            return Err(Error::Config("publisher id is empty".to_string()));
        }
        if config.page_size <= 0 {
            return Err(Error::Config(format!(
                "page size must be positive, got {}",
                config.page_size
            )));
        }

        let cursor = config.default_watermark;
        Ok(Self {
            config,
            source,
            store,
            sink,
            metrics,
            cursor,
            state: PublisherState::Initializing,
        })
    }

    pub fn cursor(&self) -> Watermark {
        self.cursor
    }

    pub fn state(&self) -> PublisherState {
        self.state
    }

    /// Runs until `cancel` fires, then flushes the cursor and returns.
    ///
    /// Only a checkpoint load failure other than "not found" is returned as
    /// an error; everything that goes wrong while running is logged and
    /// counted.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        info!(id = %self.config.id, "Starting publisher");
        self.initialize().await?;

        let period = self.config.tick_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(&cancel).await;
                }
            }
        }

        info!(id = %self.config.id, "Stopping publisher");
        self.drain().await;
        Ok(())
    }

    /// Seeds the cursor from the checkpoint store.
    ///
    /// A missing checkpoint falls back to the configured default watermark;
    /// any other failure aborts startup.
    pub async fn initialize(&mut self) -> Result<()> {
        self.state = PublisherState::Initializing;
        let id = self.config.id.clone();

        match self.call("get last published version", self.store.get(&id)).await {
            Ok(watermark) => {
                info!(id = %id, last_published_version = watermark, "Got last published version");
                self.cursor = watermark;
            }
            Err(e) if e.is_not_found() => {
                warn!(
                    id = %id,
                    last_published_version = self.config.default_watermark,
                    "Could not get last published version, using default"
                );
                self.cursor = self.config.default_watermark;
            }
            Err(e) => {
                error!(id = %id, error = %e, "Error getting last published version");
                return Err(e);
            }
        }

        self.metrics.set_last_published(self.cursor);
        self.state = PublisherState::Running;
        Ok(())
    }

    /// Runs one poll: check for new rows and page through them.
    pub async fn tick(&mut self, cancel: &CancellationToken) -> TickOutcome {
        let started = Instant::now();
        let outcome = self.poll(cancel).await;

        if !matches!(outcome, TickOutcome::SourceUnavailable | TickOutcome::Idle) {
            self.metrics.tick_completed(started.elapsed());
        }
        outcome
    }

    async fn poll(&mut self, cancel: &CancellationToken) -> TickOutcome {
        let (table, column) = (self.config.table.clone(), self.config.column.clone());

        debug!(id = %self.config.id, "Checking latest version");
        let latest = match self
            .call("latest version", self.source.latest_watermark(&table, &column))
            .await
        {
            Ok(latest) => latest,
            Err(e) => {
                error!(
                    id = %self.config.id,
                    table = %table,
                    column = %column,
                    error = %e,
                    "Error getting latest version"
                );
                return TickOutcome::SourceUnavailable;
            }
        };

        if latest <= self.cursor {
            debug!(id = %self.config.id, version = self.cursor, "No changes");
            return TickOutcome::Idle;
        }
        info!(id = %self.config.id, latest, cursor = self.cursor, "Change detected");

        let mut rows = 0u64;
        let mut list_failures = 0u32;
        loop {
            if cancel.is_cancelled() {
                return TickOutcome::Cancelled { rows };
            }

            let page = match self
                .call(
                    "list changes",
                    self.source
                        .list_from(&table, &column, self.cursor, self.config.page_size),
                )
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    list_failures += 1;
                    error!(
                        id = %self.config.id,
                        table = %table,
                        column = %column,
                        version = self.cursor,
                        attempt = list_failures,
                        error = %e,
                        "Error listing changes"
                    );
                    if list_failures > self.config.list_retry_limit {
                        return TickOutcome::ListFailed { rows };
                    }
                    continue;
                }
            };
            list_failures = 0;

            let full_page = page.len() as i64 == self.config.page_size;
            let (published, outcome) = self.publish_page(&page, &column).await;
            rows += published;

            self.metrics.set_last_published(self.cursor);
            self.flush().await;

            match outcome {
                PageOutcome::Stopped => return TickOutcome::Truncated { rows },
                PageOutcome::Complete if !full_page => return TickOutcome::Published { rows },
                PageOutcome::Complete => {}
            }
        }
    }

    /// Forwards rows in order, advancing the cursor after each one that the
    /// sink accepted and whose watermark could be read.
    async fn publish_page(
        &mut self,
        page: &[crate::postgres::Row],
        column: &str,
    ) -> (u64, PageOutcome) {
        let mut published = 0u64;
        for row in page {
            if let Err(e) = self.sink.submit(row).await {
                error!(
                    id = %self.config.id,
                    version = self.cursor,
                    error = %e,
                    "Error submitting row"
                );
                self.metrics.publish_error();
                return (published, PageOutcome::Stopped);
            }

            let watermark = match row.watermark(column) {
                Ok(w) if w > self.cursor => w,
                Ok(w) => {
                    error!(
                        id = %self.config.id,
                        version_column = %column,
                        version = w,
                        cursor = self.cursor,
                        "Row version does not advance the cursor"
                    );
                    self.metrics.publish_error();
                    return (published, PageOutcome::Stopped);
                }
                Err(e) => {
                    error!(
                        id = %self.config.id,
                        version_column = %column,
                        error = %e,
                        "Version column not usable"
                    );
                    self.metrics.publish_error();
                    return (published, PageOutcome::Stopped);
                }
            };

            self.cursor = watermark;
            published += 1;
            self.metrics.row_published();
        }
        (published, PageOutcome::Complete)
    }

    async fn flush(&self) {
        if let Err(e) = self
            .call("set last published version", self.store.set(&self.config.id, self.cursor))
            .await
        {
            error!(
                id = %self.config.id,
                version = self.cursor,
                error = %e,
                "Error setting last published version"
            );
            self.metrics.checkpoint_error();
        }
    }

    /// Final best-effort flush after the run was cancelled.
    ///
    /// Uses its own deadline since the run token is already cancelled.
    pub async fn drain(&mut self) {
        self.state = PublisherState::Draining;
        info!(id = %self.config.id, version = self.cursor, "Setting last published version");

        let deadline = self.config.shutdown_timeout();
        match timeout(deadline, self.store.set(&self.config.id, self.cursor)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(
                    id = %self.config.id,
                    version = self.cursor,
                    error = %e,
                    "Error setting last published version"
                );
            }
            Err(_) => {
                error!(
                    id = %self.config.id,
                    version = self.cursor,
                    timeout = ?deadline,
                    "Timed out setting last published version"
                );
            }
        }
        self.state = PublisherState::Stopped;
    }

    async fn call<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        with_deadline(self.config.call_timeout(), what, fut).await
    }
}

async fn with_deadline<T>(
    deadline: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            message: format!("{} did not complete within {:?}", what, deadline),
        }),
    }
}
