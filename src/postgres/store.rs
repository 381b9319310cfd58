use async_trait::async_trait;
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tracing::{debug, info, instrument};

use super::connection::PostgresConnection;
use super::types::{Row, Watermark};
use super::value::convert_row;
use crate::checkpoint::CheckpointStore;
use crate::source::ChangeSource;
use crate::{Error, Result};

/// Watched-table reader and checkpoint table writer over one connection.
///
/// Table and column names are interpolated into the SQL text and must be
/// trusted identifiers; watermark and limit values are always bound
/// parameters.
pub struct PostgresStore {
    connection: PostgresConnection,
    checkpoint_table: String,
}

impl PostgresStore {
    pub async fn connect(
        dsn: &str,
        connect_timeout: Duration,
        checkpoint_table: &str,
    ) -> Result<Self> {
        let connection = PostgresConnection::connect(dsn, connect_timeout).await?;
        Ok(Self {
            connection,
            checkpoint_table: checkpoint_table.to_string(),
        })
    }

    /// Creates the checkpoint table if it does not exist yet.
    pub async fn ensure_checkpoint_table(&self) -> Result<()> {
        let client = self.connection.client().await?;
        let query = format!(
            "CREATE TABLE IF NOT EXISTS {} \
             (id TEXT PRIMARY KEY, last_published_version BIGINT NOT NULL)",
            self.checkpoint_table
        );
        client.batch_execute(&query).await?;
        info!(table = %self.checkpoint_table, "Checkpoint table ready");
        Ok(())
    }
}

/// Maps a failed query on the watched table: a missing relation or
/// column is `NotFound`, everything else is a query fault.
fn classify(e: tokio_postgres::Error, what: &str) -> Error {
    match e.code() {
        Some(code) if *code == SqlState::UNDEFINED_TABLE || *code == SqlState::UNDEFINED_COLUMN => {
            Error::NotFound {
                message: format!("{}: {}", what, e),
            }
        }
        _ => Error::Query {
            message: format!("{}: {}", what, e),
        },
    }
}

#[async_trait]
impl ChangeSource for PostgresStore {
    #[instrument(skip(self))]
    async fn latest_watermark(&self, table: &str, column: &str) -> Result<Watermark> {
        let client = self.connection.client().await.map_err(|e| Error::Query {
            message: format!("connect: {}", e),
        })?;
        let query = format!("SELECT COALESCE(MAX({column}), 0)::BIGINT FROM {table}");
        let row = client
            .query_one(query.as_str(), &[])
            .await
            .map_err(|e| Error::Query {
                message: format!("latest watermark of {}.{}: {}", table, column, e),
            })?;
        row.try_get::<_, i64>(0).map_err(|e| Error::Query {
            message: format!("latest watermark of {}.{}: {}", table, column, e),
        })
    }

    #[instrument(skip(self))]
    async fn list_from(
        &self,
        table: &str,
        column: &str,
        after: Watermark,
        limit: i64,
    ) -> Result<Vec<Row>> {
        let client = self.connection.client().await.map_err(|e| Error::Query {
            message: format!("connect: {}", e),
        })?;
        let query = format!(
            "SELECT * FROM {table} WHERE {column} > $1::BIGINT ORDER BY {column} ASC LIMIT $2"
        );
        let rows = client
            .query(query.as_str(), &[&after, &limit])
            .await
            .map_err(|e| classify(e, &format!("list {} after {}", table, after)))?;

        debug!(count = rows.len(), "Fetched rows");
        rows.iter()
            .map(|row| {
                convert_row(row).map_err(|e| Error::Query {
                    message: format!("decode row of {}: {}", table, e),
                })
            })
            .collect()
    }
}

#[async_trait]
impl CheckpointStore for PostgresStore {
    async fn get(&self, id: &str) -> Result<Watermark> {
        let client = self.connection.client().await?;
        let query = format!(
            "SELECT last_published_version FROM {} WHERE id = $1",
            self.checkpoint_table
        );
        match client.query_opt(query.as_str(), &[&id]).await? {
            Some(row) => Ok(row.try_get::<_, i64>(0)?),
            None => Err(Error::NotFound {
                message: format!("no checkpoint for '{}'", id),
            }),
        }
    }

    async fn set(&self, id: &str, watermark: Watermark) -> Result<()> {
        let client = self.connection.client().await?;
        let query = format!(
            "INSERT INTO {} (id, last_published_version) VALUES ($1, $2) \
             ON CONFLICT (id) DO UPDATE \
             SET last_published_version = EXCLUDED.last_published_version",
            self.checkpoint_table
        );
        client.execute(query.as_str(), &[&id, &watermark]).await?;
        Ok(())
    }
}
