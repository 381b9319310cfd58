//! Read-only access to the watched table.

use async_trait::async_trait;

use crate::postgres::{Row, Watermark};
use crate::Result;

/// Reads new or updated rows of a table ordered by a watermark column.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Largest watermark currently in the table, or 0 when it is empty.
    ///
    /// Fails with [`Error::Query`](crate::Error::Query) when the underlying
    /// query fails.
    async fn latest_watermark(&self, table: &str, column: &str) -> Result<Watermark>;

    /// Up to `limit` rows with a watermark strictly greater than `after`,
    /// in ascending watermark order.
    ///
    /// An empty result is success. A table or column that cannot be
    /// resolved is [`Error::NotFound`](crate::Error::NotFound); any other
    /// failure is [`Error::Query`](crate::Error::Query).
    async fn list_from(
        &self,
        table: &str,
        column: &str,
        after: Watermark,
        limit: i64,
    ) -> Result<Vec<Row>>;
}
