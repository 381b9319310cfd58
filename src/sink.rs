//! Destinations for published rows.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::KafkaConfig;
use crate::kafka::{JsonSerializer, KafkaProducer};
use crate::postgres::Row;
use crate::Result;

/// Forwards rows downstream, one at a time.
///
/// `submit` returning `Ok` means the row was accepted by the destination.
/// A failed submission must never be assumed delivered.
#[async_trait]
pub trait RowSink: Send + Sync {
    async fn submit(&self, row: &Row) -> Result<()>;

    /// Flushes anything still in flight.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Writes rows to the debug log. Used when no broker is configured.
pub struct LogSink {
    id: String,
    topic: String,
}

impl LogSink {
    pub fn new(id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl RowSink for LogSink {
    async fn submit(&self, row: &Row) -> Result<()> {
        let payload = JsonSerializer::serialize(row)?;
        debug!(producer_id = %self.id, topic = %self.topic, row = %payload, "Row published");
        Ok(())
    }
}

/// Picks the Kafka sink, or the log sink when no broker is configured.
pub fn build_sink(config: &KafkaConfig) -> Result<Box<dyn RowSink>> {
    if config.uses_broker() {
        Ok(Box::new(KafkaProducer::new(config)?))
    } else {
        warn!(
            id = %config.client_id,
            topic = %config.topic,
            "BROKERS is empty, using log producer"
        );
        Ok(Box::new(LogSink::new(&config.client_id, &config.topic)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_sink_accepts_rows() {
        let sink = LogSink::new("publisher-0", "flag-changes");
        let row = Row::new().with("id", 1).with("version", 3);
        sink.submit(&row).await.unwrap();
        sink.close().await.unwrap();
    }

    #[test]
    fn test_build_sink_without_brokers() {
        let config = KafkaConfig {
            brokers: vec![],
            topic: "flag-changes".to_string(),
            client_id: "publisher-0".to_string(),
            acks: "all".to_string(),
            message_timeout_ms: 5000,
        };
        assert!(build_sink(&config).is_ok());
    }
}
