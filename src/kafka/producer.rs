use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::{error, info};

use super::serializer::JsonSerializer;
use crate::config::KafkaConfig;
use crate::postgres::Row;
use crate::sink::RowSink;
use crate::{Error, Result};

/// Publishes each row as one Kafka message, without a key.
///
/// `submit` resolves only after the broker acknowledged the message.
pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
    brokers: String,
    client_id: String,
    delivery_timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let brokers = config.brokers.join(",");
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("client.id", &config.client_id)
            .set("acks", &config.acks)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .create()
            .map_err(Error::Kafka)?;

        info!(brokers = %brokers, topic = %config.topic, "Kafka producer created");

        Ok(Self {
            producer,
            topic: config.topic.clone(),
            brokers,
            client_id: config.client_id.clone(),
            delivery_timeout: Duration::from_millis(config.message_timeout_ms),
        })
    }

    pub async fn send(&self, payload: &str) -> Result<()> {
        let record = FutureRecord::<(), str>::to(&self.topic)
            .payload(payload)
            .timestamp(chrono::Utc::now().timestamp_millis());

        self.producer
            .send(record, Timeout::After(self.delivery_timeout))
            .await
            .map_err(|(e, _)| Error::Kafka(e))?;

        Ok(())
    }
}

#[async_trait]
impl RowSink for KafkaProducer {
    async fn submit(&self, row: &Row) -> Result<()> {
        let payload = JsonSerializer::serialize(row)?;
        self.send(&payload).await.map_err(|e| {
            error!(
                producer_id = %self.client_id,
                topic = %self.topic,
                broker = %self.brokers,
                error = %e,
                "Couldn't submit row"
            );
            e
        })
    }

    async fn close(&self) -> Result<()> {
        self.producer
            .flush(Timeout::After(self.delivery_timeout))
            .map_err(Error::Kafka)
    }
}
