use std::time::Duration;

use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message};
use rdkafka::ClientConfig;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ConsumerError;
use crate::health::HealthHandle;
use crate::record::{keys, InboundRecord};
use crate::relay::Relay;

/// Header names IoT Hub uses for the system properties the relay reads.
const SYSTEM_HEADER_ALIASES: [(&str, &str); 5] = [
    ("iothub-message-source", keys::MESSAGE_SOURCE),
    ("iothub-connection-device-id", keys::DEVICE_ID),
    ("iothub-enqueuedtime", keys::ENQUEUE_TIME),
    ("x-opt-sequence-number", keys::SEQUENCE_NUMBER),
    ("dt-dataschema", keys::SCHEMA_ID),
];

fn system_key(header: &str) -> Option<&'static str> {
    keys::ALL
        .into_iter()
        .find(|key| *key == header)
        .or_else(|| {
            SYSTEM_HEADER_ALIASES
                .into_iter()
                .find(|(alias, _)| alias.eq_ignore_ascii_case(header))
                .map(|(_, key)| key)
        })
}

/// Consumes device events from Kafka and relays them batch by batch.
pub struct RelayConsumer {
    consumer: StreamConsumer,
    relay: Relay,
    liveness: HealthHandle,
    batch_size: usize,
    batch_timeout: Duration,
}

impl RelayConsumer {
    pub fn new(
        config: &Config,
        relay: Relay,
        liveness: HealthHandle,
    ) -> Result<Self, ConsumerError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka.kafka_hosts)
            .set("group.id", &config.kafka_consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            .set("enable.partition.eof", "false");

        if config.kafka.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[config.kafka_topic.as_str()])?;

        info!(
            topic = config.kafka_topic,
            group_id = config.kafka_consumer_group,
            "kafka consumer subscribed"
        );

        Ok(Self {
            consumer,
            relay: relay.with_liveness(liveness.clone()),
            liveness,
            batch_size: config.batch_size.max(1),
            batch_timeout: config.batch_timeout.0,
        })
    }

    /// Relay batches until the shutdown signal flips. A batch in flight always completes.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        info!("starting relay loop");

        loop {
            if *shutdown.borrow() {
                info!("shutdown signal received, stopping relay loop");
                break;
            }

            let records = self.collect_batch().await;
            if records.is_empty() {
                continue;
            }

            metrics::counter!("relay_batches_total").increment(1);
            match self.relay.process_batch(&records).await {
                Ok(summary) => debug!(
                    records = summary.total(),
                    dispatched = summary.dispatched,
                    suppressed = summary.suppressed,
                    skipped = summary.skipped,
                    "batch relayed"
                ),
                Err(e) => {
                    error!(
                        error = %e,
                        records = records.len(),
                        failed = e.errors().len(),
                        "batch relayed with failures"
                    );
                    metrics::counter!("relay_batch_failures_total").increment(1);
                }
            }

            // Failed records are not retried, the batch is committed either way.
            if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Async) {
                warn!(error = %e, "failed to commit offsets");
            }
        }

        Ok(())
    }

    async fn collect_batch(&self) -> Vec<InboundRecord> {
        let mut records = Vec::with_capacity(self.batch_size);

        while records.len() < self.batch_size {
            self.liveness.report_healthy();
            match timeout(self.batch_timeout, self.consumer.recv()).await {
                Ok(Ok(message)) => records.push(record_from_message(&message)),
                Ok(Err(e)) => {
                    warn!(error = %e, "kafka recv error");
                    break;
                }
                // Timeout, relay what we have
                Err(_) => break,
            }
        }

        records
    }
}

/// Map a Kafka message to an inbound record.
///
/// Headers naming a system property become system properties, every other header is an
/// application property. The sequence number and enqueue time fall back to the message
/// offset and timestamp when no header carries them.
pub fn record_from_message<M: Message>(message: &M) -> InboundRecord {
    let body = message.payload().map(<[u8]>::to_vec).unwrap_or_default();
    let mut record = InboundRecord::new(body).with_position(message.partition(), message.offset());

    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            let Some(value) = header.value else {
                continue;
            };
            let value = String::from_utf8_lossy(value).into_owned();

            match system_key(header.key) {
                Some(key) => {
                    record.system_properties.insert(key.to_owned(), value);
                }
                None => {
                    record.properties.insert(header.key.to_owned(), value);
                }
            }
        }
    }

    if record.system_property(keys::SEQUENCE_NUMBER).is_none() {
        record = record.with_system_property(keys::SEQUENCE_NUMBER, &message.offset().to_string());
    }

    if record.system_property(keys::ENQUEUE_TIME).is_none() {
        if let Some(millis) = message.timestamp().to_millis() {
            record = record.with_system_property(keys::ENQUEUE_TIME, &millis.to_string());
        }
    }

    record
}
