use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, error, Instrument};

use crate::envelope::Notification;
use crate::error::{BatchError, RecordError};
use crate::health::HealthHandle;
use crate::record::{
    classify, Category, Classification, InboundRecord, RecordContext, RecordMetadata,
};
use crate::sink::{dispatch, NotificationSink};
use crate::transform::{Route, RoutingTarget};

/// What happened to a record that was relayed without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The record carries no message source.
    Skipped,
    /// The record was classified but produced no payload.
    Suppressed,
    Dispatched(RoutingTarget),
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Skipped => "skipped",
            Outcome::Suppressed => "suppressed",
            Outcome::Dispatched(_) => "dispatched",
        }
    }
}

/// Counts of the outcomes of a batch in which every record succeeded.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub dispatched: usize,
    pub suppressed: usize,
    pub skipped: usize,
}

impl BatchSummary {
    fn count(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Skipped => self.skipped += 1,
            Outcome::Suppressed => self.suppressed += 1,
            Outcome::Dispatched(_) => self.dispatched += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.dispatched + self.suppressed + self.skipped
    }
}

/// Classifies, transforms and forwards device records to a notification sink.
///
/// A `Relay` holds no per-record state: every record is handled on its own, and a batch
/// only remembers the errors it has to report once every record was attempted.
pub struct Relay {
    sink: Arc<dyn NotificationSink>,
    event_type: String,
    liveness: Option<HealthHandle>,
}

impl Relay {
    pub fn new(sink: Arc<dyn NotificationSink>, event_type: &str) -> Self {
        Self {
            sink,
            event_type: event_type.to_owned(),
            liveness: None,
        }
    }

    /// Report healthy on `liveness` after every relayed record.
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Relay every record of a batch in order, one at a time.
    ///
    /// Failing records do not stop the batch. Once all records were attempted, a single
    /// failure is returned as is, and several failures are returned as an aggregate.
    pub async fn process_batch(
        &self,
        records: &[InboundRecord],
    ) -> Result<BatchSummary, BatchError> {
        let (summary, errors) = stream::iter(records)
            .then(|record| self.relay_record(record))
            .fold(
                (BatchSummary::default(), Vec::<RecordError>::new()),
                |(mut summary, mut errors), result| async move {
                    match result {
                        Ok(outcome) => summary.count(outcome),
                        Err(error) => errors.push(error),
                    }
                    (summary, errors)
                },
            )
            .await;

        match BatchError::from_errors(errors) {
            Some(error) => Err(error),
            None => Ok(summary),
        }
    }

    async fn relay_record(&self, record: &InboundRecord) -> Result<Outcome, RecordError> {
        let ctx = RecordContext::for_record(record);
        let result = self.process_record(record, &ctx).await;

        let outcome = match &result {
            Ok(outcome) => outcome.label(),
            Err(error) => {
                error!(parent: ctx.span(), %error, "failed to relay record");
                "failed"
            }
        };
        metrics::counter!("relay_records_total", "outcome" => outcome).increment(1);

        if let Some(liveness) = &self.liveness {
            liveness.report_healthy();
        }

        result
    }

    /// Run a single record through classification, transformation and dispatch.
    pub async fn process_record(
        &self,
        record: &InboundRecord,
        ctx: &RecordContext,
    ) -> Result<Outcome, RecordError> {
        let metadata = match classify(record, ctx)? {
            Classification::Unsupported => return Ok(Outcome::Skipped),
            Classification::Classified(metadata) => metadata,
        };

        let route = match &metadata.category {
            Category::Known(source) => source.route(),
            Category::Unknown(name) => {
                debug!(
                    parent: ctx.span(),
                    category = %name,
                    "no transformer for category, suppressing"
                );
                return Ok(Outcome::Suppressed);
            }
        };

        self.deliver(route, record, &metadata, ctx).await
    }

    /// Transform a classified record along its route and dispatch the notification,
    /// unless the transformer produced no payload.
    async fn deliver(
        &self,
        route: Route,
        record: &InboundRecord,
        metadata: &RecordMetadata,
        ctx: &RecordContext,
    ) -> Result<Outcome, RecordError> {
        let data = (route.transform)(&record.body, &record.properties, ctx)?;
        let notification = Notification::new(&self.event_type, metadata).with_data(data);
        if !notification.is_deliverable() {
            debug!(
                parent: ctx.span(),
                category = metadata.category.name(),
                "transformer filtered record, suppressing"
            );
            return Ok(Outcome::Suppressed);
        }

        dispatch(self.sink.as_ref(), route.target, &notification)
            .instrument(ctx.span().clone())
            .await?;

        debug!(
            parent: ctx.span(),
            routing_target = %route.target,
            device_id = %notification.device_id,
            event_id = %notification.event_id,
            "notification dispatched"
        );

        Ok(Outcome::Dispatched(route.target))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::error::SinkError;
    use crate::health::HealthRegistry;
    use crate::record::keys;

    #[derive(Default)]
    struct CapturingSink {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationSink for CapturingSink {
        async fn send(&self, target: &str, _arguments: Vec<String>) -> Result<(), SinkError> {
            self.calls.lock().unwrap().push(target.to_owned());
            Ok(())
        }
    }

    /// Remembers whether the relay looked alive each time a notification went out.
    struct LivenessCheckingSink {
        registry: HealthRegistry,
        healthy_on_send: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl NotificationSink for LivenessCheckingSink {
        async fn send(&self, _target: &str, _arguments: Vec<String>) -> Result<(), SinkError> {
            let healthy = self.registry.get_status().healthy;
            self.healthy_on_send.lock().unwrap().push(healthy);
            Ok(())
        }
    }

    fn relay() -> (Relay, Arc<CapturingSink>) {
        let sink = Arc::new(CapturingSink::default());
        (Relay::new(sink.clone(), "IoTHub"), sink)
    }

    fn record(source: &str) -> InboundRecord {
        InboundRecord::new("payload")
            .with_system_property(keys::MESSAGE_SOURCE, source)
            .with_system_property(keys::DEVICE_ID, "sensor-1")
            .with_system_property(keys::ENQUEUE_TIME, "2024-03-01T10:15:30Z")
            .with_system_property(keys::SEQUENCE_NUMBER, "1")
    }

    #[tokio::test]
    async fn outcomes_per_category() {
        let (relay, _) = relay();
        let cases = [
            (
                record("Telemetry"),
                Outcome::Dispatched(RoutingTarget::DeviceTelemetry),
            ),
            (
                record("twin-change"),
                Outcome::Dispatched(RoutingTarget::DeviceTwinChange),
            ),
            (
                record("digital-twin-change"),
                Outcome::Dispatched(RoutingTarget::DigitalTwinChange),
            ),
            (
                record("device-lifecycle"),
                Outcome::Dispatched(RoutingTarget::DeviceLifecycle),
            ),
            (record("foo"), Outcome::Suppressed),
            (InboundRecord::new("payload"), Outcome::Skipped),
        ];

        for (record, expected) in cases {
            let ctx = RecordContext::for_record(&record);
            assert_eq!(relay.process_record(&record, &ctx).await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn empty_transformer_output_is_not_dispatched() {
        let (relay, sink) = relay();
        let record = record("Telemetry");
        let ctx = RecordContext::for_record(&record);
        let Classification::Classified(metadata) = classify(&record, &ctx).unwrap() else {
            panic!("expected a classified record");
        };
        let route = Route {
            target: RoutingTarget::DeviceTelemetry,
            transform: |_, _, _| Ok(None),
        };

        let outcome = relay.deliver(route, &record, &metadata, &ctx).await.unwrap();

        assert_eq!(outcome, Outcome::Suppressed);
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn liveness_is_reported_for_every_record() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("relay-consumer", time::Duration::seconds(30));
        let sink = Arc::new(LivenessCheckingSink {
            registry: registry.clone(),
            healthy_on_send: Mutex::new(Vec::new()),
        });
        let relay = Relay::new(sink.clone(), "IoTHub").with_liveness(handle);

        let records = vec![record("Telemetry"), record("Telemetry")];
        relay.process_batch(&records).await.unwrap();

        assert_eq!(*sink.healthy_on_send.lock().unwrap(), vec![false, true]);
        assert!(registry.get_status().healthy);
    }

    #[tokio::test]
    async fn summary_counts_every_outcome() {
        let (relay, sink) = relay();
        let records = vec![
            record("Telemetry"),
            record("foo"),
            InboundRecord::new("no source"),
            record("device-lifecycle"),
        ];

        let summary = relay.process_batch(&records).await.unwrap();

        assert_eq!(
            summary,
            BatchSummary {
                dispatched: 2,
                suppressed: 1,
                skipped: 1
            }
        );
        assert_eq!(summary.total(), records.len());
        assert_eq!(
            *sink.calls.lock().unwrap(),
            vec!["DeviceTelemetry", "DeviceLifecycle"]
        );
    }

    #[tokio::test]
    async fn empty_batch_succeeds() {
        let (relay, sink) = relay();

        let summary = relay.process_batch(&[]).await.unwrap();

        assert_eq!(summary, BatchSummary::default());
        assert!(sink.calls.lock().unwrap().is_empty());
    }
}
