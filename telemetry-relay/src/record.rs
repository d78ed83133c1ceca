use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use chrono::{DateTime, Datelike, Utc};
use tracing::{info, info_span, Span};

use crate::error::RecordError;

/// System metadata keys read from every inbound record.
pub mod keys {
    pub const MESSAGE_SOURCE: &str = "message-source";
    pub const DEVICE_ID: &str = "device-id";
    pub const ENQUEUE_TIME: &str = "enqueue-time";
    pub const SEQUENCE_NUMBER: &str = "sequence-number";
    pub const SCHEMA_ID: &str = "schema-id";

    pub const ALL: [&str; 5] = [
        MESSAGE_SOURCE,
        DEVICE_ID,
        ENQUEUE_TIME,
        SEQUENCE_NUMBER,
        SCHEMA_ID,
    ];
}

/// Application properties attached to a record. Ordered so their JSON form is stable.
pub type Properties = BTreeMap<String, String>;

/// Where a record was read from in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPosition {
    pub partition: i32,
    pub offset: i64,
}

/// A device event as delivered by the event stream.
#[derive(Debug, Clone, Default)]
pub struct InboundRecord {
    pub body: Bytes,
    pub system_properties: HashMap<String, String>,
    pub properties: Properties,
    pub position: Option<StreamPosition>,
}

impl InboundRecord {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_system_property(mut self, key: &str, value: &str) -> Self {
        self.system_properties
            .insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn with_position(mut self, partition: i32, offset: i64) -> Self {
        self.position = Some(StreamPosition { partition, offset });
        self
    }

    pub fn system_property(&self, key: &str) -> Option<&str> {
        self.system_properties.get(key).map(String::as_str)
    }
}

/// Why a device emitted a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageSource {
    Telemetry,
    TwinChange,
    DigitalTwinChange,
    DeviceLifecycle,
}

impl MessageSource {
    pub const ALL: [MessageSource; 4] = [
        MessageSource::Telemetry,
        MessageSource::TwinChange,
        MessageSource::DigitalTwinChange,
        MessageSource::DeviceLifecycle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageSource::Telemetry => "Telemetry",
            MessageSource::TwinChange => "twin-change",
            MessageSource::DigitalTwinChange => "digital-twin-change",
            MessageSource::DeviceLifecycle => "device-lifecycle",
        }
    }

    /// The value IoT Hub itself writes into `iothub-message-source`.
    fn hub_name(&self) -> &'static str {
        match self {
            MessageSource::Telemetry => "Telemetry",
            MessageSource::TwinChange => "twinChangeEvents",
            MessageSource::DigitalTwinChange => "digitalTwinChangeEvents",
            MessageSource::DeviceLifecycle => "deviceLifecycleEvents",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|source| source.as_str() == value || source.hub_name() == value)
    }
}

/// The classified origin of a record. Unknown categories are kept by name so they can
/// still be reported, but no transformer exists for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Category {
    Known(MessageSource),
    Unknown(String),
}

impl Category {
    pub fn name(&self) -> &str {
        match self {
            Category::Known(source) => source.as_str(),
            Category::Unknown(name) => name,
        }
    }
}

/// Metadata extracted from a record that carries a message source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub category: Category,
    pub device_id: String,
    pub enqueued_at: DateTime<Utc>,
    /// Only unique within a partition.
    pub sequence_number: String,
    pub schema_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The record has no message source and is skipped.
    Unsupported,
    Classified(RecordMetadata),
}

/// Logging context for a single record, handed to each pipeline stage.
#[derive(Debug, Clone)]
pub struct RecordContext {
    span: Span,
}

impl RecordContext {
    pub fn for_record(record: &InboundRecord) -> Self {
        let sequence_number = record.system_property(keys::SEQUENCE_NUMBER);
        let span = match record.position {
            Some(position) => info_span!(
                "record",
                partition = position.partition,
                offset = position.offset,
                sequence_number
            ),
            None => info_span!("record", sequence_number),
        };

        Self { span }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

/// Determine whether a record can be relayed and extract its metadata.
///
/// Records without a message source are `Unsupported`. Records with a message source but
/// missing one of the required keys fail with `RecordError::MissingMetadata`.
pub fn classify(
    record: &InboundRecord,
    ctx: &RecordContext,
) -> Result<Classification, RecordError> {
    let Some(source) = record.system_property(keys::MESSAGE_SOURCE) else {
        info!(parent: ctx.span(), "unsupported record without message source, skipping");
        return Ok(Classification::Unsupported);
    };

    let category = match MessageSource::parse(source) {
        Some(source) => Category::Known(source),
        None => Category::Unknown(source.to_owned()),
    };

    let sequence_number = required(record, keys::SEQUENCE_NUMBER)?.to_owned();
    let device_id = required(record, keys::DEVICE_ID)?.to_owned();
    let enqueued_at = parse_enqueue_time(required(record, keys::ENQUEUE_TIME)?)?;
    let schema_id = record
        .system_property(keys::SCHEMA_ID)
        .unwrap_or_default()
        .to_owned();

    Ok(Classification::Classified(RecordMetadata {
        category,
        device_id,
        enqueued_at,
        sequence_number,
        schema_id,
    }))
}

fn required<'a>(record: &'a InboundRecord, key: &'static str) -> Result<&'a str, RecordError> {
    record
        .system_property(key)
        .ok_or(RecordError::MissingMetadata(key))
}

/// Enqueue times arrive either as RFC 3339 text with any offset, or as epoch milliseconds.
/// Only years 0000 to 9999 are accepted, the envelope renders them with exactly four digits.
fn parse_enqueue_time(value: &str) -> Result<DateTime<Utc>, RecordError> {
    let invalid = |reason: &str| RecordError::InvalidMetadata {
        key: keys::ENQUEUE_TIME,
        value: value.to_owned(),
        reason: reason.to_owned(),
    };

    let time = match DateTime::parse_from_rfc3339(value) {
        Ok(time) => time.with_timezone(&Utc),
        Err(_) => {
            let millis = value
                .parse::<i64>()
                .map_err(|_| invalid("expected an RFC 3339 timestamp or epoch milliseconds"))?;

            DateTime::from_timestamp_millis(millis)
                .ok_or_else(|| invalid("timestamp out of range"))?
        }
    };

    if !(0..=9999).contains(&time.year()) {
        return Err(invalid("year must be between 0000 and 9999"));
    }

    Ok(time)
}
