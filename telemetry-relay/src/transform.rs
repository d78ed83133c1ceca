use std::borrow::Cow;
use std::fmt;

use tracing::{trace, warn};

use crate::error::RecordError;
use crate::record::{MessageSource, Properties, RecordContext};

/// Produces the payload of a notification from a record's body and properties.
/// Returning `None` suppresses delivery of the notification.
pub type Transformer =
    fn(&[u8], &Properties, &RecordContext) -> Result<Option<String>, RecordError>;

/// The channel of the push service that receives notifications of a given category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingTarget {
    DeviceTelemetry,
    DeviceTwinChange,
    DigitalTwinChange,
    DeviceLifecycle,
}

impl RoutingTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingTarget::DeviceTelemetry => "DeviceTelemetry",
            RoutingTarget::DeviceTwinChange => "DeviceTwinChange",
            RoutingTarget::DigitalTwinChange => "DigitalTwinChange",
            RoutingTarget::DeviceLifecycle => "DeviceLifecycle",
        }
    }
}

impl fmt::Display for RoutingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How records of a known category are transformed and where they are sent.
#[derive(Clone, Copy)]
pub struct Route {
    pub target: RoutingTarget,
    pub transform: Transformer,
}

impl MessageSource {
    pub fn route(self) -> Route {
        match self {
            MessageSource::Telemetry => Route {
                target: RoutingTarget::DeviceTelemetry,
                transform: telemetry,
            },
            MessageSource::TwinChange => Route {
                target: RoutingTarget::DeviceTwinChange,
                transform: twin_change,
            },
            MessageSource::DigitalTwinChange => Route {
                target: RoutingTarget::DigitalTwinChange,
                transform: digital_twin_change,
            },
            MessageSource::DeviceLifecycle => Route {
                target: RoutingTarget::DeviceLifecycle,
                transform: device_lifecycle,
            },
        }
    }
}

pub fn telemetry(
    body: &[u8],
    _properties: &Properties,
    ctx: &RecordContext,
) -> Result<Option<String>, RecordError> {
    Ok(Some(decode_body(body, ctx)))
}

pub fn twin_change(
    body: &[u8],
    _properties: &Properties,
    ctx: &RecordContext,
) -> Result<Option<String>, RecordError> {
    Ok(Some(decode_body(body, ctx)))
}

pub fn digital_twin_change(
    body: &[u8],
    _properties: &Properties,
    ctx: &RecordContext,
) -> Result<Option<String>, RecordError> {
    Ok(Some(decode_body(body, ctx)))
}

/// Lifecycle events carry their information in the properties, the body is ignored.
pub fn device_lifecycle(
    _body: &[u8],
    properties: &Properties,
    ctx: &RecordContext,
) -> Result<Option<String>, RecordError> {
    let payload = serde_json::to_string(properties)?;
    trace!(parent: ctx.span(), properties = properties.len(), "serialized lifecycle properties");

    Ok(Some(payload))
}

/// Invalid UTF-8 sequences are replaced rather than failing the record.
fn decode_body(body: &[u8], ctx: &RecordContext) -> String {
    match String::from_utf8_lossy(body) {
        Cow::Borrowed(payload) => payload.to_owned(),
        Cow::Owned(payload) => {
            warn!(parent: ctx.span(), "record body is not valid UTF-8, invalid sequences replaced");
            payload
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::record::InboundRecord;

    use super::*;

    fn run(source: MessageSource, record: &InboundRecord) -> Option<String> {
        let ctx = RecordContext::for_record(record);
        (source.route().transform)(&record.body, &record.properties, &ctx)
            .expect("transform should not fail")
    }

    #[test]
    fn body_categories_decode_the_body_verbatim() {
        let record = InboundRecord::new(r#"{"temperature": 21.5}"#).with_property("fw", "1.2");

        for source in [
            MessageSource::Telemetry,
            MessageSource::TwinChange,
            MessageSource::DigitalTwinChange,
        ] {
            assert_eq!(
                run(source, &record).as_deref(),
                Some(r#"{"temperature": 21.5}"#)
            );
        }
    }

    #[test]
    fn lifecycle_serializes_properties_and_ignores_body() {
        let record = InboundRecord::new("ignored")
            .with_property("opType", "createDeviceIdentity")
            .with_property("fw", "1.2");

        assert_eq!(
            run(MessageSource::DeviceLifecycle, &record).as_deref(),
            Some(r#"{"fw":"1.2","opType":"createDeviceIdentity"}"#)
        );
    }

    #[test]
    fn lifecycle_without_properties_is_an_empty_object() {
        let record = InboundRecord::new("ignored");

        assert_eq!(
            run(MessageSource::DeviceLifecycle, &record).as_deref(),
            Some("{}")
        );
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let record = InboundRecord::new(vec![b't', 0xff, b'x']);

        assert_eq!(
            run(MessageSource::Telemetry, &record).as_deref(),
            Some("t\u{fffd}x")
        );
    }

    #[test]
    fn transforms_do_not_touch_the_record() {
        let record = InboundRecord::new("temp=21").with_property("fw", "1.2");
        let before = (record.body.clone(), record.properties.clone());

        for source in MessageSource::ALL {
            run(source, &record);
        }

        assert_eq!((record.body, record.properties), before);
    }

    #[test]
    fn each_category_has_its_own_target() {
        let targets: Vec<&str> = MessageSource::ALL
            .into_iter()
            .map(|source| source.route().target.as_str())
            .collect();

        assert_eq!(
            targets,
            vec![
                "DeviceTelemetry",
                "DeviceTwinChange",
                "DigitalTwinChange",
                "DeviceLifecycle"
            ]
        );
    }
}
