//! The device message wire schema and its hub-level envelope.

use chrono::{DateTime, Utc};

use crate::blueprint::{LifecycleState, ExecutionContext};
use crate::error::SerializableDeviceFailure;
use crate::meta::Meta;
use crate::naming::{Address, CorrelationId, Name};
use crate::state::Quality;

/// One update carried by a `TelemetryPacket`.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TelemetryUpdate {
    pub property: Option<Name>,
    pub alias: Option<String>,
    pub raw_value: Meta,
    pub quality: Quality,
    pub timestamp: DateTime<Utc>,
}

/// A message emitted by a single device.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum DeviceMessageBody {
    PropertyChanged {
        property: Name,
        value: Meta,
        quality: Quality,
        origin_time: DateTime<Utc>,
        server_time: DateTime<Utc>,
    },
    LifecycleStateChanged {
        from: LifecycleState,
        to: LifecycleState,
    },
    DeviceError {
        failure: SerializableDeviceFailure,
    },
    DeviceAttached {
        device_name: Name,
    },
    DeviceDetached {
        device_name: Name,
    },
    PredicateChanged {
        predicate: Name,
        value: bool,
    },
    BinaryReady {
        content_id: String,
        content_meta: Meta,
    },
    BinaryRequest {
        content_id: String,
    },
    TelemetryPacket {
        updates: Vec<TelemetryUpdate>,
    },
}

/// A message together with its envelope fields, matching §6's wire schema.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct DeviceMessage {
    pub time: DateTime<Utc>,
    pub source_device: Address,
    pub target_device: Option<Address>,
    pub request_id: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    pub body: DeviceMessageBody,
}

impl DeviceMessage {
    pub fn new(time: DateTime<Utc>, source_device: Address, body: DeviceMessageBody) -> Self {
        Self { time, source_device, target_device: None, request_id: None, correlation_id: None, body }
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// A `DeviceMessage` wrapped with its causal context, constructed at
/// emission time so downstream subscribers never need to reconstruct
/// causality after the fact.
#[derive(Clone, Debug)]
pub struct DeviceHubEvent {
    pub message: DeviceMessage,
    pub exec_ctx: ExecutionContext,
}

impl DeviceHubEvent {
    pub fn new(message: DeviceMessage, exec_ctx: ExecutionContext) -> Self {
        Self { message, exec_ctx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::CorrelationId;

    #[test]
    fn device_message_carries_correlation() {
        let addr = Address::new("hub", Name::single("dev"));
        let message = DeviceMessage::new(
            Utc::now(),
            addr,
            DeviceMessageBody::DeviceAttached { device_name: Name::single("dev") },
        )
        .with_correlation(CorrelationId::new("corr-1"));
        assert_eq!(message.correlation_id.unwrap().as_str(), "corr-1");
    }
}
