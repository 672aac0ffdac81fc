//! Error taxonomy.
//!
//! [`HubFault`] carries *system* failures (the runtime couldn't do what you
//! asked: no such device, lock contention, port failure). [`DeviceFault`] is
//! a *business* failure returned inside `Ok(..)` from a device action or
//! property write — it is data, not a panic path. [`SerializableDeviceFailure`]
//! is the wire projection of a `DeviceFault` crossing a peer connection.

use crate::naming::{Address, Name};
use crate::meta::Meta;

/// System-level failures raised by the hub runtime, transaction coordinator,
/// or ports.
#[derive(Debug, thiserror::Error)]
pub enum HubFault {
    #[error("no device at {0}")]
    DeviceNotFound(Name),

    #[error("device {0} already attached")]
    DeviceAlreadyAttached(Name),

    #[error("no property {property:?} on device {device}")]
    NoSuchProperty { device: Name, property: String },

    #[error("no action {action:?} on device {device}")]
    NoSuchAction { device: Name, action: String },

    #[error("device {0} is not in a state that accepts this operation")]
    InvalidLifecycleState(Name),

    #[error("lock acquisition for {0:?} timed out")]
    LockTimeout(Vec<Name>),

    #[error("blueprint validation failed: {0}")]
    InvalidBlueprint(String),

    #[error("peer {0} unreachable")]
    PeerUnreachable(Address),

    #[error("port error: {0}")]
    Port(#[from] crate::ports::PortError),

    #[error("transaction {0} failed: {1}")]
    TransactionFailed(String, String),

    #[error("transaction {0} timed out")]
    TransactionTimeout(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("device reported a business fault: {0}")]
    Device(#[from] DeviceFault),

    #[error("internal error: {0}")]
    Internal(String),
}

/// A business-level failure returned by a device's action or property
/// write. Unlike [`HubFault`], this is expected, structured data flowing
/// through `Ok(..)`, not a system malfunction.
#[derive(Debug, Clone, PartialEq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[error("{code}: {message}")]
pub struct DeviceFault {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Meta>,
}

impl DeviceFault {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Meta) -> Self {
        self.details = Some(details);
        self
    }
}

/// Wire schema for a `DeviceFault` crossing a peer connection or transaction
/// result channel — a separate type from `DeviceFault` so the wire shape can
/// evolve independently of the in-process type.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SerializableDeviceFailure {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
    pub origin: Option<String>,
    /// The `source()` chain of the fault that produced this failure, outermost first.
    #[serde(default)]
    pub cause_chain: Vec<String>,
}

impl From<DeviceFault> for SerializableDeviceFailure {
    fn from(fault: DeviceFault) -> Self {
        Self {
            code: fault.code,
            message: fault.message,
            details: fault.details.map(|m| m.to_json()),
            origin: None,
            cause_chain: Vec::new(),
        }
    }
}

impl SerializableDeviceFailure {
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_cause_chain(mut self, chain: Vec<String>) -> Self {
        self.cause_chain = chain;
        self
    }

    /// Converts a terminal system failure into its wire shape, the form the
    /// transaction coordinator returns from a failed run. Unlike
    /// `From<DeviceFault>`, this also walks the fault's `source()` chain so
    /// callers can see what system-level cause (port error, lock timeout,
    /// ...) sits underneath a coordinator failure.
    pub fn from_hub_fault(fault: &HubFault) -> Self {
        if let HubFault::Device(inner) = fault {
            return Self::from(inner.clone());
        }
        let code = match fault {
            HubFault::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            HubFault::DeviceAlreadyAttached(_) => "DEVICE_ALREADY_ATTACHED",
            HubFault::NoSuchProperty { .. } => "NO_SUCH_PROPERTY",
            HubFault::NoSuchAction { .. } => "NO_SUCH_ACTION",
            HubFault::InvalidLifecycleState(_) => "INVALID_LIFECYCLE_STATE",
            HubFault::LockTimeout(_) => "LOCK_TIMEOUT",
            HubFault::InvalidBlueprint(_) => "INVALID_BLUEPRINT",
            HubFault::PeerUnreachable(_) => "PEER_UNREACHABLE",
            HubFault::Port(_) => "PORT_ERROR",
            HubFault::TransactionFailed(..) => "TRANSACTION_FAILED",
            HubFault::TransactionTimeout(_) => "TRANSACTION_TIMEOUT",
            HubFault::DeadlineExceeded => "DEADLINE_EXCEEDED",
            HubFault::Device(_) => unreachable!("handled above"),
            HubFault::Internal(_) => "INTERNAL",
        };
        Self {
            code: code.to_string(),
            message: fault.to_string(),
            details: None,
            origin: None,
            cause_chain: error_cause_chain(fault),
        }
    }
}

fn error_cause_chain(err: &dyn std::error::Error) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = err.source();
    while let Some(source) = current {
        chain.push(source.to_string());
        current = source.source();
    }
    chain
}

pub type HubResult<T> = Result<T, HubFault>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_fault_converts_to_wire_shape() {
        let fault = DeviceFault::new("OVER_TEMP", "too hot").with_details(Meta::leaf(95.0));
        let wire: SerializableDeviceFailure = fault.into();
        assert_eq!(wire.code, "OVER_TEMP");
        assert_eq!(wire.details, Some(serde_json::json!(95.0)));
    }

    #[test]
    fn from_hub_fault_carries_cause_chain_for_port_errors() {
        let fault = HubFault::Port(crate::ports::PortError::Timeout);
        let wire = SerializableDeviceFailure::from_hub_fault(&fault);
        assert_eq!(wire.code, "PORT_ERROR");
        assert!(wire.cause_chain.iter().any(|c| c.contains("timed out")));
    }

    #[test]
    fn from_hub_fault_unwraps_device_business_fault() {
        let fault = HubFault::Device(DeviceFault::new("E", "m"));
        let wire = SerializableDeviceFailure::from_hub_fault(&fault);
        assert_eq!(wire.code, "E");
    }

    #[test]
    fn hub_fault_wraps_device_fault() {
        let fault = DeviceFault::new("E", "m");
        let hub: HubFault = fault.clone().into();
        match hub {
            HubFault::Device(inner) => assert_eq!(inner, fault),
            _ => panic!("expected Device variant"),
        }
    }
}
