//! External ports.
//!
//! The core only consumes these as trait objects; concrete transports,
//! protocol adapters, and persistence backends live outside this crate.
//! Each trait ships with an in-memory implementation so the crate is
//! exercisable end-to-end without any external system.

mod audit;
mod authz;
mod broker;
mod clock;
mod metrics;
mod peer;
mod port;
mod registry;
mod snapshot;
mod task;

pub use audit::{AuditLogService, InMemoryAuditLog};
pub use authz::{AllowAllAuthorization, AuthorizationDecision, AuthorizationService};
pub use broker::{BrokerEvent, InMemoryBroker, MessageBroker, topic_matches};
pub use clock::{Clock, SystemClock, TestClock};
pub use metrics::{MetricCollector, NoopMetricCollector};
pub use peer::{DeliveryQos, LoopbackPeerConnection, PeerConnection, PeerEnvelope};
pub use port::{LoopbackPort, Port, StreamPort, SynchronousPort};
pub use registry::{BlueprintRegistry, StaticBlueprintRegistry};
pub use snapshot::{InMemorySnapshotStore, Snapshot, SnapshotStore};
pub use task::{InMemoryTaskExecutor, TaskExecutor};

/// Failures raised by a port implementation, wrapped into [`crate::error::HubFault::Port`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum PortError {
    #[error("timed out")]
    Timeout,
    #[error("not connected")]
    NotConnected,
    #[error("unreachable")]
    Unreachable,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}
