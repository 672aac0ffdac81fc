//! # DeviceHub Core
//!
//! The runtime for composable, supervised device hubs: a reactive
//! property/action model (the [`device`] module), a supervisor that attaches,
//! starts, restarts, and tears down device trees (the [`hub`] module), a
//! saga-style transaction coordinator for multi-step device operations (the
//! [`coordinator`] module), and a reactive state graph of derived properties
//! and timed guards layered on top (the [`reactive`] module).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use devicehub_core::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = Arc::new(StaticBlueprintRegistry::new());
//!     let authz = Arc::new(AllowAllAuthorization);
//!     let clock = Arc::new(SystemClock);
//!     let hub = Arc::new(Hub::new("hub-1", registry, authz, clock));
//!     let _ = hub.shutdown_token();
//! }
//! ```

#![deny(unsafe_code)]

/// Declarative device specification: descriptors, features, children,
/// bindings, and the lifecycle/operational FSM builders.
pub mod blueprint;

/// Process-level tunables loaded from the environment.
pub mod config;

/// Saga-style transaction coordinator: plans, retries, compensation,
/// caching, and await-signal/predicate steps.
pub mod coordinator;

/// The attached device runtime: property cells, locks, lifecycle FSM.
pub mod device;

/// The error taxonomy shared by the hub, devices, and the coordinator.
pub mod error;

/// The hub supervisor: attach/detach/start/stop, restart policies, and
/// reactive property bindings between parent and child devices.
pub mod hub;

/// Dynamic value trees exchanged at every device boundary.
pub mod meta;

/// Addressing: hierarchical device names, hub addresses, correlation ids.
pub mod naming;

/// External ports the core depends on as trait objects, each with an
/// in-memory implementation for exercising the crate end-to-end.
pub mod ports;

/// Derived/predicate property recomputation and timed guards layered on
/// top of a device's property cells.
pub mod reactive;

/// Graceful shutdown coordination shared by the hub and the coordinator.
pub mod shutdown;

/// Reactive property cells: typed values, quality, and change notification.
pub mod state;

/// Commonly used imports for building a DeviceHub application.
pub mod prelude {
    pub use crate::blueprint::{
        ActionDescriptor, ActionHandle, Blueprint, BlueprintBuilder, BlueprintId, ChildConfig,
        ExecutionContext, LifecycleFsm, LifecycleState, PropertyDescriptor, ReadHandle,
        WriteHandle,
    };
    pub use crate::config::{ConfigError, FromEnv, RuntimeConfig};
    pub use crate::coordinator::{
        ActionResultCache, Coordinator, PlanAction, PlanNode, RetryPolicy, SignalTable,
        TransactionPlan, TransactionResult,
    };
    pub use crate::device::Device;
    pub use crate::error::{DeviceFault, HubFault, SerializableDeviceFailure};
    pub use crate::hub::Hub;
    pub use crate::meta::{Leaf, Meta};
    pub use crate::naming::{Address, CorrelationId, CorrelationIdFactory, Name, UuidCorrelationIdFactory};
    pub use crate::ports::{
        AllowAllAuthorization, AuthorizationService, BlueprintRegistry, Clock, InMemoryTaskExecutor,
        StaticBlueprintRegistry, SystemClock, TaskExecutor, TestClock,
    };
    pub use crate::reactive::{GuardConfig};
    pub use crate::shutdown::{GracefulShutdown, ShutdownSignal, ShutdownToken};
    pub use crate::state::{Cell, Quality, StateValue};
}
