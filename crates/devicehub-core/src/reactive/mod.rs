//! The reactive state graph: derived/predicate property recomputation and
//! timed guards layered on top of a device's property cells.

pub mod derived;
pub mod guard;

pub use derived::{spawn_derived_scheduler, DerivedScheduler};
pub use guard::{spawn_guard, spawn_value_change_guard, Guard, GuardConfig, ValueChangeGuard};
