//! A small, generic finite-state-machine engine, instantiated once for the
//! fixed device lifecycle vocabulary and once per blueprint for the
//! optional, user-defined operational FSM.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::meta::Meta;

/// The fixed lifecycle state vocabulary every device goes through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum LifecycleState {
    Detached,
    Attaching,
    Stopped,
    Starting,
    Running,
    Stopping,
    Detaching,
    Failed,
}

/// The fixed lifecycle event vocabulary.
#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleEvent {
    Attach,
    Start,
    Stop,
    Reset,
    Detach,
    Fail(String),
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A transition table entry: from which state, on which event, to which
/// state, with an optional action run on entry.
type TransitionFn<S, E> = Arc<dyn Fn(&S, &E) -> Option<S> + Send + Sync>;

/// A generic, observable finite state machine. `S` is the state type, `E`
/// the event type posted to it.
pub struct StateMachine<S, E> {
    current: RwLock<S>,
    transition: TransitionFn<S, E>,
    tx: watch::Sender<S>,
}

impl<S, E> StateMachine<S, E>
where
    S: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(initial: S, transition: TransitionFn<S, E>) -> Self {
        let (tx, _rx) = watch::channel(initial.clone());
        Self { current: RwLock::new(initial), transition, tx }
    }

    pub fn current(&self) -> S {
        self.current.read().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.tx.subscribe()
    }

    /// Post an event. Returns the state transitioned to, or `None` if the
    /// event is not accepted from the current state.
    pub fn post(&self, event: &E) -> Option<S> {
        let mut current = self.current.write();
        let next = (self.transition)(&current, event)?;
        if next != *current {
            *current = next.clone();
            let _ = self.tx.send(next.clone());
        }
        Some(next)
    }
}

/// Build the fixed lifecycle transition function described by the device
/// lifecycle vocabulary: `Failed` is reachable from any operational state.
pub fn lifecycle_transition() -> TransitionFn<LifecycleState, LifecycleEvent> {
    use LifecycleEvent::*;
    use LifecycleState::*;
    Arc::new(|state, event| match (state, event) {
        (_, Fail(_)) if *state != Detached && *state != Failed => Some(Failed),
        (Detached, Attach) => Some(Attaching),
        (Attaching, _) => Some(Stopped),
        (Stopped, Start) => Some(Starting),
        (Starting, _) => Some(Running),
        (Running, Stop) => Some(Stopping),
        (Stopping, _) => Some(Stopped),
        (Stopped, Detach) => Some(Detaching),
        (Detaching, _) => Some(Detached),
        (Failed, Reset) => Some(Stopped),
        _ => None,
    })
}

pub type LifecycleFsm = StateMachine<LifecycleState, LifecycleEvent>;

pub fn new_lifecycle_fsm() -> LifecycleFsm {
    StateMachine::new(LifecycleState::Detached, lifecycle_transition())
}

/// A user-defined operational state, named freely by the blueprint author.
pub type OperationalState = Arc<str>;

/// A signal posted to the operational FSM, optionally carrying data.
#[derive(Clone, Debug)]
pub struct OperationalEvent {
    pub name: Arc<str>,
    pub meta: Option<Meta>,
}

impl OperationalEvent {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self { name: name.into(), meta: None }
    }

    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// A builder for a user-defined operational FSM: a flat transition table of
/// `(from, event_name) -> to`.
#[derive(Default)]
pub struct OperationalFsmBuilder {
    transitions: HashMap<(OperationalState, Arc<str>), OperationalState>,
    initial: Option<OperationalState>,
}

impl OperationalFsmBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initial(mut self, state: impl Into<OperationalState>) -> Self {
        self.initial = Some(state.into());
        self
    }

    pub fn on(mut self, from: impl Into<OperationalState>, event: impl Into<Arc<str>>, to: impl Into<OperationalState>) -> Self {
        self.transitions.insert((from.into(), event.into()), to.into());
        self
    }

    /// Freeze the transition table into a reusable [`OperationalFsmSpec`],
    /// one of which is instantiated into a fresh [`OperationalFsm`] per
    /// device.
    pub fn build(self) -> OperationalFsmSpec {
        OperationalFsmSpec {
            initial: self.initial.unwrap_or_else(|| Arc::from("Idle")),
            transitions: Arc::new(self.transitions),
        }
    }
}

/// An immutable, shareable operational FSM description, produced once by an
/// [`OperationalFsmBuilder`] and instantiated into a fresh [`OperationalFsm`]
/// every time a device is created from the owning blueprint.
#[derive(Clone)]
pub struct OperationalFsmSpec {
    initial: OperationalState,
    transitions: Arc<HashMap<(OperationalState, Arc<str>), OperationalState>>,
}

impl OperationalFsmSpec {
    pub fn instantiate(&self) -> OperationalFsm {
        let transitions = self.transitions.clone();
        let transition: TransitionFn<OperationalState, OperationalEvent> = Arc::new(move |state, event| {
            transitions.get(&(state.clone(), event.name.clone())).cloned()
        });
        StateMachine::new(self.initial.clone(), transition)
    }
}

pub type OperationalFsm = StateMachine<OperationalState, OperationalEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_happy_path() {
        let fsm = new_lifecycle_fsm();
        assert_eq!(fsm.post(&LifecycleEvent::Attach), Some(LifecycleState::Attaching));
        assert_eq!(fsm.post(&LifecycleEvent::Attach), Some(LifecycleState::Stopped));
        assert_eq!(fsm.post(&LifecycleEvent::Start), Some(LifecycleState::Starting));
        assert_eq!(fsm.post(&LifecycleEvent::Start), Some(LifecycleState::Running));
        assert_eq!(fsm.post(&LifecycleEvent::Stop), Some(LifecycleState::Stopping));
        assert_eq!(fsm.post(&LifecycleEvent::Stop), Some(LifecycleState::Stopped));
    }

    #[test]
    fn fail_reachable_from_any_operational_state() {
        let fsm = new_lifecycle_fsm();
        fsm.post(&LifecycleEvent::Attach);
        fsm.post(&LifecycleEvent::Attach);
        fsm.post(&LifecycleEvent::Start);
        assert_eq!(fsm.current(), LifecycleState::Starting);
        assert_eq!(fsm.post(&LifecycleEvent::Fail("boom".into())), Some(LifecycleState::Failed));
        assert_eq!(fsm.post(&LifecycleEvent::Reset), Some(LifecycleState::Stopped));
    }

    #[test]
    fn rejects_invalid_transition() {
        let fsm = new_lifecycle_fsm();
        assert_eq!(fsm.post(&LifecycleEvent::Start), None);
        assert_eq!(fsm.current(), LifecycleState::Detached);
    }

    #[test]
    fn operational_fsm_posts_custom_events() {
        let fsm = OperationalFsmBuilder::new()
            .initial("Running")
            .on("Running", "Cooldown", "CoolingDown")
            .build()
            .instantiate();
        assert_eq!(fsm.post(&OperationalEvent::new("Cooldown")), Some(Arc::from("CoolingDown")));
        assert_eq!(fsm.post(&OperationalEvent::new("Unknown")), None);
    }
}
