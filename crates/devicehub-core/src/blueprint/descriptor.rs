//! Declarative descriptors for properties, actions, and streams.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::meta::{Meta, MetaDescriptor};
use crate::naming::Name;

/// What a property represents and where its value comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PropertyKind {
    /// Backed directly by device I/O (a read/write handle).
    Physical,
    /// Backed by an in-process cell with no external I/O.
    Logical,
    /// Computed from other properties by a pure function.
    Derived,
    /// A derived property constrained to `bool`, feeding guards and plan conditions.
    Predicate,
}

/// A validation rule applied to a property write before the write handle runs.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum ValidationRule {
    Range { min: Option<f64>, max: Option<f64> },
    Regex(String),
    MinLength(usize),
    Custom { id: String, meta: Meta },
}

#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum ValidationRuleError {
    #[error("value {value} is outside the allowed range [{min:?}, {max:?}]")]
    OutOfRange { value: f64, min: Option<f64>, max: Option<f64> },
    #[error("value does not match pattern {0:?}")]
    RegexMismatch(String),
    #[error("value shorter than minimum length {0}")]
    TooShort(usize),
    #[error("custom rule {0:?} rejected the value")]
    CustomRejected(String),
    #[error("rule requires a {0} leaf")]
    WrongLeafType(&'static str),
}

impl ValidationRule {
    /// Apply this rule to `value`, short-circuiting on the first failure.
    pub fn check(&self, value: &Meta) -> Result<(), ValidationRuleError> {
        match self {
            ValidationRule::Range { min, max } => {
                let v = value
                    .as_f64()
                    .ok_or(ValidationRuleError::WrongLeafType("numeric"))?;
                let within_min = min.map(|m| v >= m).unwrap_or(true);
                let within_max = max.map(|m| v <= m).unwrap_or(true);
                if within_min && within_max {
                    Ok(())
                } else {
                    Err(ValidationRuleError::OutOfRange { value: v, min: *min, max: *max })
                }
            }
            ValidationRule::Regex(pattern) => {
                let s = value
                    .as_str()
                    .ok_or(ValidationRuleError::WrongLeafType("string"))?;
                let matches = simple_glob_match(pattern, s);
                if matches {
                    Ok(())
                } else {
                    Err(ValidationRuleError::RegexMismatch(pattern.clone()))
                }
            }
            ValidationRule::MinLength(n) => {
                let s = value
                    .as_str()
                    .ok_or(ValidationRuleError::WrongLeafType("string"))?;
                if s.len() >= *n {
                    Ok(())
                } else {
                    Err(ValidationRuleError::TooShort(*n))
                }
            }
            ValidationRule::Custom { id, .. } => {
                // Custom rules are resolved by the device runtime's registered
                // validator set; a bare descriptor has nothing to run and
                // always rejects so misconfiguration fails loudly.
                Err(ValidationRuleError::CustomRejected(id.clone()))
            }
        }
    }
}

/// Minimal glob matcher (`*` = any run of characters) used for `Regex`
/// rules so the core stays free of a regex engine dependency for this one
/// descriptor use; richer matching is expected to be registered as `Custom`.
fn simple_glob_match(pattern: &str, text: &str) -> bool {
    fn go(p: &[u8], t: &[u8]) -> bool {
        match p.split_first() {
            None => t.is_empty(),
            Some((b'*', rest)) => (0..=t.len()).any(|i| go(rest, &t[i..])),
            Some((c, rest)) => t.first() == Some(c) && go(rest, &t[1..]),
        }
    }
    go(pattern.as_bytes(), text.as_bytes())
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct PropertyDescriptor {
    pub name: Name,
    pub kind: PropertyKind,
    pub value_type_name: String,
    pub readable: bool,
    pub mutable: bool,
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub required_locks: Vec<String>,
    pub meta_descriptor: MetaDescriptor,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub transient: bool,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub range: Option<(f64, f64)>,
    #[serde(default)]
    pub widget_hint: Option<String>,
}

impl PropertyDescriptor {
    pub fn physical(name: impl Into<Name>, value_type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::Physical,
            value_type_name: value_type_name.into(),
            readable: true,
            mutable: false,
            timeout: None,
            required_locks: Vec::new(),
            meta_descriptor: MetaDescriptor::Any,
            validation_rules: Vec::new(),
            permissions: Vec::new(),
            tags: Vec::new(),
            persistent: false,
            transient: false,
            unit: None,
            range: None,
            widget_hint: None,
        }
    }

    pub fn logical(name: impl Into<Name>, value_type_name: impl Into<String>) -> Self {
        Self { kind: PropertyKind::Logical, ..Self::physical(name, value_type_name) }
    }

    pub fn derived(name: impl Into<Name>, value_type_name: impl Into<String>) -> Self {
        Self { kind: PropertyKind::Derived, ..Self::physical(name, value_type_name) }
    }

    pub fn predicate(name: impl Into<Name>) -> Self {
        Self { kind: PropertyKind::Predicate, ..Self::physical(name, "bool") }
    }

    pub fn mutable(mut self) -> Self {
        self.mutable = true;
        self
    }

    pub fn with_validation(mut self, rule: ValidationRule) -> Self {
        self.validation_rules.push(rule);
        self
    }

    pub fn with_required_lock(mut self, lock_id: impl Into<String>) -> Self {
        self.required_locks.push(lock_id.into());
        self
    }

    pub fn with_meta_descriptor(mut self, descriptor: MetaDescriptor) -> Self {
        self.meta_descriptor = descriptor;
        self
    }
}

/// The operational FSM events an action posts around its invocation.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ActionOperationalEvents {
    pub on_invoke: Option<String>,
    pub on_success: Option<String>,
    pub on_failure: Option<String>,
}

/// Cache policy for an action's results, consulted by the transaction
/// coordinator before invoking the action.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub scope: CacheScope,
    #[serde(default)]
    pub invalidate_on: Vec<Name>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CacheScope {
    PerHub,
    PerPrincipal,
    Global,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ActionDescriptor {
    pub name: Name,
    pub input_descriptor: MetaDescriptor,
    pub output_descriptor: MetaDescriptor,
    #[serde(default)]
    pub default_timeout: Option<Duration>,
    #[serde(default)]
    pub execution_deadline: Option<Duration>,
    #[serde(default)]
    pub required_locks: Vec<String>,
    #[serde(default)]
    pub cache_policy: Option<CachePolicy>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub required_predicates: Vec<Name>,
    #[serde(default)]
    pub possible_faults: Vec<String>,
    #[serde(default)]
    pub operational_event_types: ActionOperationalEvents,
}

impl ActionDescriptor {
    pub fn new(name: impl Into<Name>) -> Self {
        Self {
            name: name.into(),
            input_descriptor: MetaDescriptor::Any,
            output_descriptor: MetaDescriptor::Any,
            default_timeout: None,
            execution_deadline: None,
            required_locks: Vec::new(),
            cache_policy: None,
            permissions: Vec::new(),
            required_predicates: Vec::new(),
            possible_faults: Vec::new(),
            operational_event_types: ActionOperationalEvents::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn requiring_predicate(mut self, predicate: impl Into<Name>) -> Self {
        self.required_predicates.push(predicate.into());
        self
    }

    pub fn with_required_lock(mut self, lock_id: impl Into<String>) -> Self {
        self.required_locks.push(lock_id.into());
        self
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct StreamSpec {
    pub name: Name,
    pub value_type_name: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Linkage mode for a local child: whether its lifecycle tracks the parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LifecycleMode {
    Linked,
    Independent,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ChildConfig {
    pub source: ChildSource,
    pub lifecycle_mode: LifecycleMode,
    #[serde(default)]
    pub lazy_attach: bool,
    #[serde(default)]
    pub bindings: Vec<super::binding::PropertyBinding>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum ChildSource {
    Local { blueprint_id: String },
    Remote { peer_name: String, remote_address_source: String },
}

impl ChildConfig {
    pub fn local(blueprint_id: impl Into<String>) -> Self {
        Self {
            source: ChildSource::Local { blueprint_id: blueprint_id.into() },
            lifecycle_mode: LifecycleMode::Linked,
            lazy_attach: false,
            bindings: Vec::new(),
        }
    }

    pub fn independent(mut self) -> Self {
        self.lifecycle_mode = LifecycleMode::Independent;
        self
    }

    pub fn lazy(mut self) -> Self {
        self.lazy_attach = true;
        self
    }

    pub fn with_binding(mut self, binding: super::binding::PropertyBinding) -> Self {
        self.bindings.push(binding);
        self
    }
}

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct PeerBlueprint {
    pub peer_name: String,
    pub remote_address_source: String,
}

/// What child-error policy a parent applies when a child transitions to `Failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ChildErrorPolicy {
    Restart,
    Stop,
    Escalate,
    Ignore,
}

/// Backoff family shared by restart policy and retry policy.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum BackoffStrategy {
    Fixed(Duration),
    Linear(Duration),
    Exponential(Duration),
    Fibonacci(Duration),
}

impl BackoffStrategy {
    /// Delay before attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            BackoffStrategy::Fixed(base) => *base,
            BackoffStrategy::Linear(base) => *base * attempt,
            BackoffStrategy::Exponential(base) => {
                let factor = 2u32.saturating_pow(attempt - 1);
                *base * factor
            }
            BackoffStrategy::Fibonacci(base) => *base * fibonacci(attempt),
        }
    }
}

fn fibonacci(n: u32) -> u32 {
    let (mut a, mut b) = (1u32, 1u32);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
    pub reset_on_success: bool,
}

impl RestartPolicy {
    pub fn new(max_attempts: u32, strategy: BackoffStrategy, reset_on_success: bool) -> Self {
        Self { max_attempts, strategy, reset_on_success }
    }
}

pub type PropertyMap = BTreeMap<Name, PropertyDescriptor>;
pub type ActionMap = BTreeMap<Name, ActionDescriptor>;
pub type StreamMap = BTreeMap<Name, StreamSpec>;
pub type ChildMap = BTreeMap<Name, ChildConfig>;
pub type PeerMap = BTreeMap<Name, PeerBlueprint>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_rule_rejects_out_of_bounds() {
        let rule = ValidationRule::Range { min: Some(0.0), max: Some(100.0) };
        assert!(rule.check(&Meta::leaf(50.0)).is_ok());
        assert!(rule.check(&Meta::leaf(150.0)).is_err());
    }

    #[test]
    fn min_length_rule() {
        let rule = ValidationRule::MinLength(3);
        assert!(rule.check(&Meta::leaf("ab")).is_err());
        assert!(rule.check(&Meta::leaf("abc")).is_ok());
    }

    #[test]
    fn glob_regex_rule() {
        let rule = ValidationRule::Regex("AX*".to_string());
        assert!(rule.check(&Meta::leaf("AXIS1")).is_ok());
        assert!(rule.check(&Meta::leaf("MOTOR")).is_err());
    }

    #[test]
    fn backoff_strategies_scale_with_attempt() {
        let base = Duration::from_millis(50);
        assert_eq!(BackoffStrategy::Linear(base).delay_for_attempt(3), base * 3);
        assert_eq!(BackoffStrategy::Exponential(base).delay_for_attempt(1), base);
        assert_eq!(BackoffStrategy::Exponential(base).delay_for_attempt(3), base * 4);
        assert_eq!(BackoffStrategy::Fibonacci(base).delay_for_attempt(1), base);
        assert_eq!(BackoffStrategy::Fibonacci(base).delay_for_attempt(5), base * 5);
    }
}
