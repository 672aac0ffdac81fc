//! Hierarchical naming: [`Name`], [`Address`], and [`CorrelationId`].
//!
//! A `Name` is an ordered sequence of unescaped tokens (`hub/device/sub`).
//! The empty name denotes the root of a device tree.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// An ordered, hierarchical sequence of name tokens.
///
/// Tokens are reference-counted so that `Name`s can be cheaply cloned and
/// shared across blueprints, cells, and observers.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Name(Vec<Arc<str>>);

impl Name {
    /// The empty name, denoting the root of a device tree.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Build a name from an iterator of tokens.
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        Self(tokens.into_iter().map(Into::into).collect())
    }

    /// A single-token name.
    pub fn single(token: impl Into<Arc<str>>) -> Self {
        Self(vec![token.into()])
    }

    /// Whether this is the root (empty) name.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of tokens.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this name has no tokens.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrowed view of the tokens.
    pub fn tokens(&self) -> &[Arc<str>] {
        &self.0
    }

    /// Whether `self` starts with `prefix`, token for token.
    pub fn starts_with(&self, prefix: &Name) -> bool {
        prefix.0.len() <= self.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// Remove the first `n` tokens, returning the remainder. Returns `None`
    /// if `self` has fewer than `n` tokens.
    pub fn remove_first(&self, n: usize) -> Option<Name> {
        if n > self.0.len() {
            return None;
        }
        Some(Name(self.0[n..].to_vec()))
    }

    /// The first token, if any.
    pub fn head(&self) -> Option<&Arc<str>> {
        self.0.first()
    }

    /// Append `other`'s tokens, returning a new name.
    pub fn join(&self, other: &Name) -> Name {
        let mut tokens = self.0.clone();
        tokens.extend(other.0.iter().cloned());
        Name(tokens)
    }

    /// Append a single token, returning a new name.
    pub fn push(&self, token: impl Into<Arc<str>>) -> Name {
        let mut tokens = self.0.clone();
        tokens.push(token.into());
        Name(tokens)
    }
}

impl std::ops::Add for Name {
    type Output = Name;
    fn add(self, rhs: Name) -> Name {
        self.join(&rhs)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{token}")?;
        }
        Ok(())
    }
}

/// Error returned when a string cannot be parsed as a [`Name`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid name token: {0:?}")]
pub struct NameParseError(String);

impl FromStr for Name {
    type Err = NameParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Name::root());
        }
        let mut tokens = Vec::new();
        for part in s.split('/') {
            if part.is_empty() {
                return Err(NameParseError(s.to_string()));
            }
            tokens.push(Arc::from(part));
        }
        Ok(Name(tokens))
    }
}

impl From<&str> for Name {
    fn from(s: &str) -> Self {
        s.parse().unwrap_or_else(|_| Name::single(s))
    }
}

/// Globally identifies a device: the hub it lives in plus its path.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Address {
    pub hub_id: Arc<str>,
    pub device: Name,
}

impl Address {
    pub fn new(hub_id: impl Into<Arc<str>>, device: Name) -> Self {
        Self {
            hub_id: hub_id.into(),
            device,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.hub_id, self.device)
    }
}

/// Opaque id carried through every causally related operation, used to tie
/// together messages emitted by the same logical request across device
/// boundaries and transport hops.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generates fresh [`CorrelationId`]s.
///
/// Injectable so tests can produce deterministic ids instead of depending on
/// `uuid`'s global RNG directly in hot code paths.
pub trait CorrelationIdFactory: Send + Sync {
    fn next(&self) -> CorrelationId;
}

/// Default factory, backed by random UUIDv4s.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidCorrelationIdFactory;

impl CorrelationIdFactory for UuidCorrelationIdFactory {
    fn next(&self) -> CorrelationId {
        CorrelationId::new(uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_name_is_empty() {
        let root = Name::root();
        assert!(root.is_root());
        assert_eq!(root.to_string(), "");
    }

    #[test]
    fn parse_and_display_round_trip() {
        let name: Name = "hub/device/sub".parse().unwrap();
        assert_eq!(name.to_string(), "hub/device/sub");
        assert_eq!(name.len(), 3);
    }

    #[test]
    fn starts_with_and_remove_first() {
        let name = Name::from_tokens(["a", "b", "c"]);
        let prefix = Name::from_tokens(["a", "b"]);
        assert!(name.starts_with(&prefix));
        assert_eq!(name.remove_first(2).unwrap(), Name::single("c"));
        assert!(name.remove_first(10).is_none());
    }

    #[test]
    fn join_and_add() {
        let a = Name::single("a");
        let b = Name::single("b");
        assert_eq!(a.clone().join(&b), Name::from_tokens(["a", "b"]));
        assert_eq!(a + b, Name::from_tokens(["a", "b"]));
    }

    #[test]
    fn address_display() {
        let addr = Address::new("hub-1", Name::from_tokens(["motor", "axis1"]));
        assert_eq!(addr.to_string(), "hub-1::motor/axis1");
    }

    #[test]
    fn uuid_factory_yields_unique_ids() {
        let factory = UuidCorrelationIdFactory;
        assert_ne!(factory.next(), factory.next());
    }
}
