//! Action result cache consulted before `Invoke` runs an action declaring a
//! `CachePolicy`, and invalidated as the hub's own property-change events
//! flow past.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::blueprint::{CachePolicy, CacheScope};
use crate::meta::Meta;
use crate::naming::Name;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    device: Name,
    action: Name,
    input: String,
    scope_key: Option<String>,
}

impl CacheKey {
    fn new(device: &Name, action: &Name, input: &Meta, scope: CacheScope, principal: Option<&str>) -> Self {
        let scope_key = match scope {
            CacheScope::Global => None,
            CacheScope::PerHub => Some("hub".to_string()),
            CacheScope::PerPrincipal => Some(principal.unwrap_or("anonymous").to_string()),
        };
        Self { device: device.clone(), action: action.clone(), input: input.to_json().to_string(), scope_key }
    }
}

struct CacheEntry {
    value: Meta,
    expires_at: DateTime<Utc>,
    invalidate_on: Vec<Name>,
}

/// In-memory cache keyed by `(device, action, canonical input, scope)`.
#[derive(Default)]
pub struct ActionResultCache {
    entries: DashMap<CacheKey, CacheEntry>,
}

impl ActionResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device: &Name, action: &Name, input: &Meta, policy: &CachePolicy, principal: Option<&str>, now: DateTime<Utc>) -> Option<Meta> {
        let key = CacheKey::new(device, action, input, policy.scope, principal);
        let hit = self.entries.get(&key)?;
        if hit.expires_at <= now {
            drop(hit);
            self.entries.remove(&key);
            return None;
        }
        Some(hit.value.clone())
    }

    pub fn put(&self, device: &Name, action: &Name, input: &Meta, policy: &CachePolicy, principal: Option<&str>, value: Meta, now: DateTime<Utc>) {
        let key = CacheKey::new(device, action, input, policy.scope, principal);
        let ttl = chrono::Duration::from_std(policy.ttl).unwrap_or_default();
        self.entries.insert(key, CacheEntry { value, expires_at: now + ttl, invalidate_on: policy.invalidate_on.clone() });
    }

    /// Drops any cached result for `device` whose policy names `property` in
    /// `invalidateOn`, called as the coordinator observes hub events.
    pub fn invalidate(&self, device: &Name, property: &Name) {
        self.entries.retain(|key, entry| !(&key.device == device && entry.invalidate_on.contains(property)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(ttl_secs: u64, scope: CacheScope) -> CachePolicy {
        CachePolicy { ttl: std::time::Duration::from_secs(ttl_secs), scope, invalidate_on: vec![Name::single("temperature")] }
    }

    #[test]
    fn put_then_get_returns_value_before_expiry() {
        let cache = ActionResultCache::new();
        let now = Utc::now();
        let device = Name::single("m1");
        let action = Name::single("calibrate");
        let input = Meta::leaf(1i64);
        cache.put(&device, &action, &input, &policy(60, CacheScope::Global), None, Meta::leaf("ok"), now);
        let hit = cache.get(&device, &action, &input, &policy(60, CacheScope::Global), None, now);
        assert_eq!(hit, Some(Meta::leaf("ok")));
    }

    #[test]
    fn expired_entry_is_evicted_on_read() {
        let cache = ActionResultCache::new();
        let now = Utc::now();
        let device = Name::single("m1");
        let action = Name::single("calibrate");
        let input = Meta::leaf(1i64);
        cache.put(&device, &action, &input, &policy(1, CacheScope::Global), None, Meta::leaf("ok"), now);
        let later = now + chrono::Duration::seconds(5);
        assert!(cache.get(&device, &action, &input, &policy(1, CacheScope::Global), None, later).is_none());
    }

    #[test]
    fn per_principal_scope_isolates_callers() {
        let cache = ActionResultCache::new();
        let now = Utc::now();
        let device = Name::single("m1");
        let action = Name::single("calibrate");
        let input = Meta::leaf(1i64);
        cache.put(&device, &action, &input, &policy(60, CacheScope::PerPrincipal), Some("alice"), Meta::leaf("ok"), now);
        assert!(cache.get(&device, &action, &input, &policy(60, CacheScope::PerPrincipal), Some("bob"), now).is_none());
        assert!(cache.get(&device, &action, &input, &policy(60, CacheScope::PerPrincipal), Some("alice"), now).is_some());
    }

    #[test]
    fn invalidate_on_matching_property_drops_entry() {
        let cache = ActionResultCache::new();
        let now = Utc::now();
        let device = Name::single("m1");
        let action = Name::single("calibrate");
        let input = Meta::leaf(1i64);
        cache.put(&device, &action, &input, &policy(60, CacheScope::Global), None, Meta::leaf("ok"), now);
        cache.invalidate(&device, &Name::single("temperature"));
        assert!(cache.get(&device, &action, &input, &policy(60, CacheScope::Global), None, now).is_none());
    }
}
