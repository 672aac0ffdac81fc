//! Per-device named resource locks, acquired in a globally-consistent order
//! to prevent deadlock between operations that declare overlapping
//! `requiredLocks` sets.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::HubFault;
use crate::naming::Name;

/// Holds one acquired lock at a time; dropping it releases the lock in LIFO
/// order relative to acquisition, matching "release in reverse on every
/// exit path".
pub struct LockGuard {
    guards: Vec<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        while self.guards.pop().is_some() {}
    }
}

/// A device's table of named locks, created lazily on first reference.
#[derive(Default)]
pub struct LockTable {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Acquire every lock in `ids`, sorted lexicographically first so two
    /// operations that declare overlapping lock sets always acquire them in
    /// the same order. Each acquisition respects `per_lock_timeout`;
    /// on timeout, any already-acquired locks are released before returning.
    pub async fn acquire_all(&self, ids: &[String], per_lock_timeout: Duration) -> Result<LockGuard, HubFault> {
        let sorted: BTreeSet<String> = ids.iter().cloned().collect();
        let sorted: Vec<String> = sorted.into_iter().collect();
        let mut guards = Vec::with_capacity(sorted.len());
        for id in &sorted {
            let lock = self.lock_for(id);
            match timeout(per_lock_timeout, lock.lock_owned()).await {
                Ok(guard) => guards.push(guard),
                Err(_) => {
                    return Err(HubFault::LockTimeout(
                        sorted.iter().map(|s| Name::from(s.as_str())).collect(),
                    ));
                }
            }
        }
        Ok(LockGuard { guards })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_locks_in_sorted_order() {
        let table = LockTable::new();
        let guard = table
            .acquire_all(&["b".to_string(), "a".to_string()], Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(guard.guards.len(), 2);
    }

    #[tokio::test]
    async fn second_acquisition_times_out_while_first_holds() {
        let table = Arc::new(LockTable::new());
        let _held = table.acquire_all(&["x".to_string()], Duration::from_millis(50)).await.unwrap();
        let table2 = table.clone();
        let result = table2.acquire_all(&["x".to_string()], Duration::from_millis(20)).await;
        assert!(matches!(result, Err(HubFault::LockTimeout(_))));
    }
}
