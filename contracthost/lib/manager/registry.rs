use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::token::Token;

use super::Instance;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The set of live instances, keyed by token, with a per-token lock table.
///
/// Creation and replacement of the instance for a token happen while holding that token's
/// creation lock, so two connections racing on a cold token cannot both start a sandbox.
/// Lookups never wait on a creation in progress.
#[derive(Default)]
pub struct InstanceRegistry {
    /// The live instance of each token.
    live: Mutex<HashMap<Token, Arc<Instance>>>,

    /// The creation lock of each token that has a live instance or a creation in flight.
    locks: Mutex<HashMap<Token, Arc<tokio::sync::Mutex<()>>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl InstanceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live instance for `token`, if any.
    pub fn get(&self, token: &Token) -> Option<Arc<Instance>> {
        self.live().get(token).cloned()
    }

    /// Returns every live instance.
    pub fn all(&self) -> Vec<Arc<Instance>> {
        self.live().values().cloned().collect()
    }

    /// Returns the number of live instances.
    pub fn len(&self) -> usize {
        self.live().len()
    }

    /// Returns true if no instance is live.
    pub fn is_empty(&self) -> bool {
        self.live().is_empty()
    }

    /// Returns the creation lock for `token`, adding it to the table if needed.
    pub(crate) fn creation_lock(&self, token: &Token) -> Arc<tokio::sync::Mutex<()>> {
        self.locks()
            .entry(token.clone())
            .or_default()
            .clone()
    }

    /// Records `instance` as the live instance of its token, replacing any previous one.
    ///
    /// Must be called while holding the token's creation lock.
    pub(crate) fn insert(&self, instance: Arc<Instance>) {
        self.live().insert(instance.token().clone(), instance);
    }

    /// Removes `instance` if it is still the live instance of its token.
    ///
    /// A newer instance registered for the same token is left untouched.
    pub(crate) fn remove(&self, instance: &Arc<Instance>) -> bool {
        let token = instance.token();
        let removed = {
            let mut live = self.live();
            match live.get(token) {
                Some(current) if Arc::ptr_eq(current, instance) => {
                    live.remove(token);
                    true
                }
                _ => false,
            }
        };

        self.prune(token);
        removed
    }

    /// Drops the creation lock of `token` when nobody holds it and no instance is live.
    pub(crate) fn prune(&self, token: &Token) {
        let live = self.live();
        let mut locks = self.locks();
        if live.contains_key(token) {
            return;
        }

        if let Some(lock) = locks.get(token) {
            // The table's own reference is the only one left.
            if Arc::strong_count(lock) == 1 {
                locks.remove(token);
            }
        }
    }

    fn live(&self) -> MutexGuard<'_, HashMap<Token, Arc<Instance>>> {
        self.live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<Token, Arc<tokio::sync::Mutex<()>>>> {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn lock_count(&self) -> usize {
        self.locks().len()
    }
}
