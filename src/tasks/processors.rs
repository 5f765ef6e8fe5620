//! In-process single-flight guard: at most one processing loop per session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Sessions with a live processing loop in this process.
///
/// Advisory only. Cross-process exclusion comes from the store's
/// write-locked claims. Each claim carries a generation so a loop that
/// outlives a forced [`unregister`](Self::unregister) cannot release the
/// claim of the loop that replaced it.
#[derive(Debug, Default)]
pub struct ProcessorRegistry {
    next_generation: AtomicU64,
    active: Mutex<HashMap<String, u64>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the session. Returns the claim's generation, or `None` if
    /// another loop already holds it.
    pub fn register(&self, session_id: &str) -> Option<u64> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(session_id) {
            return None;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        active.insert(session_id.to_string(), generation);
        Some(generation)
    }

    /// Drop the session's claim, whoever holds it.
    pub fn unregister(&self, session_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
            .is_some()
    }

    /// Drop the claim only if `generation` still holds it.
    pub fn release(&self, session_id: &str, generation: u64) -> bool {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.get(session_id) == Some(&generation) {
            active.remove(session_id);
            true
        } else {
            false
        }
    }

    pub fn is_registered(&self, session_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(session_id)
    }
}

/// A loop's claim on a session, released when dropped.
#[derive(Debug)]
pub struct ProcessorLease {
    registry: Arc<ProcessorRegistry>,
    session_id: String,
    generation: u64,
}

impl ProcessorLease {
    /// Claim `session_id` in `registry`, or `None` if it is taken.
    pub fn acquire(registry: &Arc<ProcessorRegistry>, session_id: &str) -> Option<Self> {
        let generation = registry.register(session_id)?;
        Some(Self {
            registry: Arc::clone(registry),
            session_id: session_id.to_string(),
            generation,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether this lease still holds the session's claim.
    pub fn is_current(&self) -> bool {
        self.registry
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&self.session_id)
            == Some(&self.generation)
    }
}

impl Drop for ProcessorLease {
    fn drop(&mut self) {
        self.registry.release(&self.session_id, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_registration_is_refused() {
        let registry = ProcessorRegistry::new();
        assert!(registry.register("s1").is_some());
        assert!(registry.register("s1").is_none());
        assert!(registry.is_registered("s1"));
        assert!(registry.unregister("s1"));
        assert!(!registry.is_registered("s1"));
        assert!(registry.register("s1").is_some());
    }

    #[test]
    fn lease_releases_on_drop() {
        let registry = Arc::new(ProcessorRegistry::new());
        let lease = ProcessorLease::acquire(&registry, "s1").unwrap();
        assert!(ProcessorLease::acquire(&registry, "s1").is_none());
        drop(lease);
        assert!(!registry.is_registered("s1"));
    }

    #[test]
    fn superseded_lease_leaves_the_new_claim_alone() {
        let registry = Arc::new(ProcessorRegistry::new());
        let old = ProcessorLease::acquire(&registry, "s1").unwrap();
        registry.unregister("s1");
        let new = ProcessorLease::acquire(&registry, "s1").unwrap();
        assert_ne!(old.generation(), new.generation());
        assert!(!old.is_current());

        drop(old);
        assert!(registry.is_registered("s1"));
        assert!(new.is_current());
        drop(new);
        assert!(!registry.is_registered("s1"));
    }
}
