use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    open: BTreeMap<u64, String>,
    leaked: Vec<String>,
}

/// Registry of statement-cache owners that are open against one store.
///
/// Owners register when they first compile a statement and unregister on
/// `close`. An owner that is dropped while still registered is recorded as
/// leaked; tests call [`LeakAuditor::assert_all_closed`] at the end to turn
/// that into a failure.
#[derive(Debug, Clone, Default)]
pub struct LeakAuditor {
    registry: Arc<Mutex<Registry>>,
}

impl LeakAuditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, owner: &str) -> u64 {
        let mut registry = self.registry.lock().expect("leak auditor mutex poisoned");
        registry.next_id += 1;
        let id = registry.next_id;
        registry.open.insert(id, owner.to_string());
        id
    }

    pub(crate) fn unregister(&self, id: u64) {
        let mut registry = self.registry.lock().expect("leak auditor mutex poisoned");
        registry.open.remove(&id);
    }

    pub(crate) fn record_leak(&self, id: u64) {
        let mut registry = self.registry.lock().expect("leak auditor mutex poisoned");
        if let Some(owner) = registry.open.remove(&id) {
            registry.leaked.push(owner);
        }
    }

    /// Names of owners that are currently open, in registration order.
    pub fn open_owners(&self) -> Vec<String> {
        let registry = self.registry.lock().expect("leak auditor mutex poisoned");
        registry.open.values().cloned().collect()
    }

    /// Names of owners that were dropped without being closed.
    pub fn leaked(&self) -> Vec<String> {
        let registry = self.registry.lock().expect("leak auditor mutex poisoned");
        registry.leaked.clone()
    }

    /// Panics if any owner is still open or was ever dropped unclosed.
    pub fn assert_all_closed(&self) {
        let registry = self.registry.lock().expect("leak auditor mutex poisoned");
        assert!(
            registry.open.is_empty() && registry.leaked.is_empty(),
            "statement owners not closed: open={:?} leaked={:?}",
            registry.open.values().collect::<Vec<_>>(),
            registry.leaked
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leak_moves_owner_out_of_open_set() {
        let auditor = LeakAuditor::new();
        let a = auditor.register("covers");
        let b = auditor.register("thumbnails");
        auditor.unregister(a);
        auditor.record_leak(b);

        assert!(auditor.open_owners().is_empty());
        assert_eq!(auditor.leaked(), vec!["thumbnails".to_string()]);
    }

    #[test]
    #[should_panic(expected = "statement owners not closed")]
    fn open_owner_fails_the_audit() {
        let auditor = LeakAuditor::new();
        let _id = auditor.register("catalog");
        auditor.assert_all_closed();
    }
}
