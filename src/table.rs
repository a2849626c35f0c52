//! Dependency table: the live mapping from declared slots to proxies.
//!
//! Keys are `(consumer id, slot index)`, so the same capability declared by
//! two tools with different tags or kwargs occupies two distinct entries.
//! Only the event-dispatch task writes; tool handlers read concurrently.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::proxy::MeshProxy;
use crate::spec::DependencySpec;

/// Composite key: consumer (tool or route) identifier plus slot index.
pub type DependencyKey = (String, usize);

/// Thread-safe table of resolved dependency proxies.
///
/// All operations are synchronous and non-blocking; an absent key means the
/// slot is unresolved.
#[derive(Debug, Default)]
pub struct DependencyTable {
    entries: RwLock<HashMap<DependencyKey, Arc<MeshProxy>>>,
}

impl DependencyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the proxy for a slot.
    pub fn set(&self, consumer: &str, slot: usize, proxy: Arc<MeshProxy>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert((consumer.to_string(), slot), proxy);
    }

    /// Remove the proxy for a slot, if any.
    pub fn remove(&self, consumer: &str, slot: usize) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(&(consumer.to_string(), slot));
    }

    /// Current proxy for a slot.
    pub fn get(&self, consumer: &str, slot: usize) -> Option<Arc<MeshProxy>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(&(consumer.to_string(), slot)).cloned()
    }

    /// Drop every entry. Invoked on registry disconnect: resolved
    /// dependencies do not outlive the registry session.
    pub fn clear_all(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }

    /// Positional view of a consumer's slots, `None` for unresolved ones.
    pub fn resolve_slots(&self, consumer: &str, slot_count: usize) -> Vec<Option<Arc<MeshProxy>>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        (0..slot_count)
            .map(|slot| entries.get(&(consumer.to_string(), slot)).cloned())
            .collect()
    }

    /// Capability-keyed snapshot of a consumer's slots, in declaration order.
    pub fn snapshot(
        &self,
        consumer: &str,
        specs: &[DependencySpec],
    ) -> Vec<(String, Option<Arc<MeshProxy>>)> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        specs
            .iter()
            .enumerate()
            .map(|(slot, spec)| {
                (
                    spec.capability.clone(),
                    entries.get(&(consumer.to_string(), slot)).cloned(),
                )
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ProxyKwargs;

    fn proxy(endpoint: &str) -> Arc<MeshProxy> {
        Arc::new(MeshProxy::new(
            endpoint,
            "cache",
            "get",
            &ProxyKwargs::default(),
        ))
    }

    #[test]
    fn test_set_get_remove() {
        let table = DependencyTable::new();
        assert!(table.get("t1", 0).is_none());

        table.set("t1", 0, proxy("http://e1"));
        assert_eq!(table.get("t1", 0).unwrap().endpoint, "http://e1");

        table.remove("t1", 0);
        assert!(table.get("t1", 0).is_none());
    }

    #[test]
    fn test_composite_key_isolation() {
        let table = DependencyTable::new();
        table.set("t1", 0, proxy("http://e1"));
        table.set("t2", 0, proxy("http://e2"));

        // Same capability, different consumers: distinct entries
        assert_eq!(table.get("t1", 0).unwrap().endpoint, "http://e1");
        assert_eq!(table.get("t2", 0).unwrap().endpoint, "http://e2");

        table.remove("t1", 0);
        assert!(table.get("t1", 0).is_none());
        assert_eq!(table.get("t2", 0).unwrap().endpoint, "http://e2");
    }

    #[test]
    fn test_replacement_is_whole_proxy() {
        let table = DependencyTable::new();
        table.set("t1", 0, proxy("http://old"));
        table.set("t1", 0, proxy("http://new"));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("t1", 0).unwrap().endpoint, "http://new");
    }

    #[test]
    fn test_clear_all() {
        let table = DependencyTable::new();
        table.set("t1", 0, proxy("http://e1"));
        table.set("t1", 1, proxy("http://e2"));
        table.set("t2", 0, proxy("http://e3"));

        table.clear_all();
        assert!(table.is_empty());
        assert!(table.get("t1", 0).is_none());
    }

    #[test]
    fn test_resolve_slots_keeps_declaration_order() {
        let table = DependencyTable::new();
        table.set("t1", 1, proxy("http://e2"));

        let slots = table.resolve_slots("t1", 3);
        assert_eq!(slots.len(), 3);
        assert!(slots[0].is_none());
        assert_eq!(slots[1].as_ref().unwrap().endpoint, "http://e2");
        assert!(slots[2].is_none());
    }

    #[test]
    fn test_snapshot_maps_capabilities_in_order() {
        let table = DependencyTable::new();
        table.set("r1", 0, proxy("http://e1"));

        let specs = vec![
            DependencySpec::from("cache"),
            DependencySpec::from("date-service"),
        ];
        let snapshot = table.snapshot("r1", &specs);

        assert_eq!(snapshot[0].0, "cache");
        assert!(snapshot[0].1.is_some());
        assert_eq!(snapshot[1].0, "date-service");
        assert!(snapshot[1].1.is_none());
    }
}
