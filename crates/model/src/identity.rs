use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// Thread-safe `(entity, old id) -> new id` mapping built during the tier
/// pass and consumed read-only by the deferred and relationship passes.
///
/// Insert-only per key: the first mapping for a record wins. In
/// deterministic-id mode every successful import records `old -> old`, so
/// the map mostly acts as a filter for records that never landed.
#[derive(Debug, Default)]
pub struct IdMap {
    inner: RwLock<HashMap<String, HashMap<Uuid, Uuid>>>,
}

impl IdMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entity: &str, old_id: Uuid, new_id: Uuid) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner
            .entry(entity.to_string())
            .or_default()
            .entry(old_id)
            .or_insert(new_id);
    }

    pub fn get(&self, entity: &str, old_id: Uuid) -> Option<Uuid> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(entity).and_then(|m| m.get(&old_id)).copied()
    }

    pub fn contains(&self, entity: &str, old_id: Uuid) -> bool {
        self.get(entity, old_id).is_some()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_insert_wins() {
        let map = IdMap::new();
        let old = Uuid::new_v4();
        let first = Uuid::new_v4();

        map.insert("account", old, first);
        map.insert("account", old, Uuid::new_v4());

        assert_eq!(map.get("account", old), Some(first));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn entities_are_namespaced() {
        let map = IdMap::new();
        let id = Uuid::new_v4();
        map.insert("account", id, id);

        assert!(map.contains("account", id));
        assert!(!map.contains("contact", id));
    }
}
