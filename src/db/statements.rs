//! Bounded LRU cache of rendered SQL.
//!
//! Statements whose text depends on an argument count (`IN ($1, ..., $n)`) are
//! rendered once per (operation, arity) and reused, so every connection's
//! prepared-statement cache sees byte-identical SQL for the same shape.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

/// Share of the capacity dropped when the cache is full.
const EVICT_FRACTION: f64 = 0.2;

pub struct StatementCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    clock: u64,
}

struct Entry {
    sql: Arc<str>,
    last_used: u64,
}

impl StatementCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Returns the SQL cached under `key`, rendering and inserting it first if
    /// it is missing.
    pub fn get_or_render(&self, key: &str, render: impl FnOnce() -> String) -> Arc<str> {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let now = inner.clock;

        if let Some(entry) = inner.entries.get_mut(key) {
            entry.last_used = now;
            return entry.sql.clone();
        }

        if inner.entries.len() >= self.capacity {
            self.evict_oldest(&mut inner);
        }

        let sql: Arc<str> = render().into();
        inner.entries.insert(
            key.to_owned(),
            Entry {
                sql: sql.clone(),
                last_used: now,
            },
        );
        sql
    }

    fn evict_oldest(&self, inner: &mut Inner) {
        let count = ((self.capacity as f64 * EVICT_FRACTION).ceil() as usize).max(1);

        let mut by_age: Vec<(u64, String)> = inner
            .entries
            .iter()
            .map(|(key, entry)| (entry.last_used, key.clone()))
            .collect();
        by_age.sort_unstable();

        for (_, key) in by_age.into_iter().take(count) {
            inner.entries.remove(&key);
        }

        tracing::debug!(evicted = count, "statement cache full");
    }

    pub fn remove(&self, key: &str) {
        self.inner.lock().entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_once() {
        let cache = StatementCache::new(4);
        let mut renders = 0;

        for _ in 0..3 {
            let sql = cache.get_or_render("op:1", || {
                renders += 1;
                "SELECT 1".to_owned()
            });
            assert_eq!(&*sql, "SELECT 1");
        }

        assert_eq!(renders, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evicts_least_recently_used_fifth() {
        let cache = StatementCache::new(10);
        for i in 0..10 {
            cache.get_or_render(&format!("op:{i}"), || format!("SELECT {i}"));
        }
        // Touch the two oldest so they survive.
        cache.get_or_render("op:0", || unreachable!());
        cache.get_or_render("op:1", || unreachable!());

        cache.get_or_render("op:10", || "SELECT 10".to_owned());

        assert_eq!(cache.len(), 9);
        assert!(cache.contains("op:0"));
        assert!(cache.contains("op:1"));
        assert!(!cache.contains("op:2"));
        assert!(!cache.contains("op:3"));
        assert!(cache.contains("op:4"));
        assert!(cache.contains("op:10"));
    }

    #[test]
    fn remove_leaves_other_entries() {
        let cache = StatementCache::new(2);
        cache.get_or_render("a", || "A".to_owned());
        cache.get_or_render("b", || "B".to_owned());

        cache.remove("a");
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));

        cache.remove("b");
        assert!(cache.is_empty());
    }
}
