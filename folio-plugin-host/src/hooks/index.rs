//! Hook entries and their event/table index

use folio_plugin_api::{handler_key, HookEvent, WILDCARD_TABLE};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Identity of one hook: (plugin, event, table-or-wildcard)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HookKey {
    pub plugin: String,
    pub event: HookEvent,
    pub table: String,
}

impl HookKey {
    pub fn new(plugin: impl Into<String>, event: HookEvent, table: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            event,
            table: table.into(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.table == WILDCARD_TABLE
    }
}

impl fmt::Display for HookKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.plugin, self.event, self.table)
    }
}

/// A registered hook. Immutable once indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookEntry {
    pub key: HookKey,
    pub priority: i32,
    /// Registration order, unique across the engine
    pub seq: u64,
    /// Key the guest resolves its handler by
    pub handler: String,
}

impl HookEntry {
    pub fn new(key: HookKey, priority: i32, seq: u64) -> Self {
        let handler = handler_key(key.event, &key.table);
        Self {
            key,
            priority,
            seq,
            handler,
        }
    }

    /// Dispatch order: priority, then exact before wildcard, then registration order
    pub fn dispatch_order(a: &HookEntry, b: &HookEntry) -> Ordering {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.key.is_wildcard().cmp(&b.key.is_wildcard()))
            .then_with(|| a.seq.cmp(&b.seq))
    }
}

fn bucket(event: HookEvent, table: &str) -> String {
    handler_key(event, table)
}

/// Entries bucketed by `event:table` and `event:*`, each bucket kept sorted
#[derive(Debug, Default)]
pub struct HookIndex {
    buckets: HashMap<String, Vec<Arc<HookEntry>>>,
}

impl HookIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry; returns `false` if the key is already indexed
    pub fn insert(&mut self, entry: HookEntry) -> bool {
        let list = self
            .buckets
            .entry(bucket(entry.key.event, &entry.key.table))
            .or_default();
        if list.iter().any(|e| e.key == entry.key) {
            return false;
        }
        let at = list
            .partition_point(|e| HookEntry::dispatch_order(e, &entry) != Ordering::Greater);
        list.insert(at, Arc::new(entry));
        true
    }

    /// Exact and wildcard entries for an event/table, merged in dispatch order
    pub fn lookup(&self, event: HookEvent, table: &str) -> Vec<Arc<HookEntry>> {
        let wildcard = self.buckets.get(&bucket(event, WILDCARD_TABLE));
        let exact = if table == WILDCARD_TABLE {
            None
        } else {
            self.buckets.get(&bucket(event, table))
        };

        let mut merged: Vec<Arc<HookEntry>> = exact
            .into_iter()
            .chain(wildcard)
            .flat_map(|list| list.iter().cloned())
            .collect();
        merged.sort_by(|a, b| HookEntry::dispatch_order(a, b));
        merged
    }

    /// Whether any entry exists for an event/table, approved or not
    pub fn contains(&self, event: HookEvent, table: &str) -> bool {
        let non_empty = |t: &str| self.buckets.get(&bucket(event, t)).is_some_and(|l| !l.is_empty());
        non_empty(table) || non_empty(WILDCARD_TABLE)
    }

    /// Strip a plugin from every bucket; returns the removed keys
    pub fn remove_plugin(&mut self, plugin: &str) -> Vec<HookKey> {
        let mut removed = Vec::new();
        self.buckets.retain(|_, list| {
            list.retain(|e| {
                if e.key.plugin == plugin {
                    removed.push(e.key.clone());
                    false
                } else {
                    true
                }
            });
            !list.is_empty()
        });
        removed
    }

    /// Every entry, sorted by key
    pub fn entries(&self) -> Vec<Arc<HookEntry>> {
        let mut all: Vec<_> = self.buckets.values().flatten().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(plugin: &str, table: &str, priority: i32, seq: u64) -> HookEntry {
        HookEntry::new(
            HookKey::new(plugin, HookEvent::BeforeCreate, table),
            priority,
            seq,
        )
    }

    fn plugins(entries: &[Arc<HookEntry>]) -> Vec<&str> {
        entries.iter().map(|e| e.key.plugin.as_str()).collect()
    }

    #[test]
    fn test_lookup_order_is_total() {
        let mut index = HookIndex::new();
        // Inserted out of order on purpose
        index.insert(entry("late", "posts", 10, 4));
        index.insert(entry("wild", "*", 10, 1));
        index.insert(entry("first", "posts", 10, 2));
        index.insert(entry("urgent", "*", 1, 3));
        index.insert(entry("low", "posts", 50, 0));

        let found = index.lookup(HookEvent::BeforeCreate, "posts");
        assert_eq!(plugins(&found), vec!["urgent", "first", "late", "wild", "low"]);
    }

    #[test]
    fn test_wildcard_matches_other_tables() {
        let mut index = HookIndex::new();
        index.insert(entry("exact", "posts", 10, 0));
        index.insert(entry("wild", "*", 10, 1));

        assert_eq!(
            plugins(&index.lookup(HookEvent::BeforeCreate, "posts")),
            vec!["exact", "wild"]
        );
        assert_eq!(
            plugins(&index.lookup(HookEvent::BeforeCreate, "users")),
            vec!["wild"]
        );
        assert!(index.lookup(HookEvent::AfterCreate, "posts").is_empty());
        assert!(index.contains(HookEvent::BeforeCreate, "users"));
        assert!(!index.contains(HookEvent::BeforeDelete, "users"));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut index = HookIndex::new();
        assert!(index.insert(entry("seo", "posts", 10, 0)));
        assert!(!index.insert(entry("seo", "posts", 20, 1)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove_plugin() {
        let mut index = HookIndex::new();
        index.insert(entry("seo", "posts", 10, 0));
        index.insert(entry("seo", "*", 10, 1));
        index.insert(entry("audit", "posts", 10, 2));

        let removed = index.remove_plugin("seo");
        assert_eq!(removed.len(), 2);
        assert_eq!(
            plugins(&index.lookup(HookEvent::BeforeCreate, "posts")),
            vec!["audit"]
        );
        assert_eq!(index.len(), 1);
    }
}
