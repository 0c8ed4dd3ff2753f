//! Bounded cache of events-browser pages.
//!
//! Keyed by (page, page size, search term). Eviction follows insertion order:
//! reads use [`LruCache::peek`], which never promotes, so only `put` moves an
//! entry to the "newest" end. The cache never fetches anything itself.

use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use lru::LruCache;
use tracing::debug;

use enrollsync_core::{EventPage, EventQuery, EventRecord, Pagination};

pub const DEFAULT_CAPACITY: usize = 10;

/// One cached page.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: EventQuery,
    pub rows: Vec<EventRecord>,
    pub pagination: Pagination,
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn page(&self) -> EventPage {
        EventPage {
            rows: self.rows.clone(),
            pagination: self.pagination,
        }
    }
}

pub struct EventCache {
    entries: LruCache<EventQuery, CacheEntry>,
}

impl EventCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Cached page for `key`. Does not affect eviction order.
    pub fn get(&self, key: &EventQuery) -> Option<&CacheEntry> {
        self.entries.peek(key)
    }

    /// Insert (or refresh) a page, returning the key evicted to make room.
    ///
    /// Re-putting an existing key refreshes `fetched_at` and makes it the
    /// newest insertion.
    pub fn put(&mut self, key: EventQuery, page: EventPage) -> Option<EventQuery> {
        let entry = CacheEntry {
            key: key.clone(),
            rows: page.rows,
            pagination: page.pagination,
            fetched_at: Utc::now(),
        };

        if self.entries.contains(&key) {
            self.entries.put(key, entry);
            return None;
        }

        let evicted = self.entries.push(key, entry).map(|(k, _)| k);
        if let Some(ref k) = evicted {
            debug!(page = k.page, page_size = k.page_size, search = ?k.search, "evicted cached page");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// Drop every entry (explicit refresh).
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for EventCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_of(n: u64) -> EventPage {
        EventPage {
            rows: Vec::new(),
            pagination: Pagination {
                total: n,
                page: 1,
                limit: 20,
                total_pages: 1,
            },
        }
    }

    fn key(page: u32) -> EventQuery {
        EventQuery::new(page, 20, None)
    }

    #[test]
    fn eleventh_insert_evicts_the_first() {
        let mut cache = EventCache::default();
        for p in 1..=10 {
            assert!(cache.put(key(p), page_of(p as u64)).is_none());
        }
        assert_eq!(cache.put(key(11), page_of(11)), Some(key(1)));

        assert_eq!(cache.len(), 10);
        assert!(cache.get(&key(1)).is_none());
        for p in 2..=11 {
            assert!(cache.get(&key(p)).is_some(), "page {p} should be retained");
        }
    }

    #[test]
    fn reads_do_not_protect_from_eviction() {
        let mut cache = EventCache::new(2);
        cache.put(key(1), page_of(1));
        cache.put(key(2), page_of(2));
        assert!(cache.get(&key(1)).is_some());
        assert_eq!(cache.put(key(3), page_of(3)), Some(key(1)));
    }

    #[test]
    fn reput_refreshes_and_becomes_newest() {
        let mut cache = EventCache::new(2);
        cache.put(key(1), page_of(1));
        let first_fetch = cache.get(&key(1)).unwrap().fetched_at;
        cache.put(key(2), page_of(2));
        assert!(cache.put(key(1), page_of(100)).is_none());

        let entry = cache.get(&key(1)).unwrap();
        assert_eq!(entry.pagination.total, 100);
        assert!(entry.fetched_at >= first_fetch);

        // key 2 is now the oldest insertion.
        assert_eq!(cache.put(key(3), page_of(3)), Some(key(2)));
    }

    #[test]
    fn search_term_is_part_of_the_key() {
        let mut cache = EventCache::default();
        cache.put(EventQuery::new(1, 20, Some("jane")), page_of(1));
        assert!(cache.get(&EventQuery::new(1, 20, None)).is_none());
        assert!(cache.get(&EventQuery::new(1, 20, Some(" jane "))).is_some());
        assert!(cache.get(&EventQuery::new(1, 50, Some("jane"))).is_none());
    }

    #[test]
    fn zero_capacity_falls_back_to_one() {
        let mut cache = EventCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.put(key(1), page_of(1));
        cache.clear();
        assert!(cache.is_empty());
    }
}
