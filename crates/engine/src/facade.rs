//! Query Facade: read surface for the console.
//!
//! Serves the current session snapshot and cached pages of the events
//! browser. Fetches go through [`EventsApi`]; the cache lock is never held
//! across a fetch.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use enrollsync_channel::{DegradedFlag, EventsApi};
use enrollsync_core::{EventPage, EventQuery, SessionSnapshot};

use crate::cache::EventCache;
use crate::error::EngineError;

pub struct QueryFacade {
    api: Arc<dyn EventsApi>,
    cache: Mutex<EventCache>,
    snapshot: watch::Receiver<SessionSnapshot>,
    degraded: DegradedFlag,
}

impl QueryFacade {
    pub fn new(
        api: Arc<dyn EventsApi>,
        cache_capacity: usize,
        snapshot: watch::Receiver<SessionSnapshot>,
        degraded: DegradedFlag,
    ) -> Self {
        Self {
            api,
            cache: Mutex::new(EventCache::new(cache_capacity)),
            snapshot,
            degraded,
        }
    }

    /// One page of the events browser, from cache when present.
    ///
    /// A fetch error is returned as-is and nothing is cached.
    pub async fn list_events(
        &self,
        page: u32,
        page_size: u32,
        search: Option<&str>,
    ) -> Result<EventPage, EngineError> {
        let key = EventQuery::new(page, page_size, search);

        if let Some(entry) = self.cache.lock().await.get(&key) {
            debug!(page, page_size, search = ?key.search, "events page served from cache");
            return Ok(entry.page());
        }

        let fetched = self.api.list_events(&key).await?;
        debug!(
            page,
            page_size,
            rows = fetched.rows.len(),
            total = fetched.pagination.total,
            "events page fetched"
        );

        self.cache.lock().await.put(key, fetched.clone());
        Ok(fetched)
    }

    pub fn session_snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Drop every cached page; the next query goes to the API.
    pub async fn refresh(&self) {
        let mut cache = self.cache.lock().await;
        let dropped = cache.len();
        cache.clear();
        info!(dropped, "events cache cleared");
    }

    /// True while the push connection is down and only polling reports progress.
    pub fn channel_degraded(&self) -> bool {
        self.degraded.is_degraded()
    }

    pub async fn cached_pages(&self) -> usize {
        self.cache.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use enrollsync_channel::ChannelError;
    use enrollsync_core::{Pagination, SessionStatus};

    #[derive(Default)]
    struct CountingApi {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl EventsApi for CountingApi {
        async fn list_events(&self, query: &EventQuery) -> Result<EventPage, ChannelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ChannelError::Status {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            Ok(EventPage {
                rows: Vec::new(),
                pagination: Pagination {
                    total: 0,
                    page: query.page,
                    limit: query.page_size,
                    total_pages: 0,
                },
            })
        }
    }

    fn facade(api: Arc<CountingApi>, capacity: usize) -> (QueryFacade, watch::Sender<SessionSnapshot>) {
        let (tx, rx) = watch::channel(SessionSnapshot::idle());
        (QueryFacade::new(api, capacity, rx, DegradedFlag::default()), tx)
    }

    #[tokio::test]
    async fn repeated_query_hits_cache() {
        let api = Arc::new(CountingApi::default());
        let (facade, _tx) = facade(api.clone(), 10);

        let first = facade.list_events(1, 20, Some("jane")).await.unwrap();
        let second = facade.list_events(1, 20, Some(" jane ")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);

        facade.list_events(2, 20, Some("jane")).await.unwrap();
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refresh_forces_refetch() {
        let api = Arc::new(CountingApi::default());
        let (facade, _tx) = facade(api.clone(), 10);

        facade.list_events(1, 20, None).await.unwrap();
        facade.refresh().await;
        assert_eq!(facade.cached_pages().await, 0);
        facade.list_events(1, 20, None).await.unwrap();
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn eviction_refetches_oldest_page() {
        let api = Arc::new(CountingApi::default());
        let (facade, _tx) = facade(api.clone(), 2);

        for page in 1..=3 {
            facade.list_events(page, 20, None).await.unwrap();
        }
        assert_eq!(facade.cached_pages().await, 2);
        facade.list_events(1, 20, None).await.unwrap();
        assert_eq!(api.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn fetch_errors_are_not_cached() {
        let api = Arc::new(CountingApi {
            fail: true,
            ..Default::default()
        });
        let (facade, _tx) = facade(api.clone(), 10);

        let err = facade.list_events(1, 20, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Channel(ChannelError::Status { status: 503, .. })));
        assert_eq!(facade.cached_pages().await, 0);
    }

    #[tokio::test]
    async fn snapshot_follows_watch() {
        let api = Arc::new(CountingApi::default());
        let (facade, tx) = facade(api, 10);
        assert_eq!(facade.session_snapshot().status, SessionStatus::Idle);

        let session = enrollsync_core::EnrollmentSession::start("42", "Jane", chrono::Utc::now());
        tx.send_replace(SessionSnapshot::of(Some(&session)));
        assert_eq!(facade.session_snapshot().status, SessionStatus::Started);
        assert!(!facade.channel_degraded());
    }
}
