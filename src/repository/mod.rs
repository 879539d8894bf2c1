//! Timeline repository: one feed of one account, backed by the cache store
//! and a remote fetcher. It owns the IO around the pure merge engine.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::merge::{self, FetchedPage, Merged, Window};
use crate::models::*;
use crate::ordered_id::OrderedId;
use crate::remote::{FetchResult, PageRequest, RemoteFetcher};
use crate::store::{CacheStore, StoreResult};

pub struct TimelineRepository<T: TimelineItem> {
    store: Arc<CacheStore>,
    fetcher: Arc<dyn RemoteFetcher<T>>,
    account: AccountKey,
    kind: FeedKind,
    limit: usize,
}

impl<T: TimelineItem> TimelineRepository<T> {
    pub fn new(
        store: Arc<CacheStore>,
        fetcher: Arc<dyn RemoteFetcher<T>>,
        account: AccountKey,
        kind: FeedKind,
        limit: usize,
    ) -> Self {
        Self {
            store,
            fetcher,
            account,
            kind,
            limit,
        }
    }

    pub fn account(&self) -> &AccountKey {
        &self.account
    }

    pub fn kind(&self) -> &FeedKind {
        &self.kind
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Newest cached page, for painting before the network answers.
    pub fn load_cached(&self) -> StoreResult<Vec<FeedEntry<T>>> {
        let entries = self
            .store
            .get_range(&self.account, &self.kind, None, None, self.limit)?;
        Ok(merge::normalize(entries))
    }

    pub async fn fetch(&self, window: &Window) -> FetchResult<FetchedPage<T>> {
        let request = PageRequest::for_window(window, self.limit);
        log::debug!("Fetching {} for {} with {:?}", self.kind, self.account, request);

        let page = self.fetcher.fetch_page(&request).await?;
        Ok(FetchedPage {
            items: page.items,
            limit: self.limit,
            has_more: page.has_more,
        })
    }

    /// Merge `page` into `existing` and write the result through to the cache.
    /// Cache write failures are logged; the next merge over the same window
    /// rewrites the rows.
    pub fn reconcile(
        &self,
        existing: &[FeedEntry<T>],
        page: FetchedPage<T>,
        window: &Window,
    ) -> Merged<T> {
        let merged = merge::merge(existing, page, window);
        if let Err(e) = self.store.commit(&self.account, &self.kind, &merged.plan) {
            log::error!("Failed to persist {} page for {}: {}", self.kind, self.account, e);
        }
        merged
    }

    /// Extend `sequence` with cached entries older than its oldest item.
    ///
    /// Used after a bottom fetch that brought back almost nothing: the cache
    /// may still hold older history. A short run of nothing but gaps means
    /// both the cache and the server are exhausted there, so it is ignored.
    pub fn top_up_from_cache(&self, sequence: &mut Vec<FeedEntry<T>>, window: &Window) {
        let max_id = oldest_item_id(sequence).or(window.max_id.as_ref()).cloned();
        let cached: Vec<FeedEntry<T>> = match self.store.get_range(
            &self.account,
            &self.kind,
            max_id.as_ref(),
            window.since_id.as_ref(),
            self.limit,
        ) {
            Ok(cached) => cached,
            Err(e) => {
                log::warn!("Cache top-up for {} failed: {}", self.kind, e);
                return;
            }
        };

        if cached.len() < self.limit && cached.iter().all(FeedEntry::is_gap) {
            return;
        }

        // Trailing gaps below the oldest item are superseded by the cached run.
        while sequence.last().map_or(false, FeedEntry::is_gap) {
            sequence.pop();
        }
        log::debug!("Topped up {} with {} cached entries", self.kind, cached.len());
        sequence.extend(cached);
        let normalized = merge::normalize(std::mem::take(sequence));
        *sequence = normalized;
    }

    /// Fire-and-forget read marker; failures are only logged.
    pub fn spawn_mark_read(&self, last_read_id: OrderedId) {
        let fetcher = Arc::clone(&self.fetcher);
        let kind = self.kind.clone();
        tokio::spawn(async move {
            if let Err(e) = fetcher.mark_read(&last_read_id).await {
                log::warn!("Failed to mark {} read up to {}: {}", kind, last_read_id, e);
            }
        });
    }

    pub fn cleanup(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        self.store.cleanup(&self.account, cutoff)
    }
}
