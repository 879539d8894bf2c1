//! Reconciles a freshly fetched page with the sequence a session already
//! holds. Everything here is pure: the caller gets back the new sequence and a
//! [`PersistPlan`] describing the cache writes that make the store agree.

use std::collections::HashSet;

use crate::models::*;
use crate::ordered_id::OrderedId;

/// The `(max_id, since_id)` slice of id space a fetch asks for. Both bounds
/// are exclusive; `None` is unbounded on that side.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Window {
    pub max_id: Option<OrderedId>,
    pub since_id: Option<OrderedId>,
}

impl Window {
    pub fn new(max_id: Option<OrderedId>, since_id: Option<OrderedId>) -> Self {
        Self { max_id, since_id }
    }

    /// Everything newer than `since_id`.
    pub fn top(since_id: Option<OrderedId>) -> Self {
        Self::new(None, since_id)
    }

    /// Everything older than `max_id`.
    pub fn bottom(max_id: Option<OrderedId>) -> Self {
        Self::new(max_id, None)
    }

    pub fn between(max_id: impl Into<OrderedId>, since_id: impl Into<OrderedId>) -> Self {
        Self::new(Some(max_id.into()), Some(since_id.into()))
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    /// The `since_id` sent to the server: one below the real bound so the
    /// boundary item itself comes back and proves the page overlaps.
    pub fn fetch_since(&self) -> Option<OrderedId> {
        self.since_id.as_ref().map(OrderedId::decrement)
    }

    /// Whether `id` lies strictly inside the window.
    pub fn contains(&self, id: &OrderedId) -> bool {
        self.max_id.as_ref().map_or(true, |max| id < max)
            && self.since_id.as_ref().map_or(true, |since| id > since)
    }

    pub fn is_bounded(&self) -> bool {
        self.max_id.is_some() || self.since_id.is_some()
    }
}

/// One page as the remote returned it, newest first.
#[derive(Debug, Clone)]
pub struct FetchedPage<T> {
    pub items: Vec<T>,
    /// Page size the engine asked for, not counting the overlap slot.
    pub limit: usize,
    /// Whether the server offers a next page, when it says so.
    pub has_more: Option<bool>,
}

impl<T> FetchedPage<T> {
    pub fn new(items: Vec<T>, limit: usize) -> Self {
        Self { items, limit, has_more: None }
    }

    pub fn empty(limit: usize) -> Self {
        Self::new(Vec::new(), limit)
    }

    /// A page of at least `limit` items suggests there is more beyond it. The
    /// server's signal can only veto that: servers advertise a next page on
    /// every non-empty answer, so `Some(true)` never turns a short page full.
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.limit && self.has_more != Some(false)
    }
}

/// Cache writes for one merge, applied in field order inside one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistPlan<T> {
    /// Rows strictly between `(min, max)` are stale and deleted.
    pub delete_range: Option<(OrderedId, OrderedId)>,
    /// Gap rows strictly inside this window are cleared.
    pub clear_gaps: Option<Window>,
    pub upserts: Vec<T>,
    /// Inserted only where no row exists yet.
    pub gaps: Vec<OrderedId>,
}

impl<T> PersistPlan<T> {
    pub fn is_empty(&self) -> bool {
        self.delete_range.is_none()
            && self.clear_gaps.is_none()
            && self.upserts.is_empty()
            && self.gaps.is_empty()
    }
}

impl<T> Default for PersistPlan<T> {
    fn default() -> Self {
        Self {
            delete_range: None,
            clear_gaps: None,
            upserts: Vec::new(),
            gaps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Merged<T> {
    pub sequence: Vec<FeedEntry<T>>,
    pub plan: PersistPlan<T>,
    /// Gap recorded because the page did not reach back to `since_id`.
    pub overlap_gap: Option<OrderedId>,
    /// Gap appended below a full page fetched without a lower bound.
    pub trailing_gap: Option<OrderedId>,
    /// Items that survived sanitising, the overlap item included.
    pub fetched: usize,
    pub full: bool,
}

/// Merge `page`, fetched for `window`, into `existing`.
///
/// Entries of `existing` strictly inside the window are replaced by what the
/// page says lives there; entries at or beyond the bounds are kept.
pub fn merge<T: TimelineItem>(
    existing: &[FeedEntry<T>],
    page: FetchedPage<T>,
    window: &Window,
) -> Merged<T> {
    let full = page.is_full();
    let items = sanitize(page.items, window);

    // Overlap detection: the boundary item coming back means nothing is
    // missing between the page and what we already had.
    let mut overlap_gap = None;
    let mut fresh_len = items.len();
    if let (Some(since), false) = (&window.since_id, items.is_empty()) {
        match items.iter().rposition(|item| item.page_id() == since) {
            Some(k) => fresh_len = k,
            None => overlap_gap = Some(since.increment()),
        }
    }

    let trailing_gap = match (&window.since_id, items.last()) {
        (None, Some(oldest)) if full => Some(oldest.page_id().decrement()),
        _ => None,
    };

    let mut incoming: Vec<FeedEntry<T>> = items[..fresh_len]
        .iter()
        .cloned()
        .map(FeedEntry::Item)
        .collect();
    incoming.extend(overlap_gap.clone().map(FeedEntry::Gap));
    incoming.extend(trailing_gap.clone().map(FeedEntry::Gap));

    let sequence = normalize(splice(existing, incoming, window));
    let plan = persist_plan(items, window, overlap_gap.iter().chain(&trailing_gap));

    Merged {
        fetched: plan.upserts.len(),
        sequence,
        plan,
        overlap_gap,
        trailing_gap,
        full,
    }
}

/// Cut the page at the first item that breaks the window or the descending
/// `page_id` order. Servers are not trusted to honour paging parameters.
pub fn sanitize<T: TimelineItem>(mut items: Vec<T>, window: &Window) -> Vec<T> {
    let cut = items.iter().enumerate().position(|(i, item)| {
        let id = item.page_id();
        window.max_id.as_ref().map_or(false, |max| id >= max)
            || window.since_id.as_ref().map_or(false, |since| id < since)
            || (i > 0 && id >= items[i - 1].page_id())
    });

    if let Some(cut) = cut {
        log::warn!(
            "Truncating fetched page at {} of {} items: {} is outside {:?} or out of order",
            cut,
            items.len(),
            items[cut].page_id(),
            window
        );
        items.truncate(cut);
    }
    items
}

/// Entries of `existing` at or above `max_id`, then `incoming`, then entries at
/// or below `since_id`.
fn splice<T: TimelineItem>(
    existing: &[FeedEntry<T>],
    incoming: Vec<FeedEntry<T>>,
    window: &Window,
) -> Vec<FeedEntry<T>> {
    let above = |e: &FeedEntry<T>| window.max_id.as_ref().map_or(false, |max| e.id() >= max);
    let below = |e: &FeedEntry<T>| window.since_id.as_ref().map_or(false, |since| e.id() <= since);

    let mut out = Vec::with_capacity(existing.len() + incoming.len());
    out.extend(existing.iter().filter(|&e| above(e)).cloned());
    out.extend(incoming);
    out.extend(existing.iter().filter(|&e| below(e)).cloned());
    out
}

/// Restore the sequence invariants: one entry per item, no gap sharing a
/// position with an item, no two gaps next to each other.
///
/// An item that moved up (a chat with a new message) is kept at its newest
/// position, which is the first one seen.
pub fn normalize<T: TimelineItem>(entries: Vec<FeedEntry<T>>) -> Vec<FeedEntry<T>> {
    let item_ids: HashSet<OrderedId> = entries
        .iter()
        .filter_map(|e| e.as_item().map(|item| item.page_id().clone()))
        .collect();

    let mut seen = HashSet::new();
    let mut out: Vec<FeedEntry<T>> = entries
        .into_iter()
        .filter(|e| match e {
            FeedEntry::Item(item) => seen.insert(item.id().clone()),
            FeedEntry::Gap(id) => !item_ids.contains(id),
        })
        .collect();

    out.dedup_by(|later, earlier| later.is_gap() && earlier.is_gap());
    out
}

fn persist_plan<'a, T: TimelineItem>(
    items: Vec<T>,
    window: &Window,
    gaps: impl Iterator<Item = &'a OrderedId>,
) -> PersistPlan<T> {
    let (delete_range, clear_gaps) = match (items.first(), items.last()) {
        (Some(newest), Some(oldest)) => (
            Some((oldest.page_id().clone(), newest.page_id().clone())),
            Some(Window::new(
                window.max_id.clone(),
                window.since_id.clone().or_else(|| Some(oldest.page_id().clone())),
            )),
        ),
        _ => (
            match (&window.since_id, &window.max_id) {
                (Some(since), Some(max)) => Some((since.clone(), max.clone())),
                _ => None,
            },
            window.is_bounded().then(|| window.clone()),
        ),
    };

    PersistPlan {
        delete_range,
        clear_gaps,
        upserts: items,
        gaps: gaps.cloned().collect(),
    }
}
