//! Feed sessions
//!
//! A `FeedSession` is the pagination controller for one open feed: it owns the
//! in-memory sequence, runs at most one fetch at a time (top refresh, bottom
//! scroll, or filling a tapped gap), and reports changes to subscribers over
//! plain channels.
//!
//! Sessions are cheap to share behind an `Arc`; every trigger is an `async fn`
//! taking `&self`, and a trigger that arrives while a fetch is in flight
//! returns [`FetchOutcome::Skipped`] instead of queueing.

use chrono::{Duration, Utc};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::watch;

use crate::merge::Window;
use crate::models::*;
use crate::ordered_id::OrderedId;
use crate::remote::{FetchError, RemoteFetcher};
use crate::repository::TimelineRepository;
use crate::store::{CacheStore, StoreError, DEFAULT_RETENTION_DAYS};

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Cache error: {0}")]
    Cache(#[from] StoreError),
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),
    #[error("Session is closed")]
    Closed,
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Hands out session-local ids: -1, -2, -3, ... Negative so they can never
/// collide with anything the server assigns.
#[derive(Debug)]
pub struct LocalIdGenerator {
    next: i64,
}

impl LocalIdGenerator {
    pub fn new() -> Self {
        Self { next: -1 }
    }

    pub fn next_id(&mut self) -> i64 {
        let id = self.next;
        self.next -= 1;
        id
    }
}

impl Default for LocalIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a session needs to know about who it runs for.
#[derive(Debug)]
pub struct SessionContext {
    pub account: AccountKey,
    pub local_ids: LocalIdGenerator,
}

impl SessionContext {
    pub fn new(account: AccountKey) -> Self {
        Self {
            account,
            local_ids: LocalIdGenerator::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationState {
    Idle,
    FetchingTop,
    FetchingBottom,
    FetchingMiddle(usize),
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureNotice {
    Offline,
    Generic,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent<T> {
    SequenceChanged(Vec<FeedEntry<T>>),
    GapLoading(OrderedId),
    GapFetchFailed { position: usize, gap: OrderedId },
    /// The feed is empty and the last fetch failed.
    FeedUnavailable(FailureNotice),
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Applied {
        fetched: usize,
        gap: Option<OrderedId>,
    },
    /// Another fetch was in flight, the feed is exhausted, or the position
    /// did not hold a gap.
    Skipped,
    /// The session closed or moved on before the response arrived.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    FetchingTop,
    FetchingBottom,
    FetchingMiddle(usize),
}

struct SessionState<T> {
    context: SessionContext,
    sequence: Vec<FeedEntry<T>>,
    phase: Phase,
    exhausted: bool,
    in_flight: Option<i64>,
    closed: bool,
    cleaned_up: bool,
}

pub struct FeedSession<T: TimelineItem> {
    repository: TimelineRepository<T>,
    state: Mutex<SessionState<T>>,
    subscribers: Mutex<Vec<mpsc::Sender<SessionEvent<T>>>>,
    shutdown: watch::Sender<bool>,
    retention: Duration,
}

impl<T: TimelineItem> FeedSession<T> {
    pub fn new(
        context: SessionContext,
        kind: FeedKind,
        store: Arc<CacheStore>,
        fetcher: Arc<dyn RemoteFetcher<T>>,
        limit: usize,
    ) -> Self {
        let repository =
            TimelineRepository::new(store, fetcher, context.account.clone(), kind, limit);
        let (shutdown, _) = watch::channel(false);

        Self {
            repository,
            state: Mutex::new(SessionState {
                context,
                sequence: Vec::new(),
                phase: Phase::Idle,
                exhausted: false,
                in_flight: None,
                closed: false,
                cleaned_up: false,
            }),
            subscribers: Mutex::new(Vec::new()),
            shutdown,
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
        }
    }

    /// How old cached rows may get before the post-refresh cleanup drops them.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    fn lock(&self) -> SessionResult<MutexGuard<'_, SessionState<T>>> {
        self.state
            .lock()
            .map_err(|e| SessionError::LockPoisoned(e.to_string()))
    }

    pub fn subscribe(&self) -> mpsc::Receiver<SessionEvent<T>> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    fn emit(&self, event: SessionEvent<T>) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    pub fn snapshot(&self) -> SessionResult<Vec<FeedEntry<T>>> {
        Ok(self.lock()?.sequence.clone())
    }

    pub fn state(&self) -> SessionResult<PaginationState> {
        let state = self.lock()?;
        Ok(match state.phase {
            Phase::FetchingTop => PaginationState::FetchingTop,
            Phase::FetchingBottom => PaginationState::FetchingBottom,
            Phase::FetchingMiddle(pos) => PaginationState::FetchingMiddle(pos),
            Phase::Idle if state.exhausted => PaginationState::Exhausted,
            Phase::Idle => PaginationState::Idle,
        })
    }

    pub fn account(&self) -> &AccountKey {
        self.repository.account()
    }

    /// Paint from the cache, then refresh from the network.
    ///
    /// A cache read failure is fatal here since there is nothing to show; a
    /// failed refresh is returned but leaves the cached sequence in place.
    pub async fn start(&self) -> SessionResult<FetchOutcome> {
        let cached = self.repository.load_cached()?;
        {
            let mut state = self.lock()?;
            if state.closed {
                return Err(SessionError::Closed);
            }
            log::info!(
                "Loaded {} cached entries for {} ({})",
                cached.len(),
                self.repository.kind(),
                state.context.account
            );
            state.sequence = cached;
            self.emit(SessionEvent::SequenceChanged(state.sequence.clone()));
        }
        self.refresh().await
    }

    /// Fetch what is newer than the newest known item.
    pub async fn refresh(&self) -> SessionResult<FetchOutcome> {
        self.run(Phase::FetchingTop).await
    }

    /// Fetch what is older than the oldest known item.
    pub async fn load_more(&self) -> SessionResult<FetchOutcome> {
        self.run(Phase::FetchingBottom).await
    }

    /// Fetch the hole behind the gap at `position`.
    pub async fn fill_gap(&self, position: usize) -> SessionResult<FetchOutcome> {
        self.run(Phase::FetchingMiddle(position)).await
    }

    /// End the session. An in-flight fetch is cancelled and anything that
    /// still arrives afterwards is dropped.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            state.in_flight = None;
            state.phase = Phase::Idle;
        }
        self.shutdown.send_replace(true);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.clear();
        }
    }

    async fn run(&self, phase: Phase) -> SessionResult<FetchOutcome> {
        let (window, ticket, gap) = {
            let mut state = self.lock()?;
            if state.closed {
                return Err(SessionError::Closed);
            }
            if state.phase != Phase::Idle {
                log::debug!("Ignoring {:?}: {:?} in flight", phase, state.phase);
                return Ok(FetchOutcome::Skipped);
            }
            if phase == Phase::FetchingBottom && state.exhausted {
                return Ok(FetchOutcome::Skipped);
            }
            let Some((window, gap)) = window_for(&state.sequence, phase) else {
                return Ok(FetchOutcome::Skipped);
            };

            let ticket = state.context.local_ids.next_id();
            state.phase = phase;
            state.in_flight = Some(ticket);
            (window, ticket, gap)
        };

        if let Some(gap) = &gap {
            self.emit(SessionEvent::GapLoading(gap.clone()));
        }

        let mut shutdown = self.shutdown.subscribe();
        let result = tokio::select! {
            result = self.repository.fetch(&window) => result,
            _ = shutdown.changed() => Err(FetchError::Cancelled),
        };

        let mut state = self.lock()?;
        if state.closed || state.in_flight != Some(ticket) {
            log::debug!("Discarding late {:?} response for ticket {}", phase, ticket);
            return Ok(FetchOutcome::Discarded);
        }
        state.in_flight = None;
        state.phase = Phase::Idle;

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                log::warn!("{:?} fetch for {} failed: {}", phase, self.repository.kind(), e);
                match (phase, gap) {
                    (Phase::FetchingMiddle(position), Some(gap)) => {
                        self.emit(SessionEvent::GapFetchFailed { position, gap });
                    }
                    _ if item_count(&state.sequence) == 0 => {
                        let notice = if e.is_offline() {
                            FailureNotice::Offline
                        } else {
                            FailureNotice::Generic
                        };
                        self.emit(SessionEvent::FeedUnavailable(notice));
                    }
                    _ => {}
                }
                return Err(SessionError::Fetch(e));
            }
        };

        let items_before = item_count(&state.sequence);
        let mut merged = self.repository.reconcile(&state.sequence, page, &window);
        if phase == Phase::FetchingBottom && merged.fetched < 2 {
            self.repository.top_up_from_cache(&mut merged.sequence, &window);
        }
        state.sequence = merged.sequence;

        if phase == Phase::FetchingTop {
            if let Some(newest) = state.sequence.iter().find_map(FeedEntry::as_item) {
                self.repository.spawn_mark_read(newest.id().clone());
            }
            if !state.cleaned_up {
                state.cleaned_up = true;
                if let Err(e) = self.repository.cleanup(Utc::now() - self.retention) {
                    log::warn!("Cache cleanup for {} failed: {}", state.context.account, e);
                }
            }
        }

        self.emit(SessionEvent::SequenceChanged(state.sequence.clone()));

        // Exhaustion needs both a short page and no new items: a short page
        // that still added items is progress.
        if phase == Phase::FetchingBottom
            && !merged.full
            && item_count(&state.sequence) <= items_before
        {
            log::info!("{} exhausted for {}", self.repository.kind(), state.context.account);
            state.exhausted = true;
            self.emit(SessionEvent::Exhausted);
        }

        Ok(FetchOutcome::Applied {
            fetched: merged.fetched,
            gap: merged.overlap_gap.or(merged.trailing_gap),
        })
    }
}

impl<T: TimelineItem> Drop for FeedSession<T> {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// The window a fetch in `phase` asks for, plus the gap being filled for
/// middle fetches. `None` when the position holds no gap.
fn window_for<T: TimelineItem>(
    sequence: &[FeedEntry<T>],
    phase: Phase,
) -> Option<(Window, Option<OrderedId>)> {
    match phase {
        Phase::Idle => None,
        Phase::FetchingTop => Some((Window::top(newest_item_id(sequence).cloned()), None)),
        Phase::FetchingBottom => Some((Window::bottom(oldest_item_id(sequence).cloned()), None)),
        Phase::FetchingMiddle(position) => {
            let gap = match sequence.get(position)? {
                FeedEntry::Gap(id) => id.clone(),
                FeedEntry::Item(_) => return None,
            };
            let above = position
                .checked_sub(1)
                .and_then(|i| sequence.get(i))
                .map(|e| e.id().clone());
            let below = sequence.get(position + 1).map(|e| e.id().clone());
            Some((Window::new(above, below), Some(gap)))
        }
    }
}
