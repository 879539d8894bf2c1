use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::merge::{PersistPlan, Window};
use crate::models::*;
use crate::ordered_id::OrderedId;

/// How long cached rows survive before `cleanup` may evict them.
pub const DEFAULT_RETENTION_DAYS: i64 = 14;

const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// Strict bounds on the feed position in length-then-lexicographic order. `?3`
// is the exclusive upper bound and `?4` the exclusive lower bound; NULL means
// unbounded.
const BELOW_UPPER: &str = "(?3 IS NULL OR LENGTH(page_id) < LENGTH(?3) \
     OR (LENGTH(page_id) = LENGTH(?3) AND page_id < ?3))";
const ABOVE_LOWER: &str = "(?4 IS NULL OR LENGTH(page_id) > LENGTH(?4) \
     OR (LENGTH(page_id) = LENGTH(?4) AND page_id > ?4))";

/// Durable per-account, per-feed cache of feed entries.
///
/// Rows are keyed by feed position (`page_id`); item rows also carry the
/// item's own id so an item that moves position replaces its old row.
///
/// All writes go through one connection, one transaction at a time, which
/// serialises writers on every partition. A file-backed store runs in WAL mode
/// with a second connection for reads, so reads never wait behind a write. The
/// in-memory store has a single connection for both.
pub struct CacheStore {
    writer: Mutex<Connection>,
    reader: Option<Mutex<Connection>>,
}

impl CacheStore {
    /// Open (or create) the cache at `db_path` and evict rows older than the
    /// default retention.
    pub fn new(db_path: &str) -> StoreResult<Self> {
        Self::open_with_retention(db_path, Duration::days(DEFAULT_RETENTION_DAYS))
    }

    pub fn open_with_retention(db_path: &str, retention: Duration) -> StoreResult<Self> {
        let writer = Connection::open(db_path)?;
        writer.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            writer.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        log::debug!("Cache {} journal mode {}", db_path, mode);
        init_schema(&writer)?;

        let reader = Connection::open(db_path)?;
        reader.busy_timeout(BUSY_TIMEOUT)?;

        let store = Self {
            writer: Mutex::new(writer),
            reader: Some(Mutex::new(reader)),
        };
        let removed = store.cleanup_all(Utc::now() - retention)?;
        if removed > 0 {
            log::info!("Cache cleanup removed {} stale rows from {}", removed, db_path);
        }
        Ok(store)
    }

    /// Create an in-memory store for testing
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            writer: Mutex::new(conn),
            reader: None,
        })
    }

    fn read_conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        lock(self.reader.as_ref().unwrap_or(&self.writer))
    }

    /// Run `f` inside one transaction on the writer connection.
    fn write<R>(&self, f: impl FnOnce(&Connection) -> StoreResult<R>) -> StoreResult<R> {
        let mut conn = lock(&self.writer)?;
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    // ==================== Reads ====================

    /// Entries with `since_id < id < max_id`, newest first, at most `limit`.
    /// Rows without a payload come back as gaps.
    pub fn get_range<T: TimelineItem>(
        &self,
        account: &AccountKey,
        kind: &FeedKind,
        max_id: Option<&OrderedId>,
        since_id: Option<&OrderedId>,
        limit: usize,
    ) -> StoreResult<Vec<FeedEntry<T>>> {
        let conn = self.read_conn()?;
        let sql = format!(
            "SELECT page_id, payload FROM feed_entries \
             WHERE account_id = ?1 AND feed_kind = ?2 AND {} AND {} \
             ORDER BY LENGTH(page_id) DESC, page_id DESC LIMIT ?5",
            BELOW_UPPER, ABOVE_LOWER
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                account.as_str(),
                kind.storage_key(),
                max_id.map(OrderedId::as_str),
                since_id.map(OrderedId::as_str),
                limit as i64,
            ],
            |row| {
                let page_id: String = row.get(0)?;
                let payload: Option<String> = row.get(1)?;
                Ok((page_id, payload))
            },
        )?;

        let mut entries = Vec::new();
        for row in rows {
            let (page_id, payload) = row?;
            match payload {
                None => entries.push(FeedEntry::Gap(OrderedId::new(page_id))),
                Some(json) => match serde_json::from_str::<T>(&json) {
                    Ok(item) => entries.push(FeedEntry::Item(item)),
                    Err(e) => {
                        log::warn!("Skipping unreadable cached {} row {}: {}", kind, page_id, e);
                    }
                },
            }
        }
        Ok(entries)
    }

    pub fn count_entries(&self, account: &AccountKey, kind: &FeedKind) -> StoreResult<i64> {
        let conn = self.read_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM feed_entries WHERE account_id = ?1 AND feed_kind = ?2",
            params![account.as_str(), kind.storage_key()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ==================== Writes ====================

    /// Insert or replace concrete items.
    pub fn upsert_page<T: TimelineItem>(
        &self,
        account: &AccountKey,
        kind: &FeedKind,
        items: &[T],
    ) -> StoreResult<()> {
        self.write(|conn| upsert_items(conn, account, kind, items))
    }

    /// Delete every row (items and gaps) strictly between `min_id` and `max_id`.
    pub fn delete_range(
        &self,
        account: &AccountKey,
        kind: &FeedKind,
        min_id: &OrderedId,
        max_id: &OrderedId,
    ) -> StoreResult<usize> {
        self.write(|conn| delete_between(conn, account, kind, Some(max_id), Some(min_id), false))
    }

    /// Record a gap at `id` unless a row (gap or item) already exists there.
    /// Returns whether a row was inserted.
    pub fn insert_gap_if_absent(
        &self,
        account: &AccountKey,
        kind: &FeedKind,
        id: &OrderedId,
    ) -> StoreResult<bool> {
        self.write(|conn| insert_gap(conn, account, kind, id))
    }

    /// Delete gap rows strictly inside `window`; concrete items are untouched.
    pub fn delete_gaps_between(
        &self,
        account: &AccountKey,
        kind: &FeedKind,
        window: &Window,
    ) -> StoreResult<usize> {
        self.write(|conn| {
            delete_between(
                conn,
                account,
                kind,
                window.max_id.as_ref(),
                window.since_id.as_ref(),
                true,
            )
        })
    }

    /// Apply a merge result atomically: range delete, gap clearing, upserts,
    /// then gap inserts (which never overwrite what the upserts wrote).
    pub fn commit<T: TimelineItem>(
        &self,
        account: &AccountKey,
        kind: &FeedKind,
        plan: &PersistPlan<T>,
    ) -> StoreResult<()> {
        if plan.is_empty() {
            return Ok(());
        }
        self.write(|conn| {
            if let Some((min_id, max_id)) = &plan.delete_range {
                delete_between(conn, account, kind, Some(max_id), Some(min_id), false)?;
            }
            if let Some(window) = &plan.clear_gaps {
                delete_between(
                    conn,
                    account,
                    kind,
                    window.max_id.as_ref(),
                    window.since_id.as_ref(),
                    true,
                )?;
            }
            upsert_items(conn, account, kind, &plan.upserts)?;
            for gap in &plan.gaps {
                insert_gap(conn, account, kind, gap)?;
            }
            Ok(())
        })
    }

    // ==================== Retention ====================

    /// Delete this account's rows created before `cutoff`, except the most
    /// recent row of each feed so no feed is ever emptied by cleanup.
    pub fn cleanup(&self, account: &AccountKey, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let sql = format!("{} AND account_id = ?2", CLEANUP_SQL);
        let removed = self.write(|conn| {
            Ok(conn.execute(&sql, params![cutoff.timestamp_millis(), account.as_str()])?)
        })?;
        log::debug!("Cleanup for account {} removed {} rows", account, removed);
        Ok(removed)
    }

    /// `cleanup` across every account in the cache.
    pub fn cleanup_all(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        self.write(|conn| Ok(conn.execute(CLEANUP_SQL, params![cutoff.timestamp_millis()])?))
    }
}

// The retained row is the partition's newest concrete item, or its newest gap
// when it holds nothing else. Both lookups are index seeks, so the statement
// costs O(rows older than the cutoff).
const CLEANUP_SQL: &str = r#"DELETE FROM feed_entries
    WHERE created_at < ?1
    AND created_at < COALESCE(
        (SELECT MAX(f.created_at) FROM feed_entries f
         WHERE f.account_id = feed_entries.account_id
           AND f.feed_kind = feed_entries.feed_kind
           AND f.is_gap = 0),
        (SELECT MAX(f.created_at) FROM feed_entries f
         WHERE f.account_id = feed_entries.account_id
           AND f.feed_kind = feed_entries.feed_kind))"#;

fn lock(conn: &Mutex<Connection>) -> StoreResult<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|e| StoreError::LockPoisoned(e.to_string()))
}

fn init_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS feed_entries (
            account_id TEXT NOT NULL,
            feed_kind TEXT NOT NULL,
            page_id TEXT NOT NULL,
            item_id TEXT,
            is_gap INTEGER NOT NULL,
            author_id TEXT,
            payload TEXT,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (account_id, feed_kind, page_id)
        );

        CREATE INDEX IF NOT EXISTS idx_feed_entries_item
            ON feed_entries(account_id, feed_kind, item_id);
        CREATE INDEX IF NOT EXISTS idx_feed_entries_partition_age
            ON feed_entries(account_id, feed_kind, created_at);
        CREATE INDEX IF NOT EXISTS idx_feed_entries_partition_items
            ON feed_entries(account_id, feed_kind, is_gap, created_at);
        CREATE INDEX IF NOT EXISTS idx_feed_entries_age
            ON feed_entries(created_at);
        "#,
    )?;
    Ok(())
}

fn upsert_items<T: TimelineItem>(
    conn: &Connection,
    account: &AccountKey,
    kind: &FeedKind,
    items: &[T],
) -> StoreResult<()> {
    let feed = kind.storage_key();
    let mut moved = conn.prepare_cached(
        r#"DELETE FROM feed_entries
           WHERE account_id = ?1 AND feed_kind = ?2 AND item_id = ?3 AND page_id <> ?4"#,
    )?;
    let mut insert = conn.prepare_cached(
        r#"INSERT OR REPLACE INTO feed_entries
           (account_id, feed_kind, page_id, item_id, is_gap, author_id, payload, created_at)
           VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7)"#,
    )?;
    for item in items {
        let payload = serde_json::to_string(item)?;
        moved.execute(params![
            account.as_str(),
            feed,
            item.id().as_str(),
            item.page_id().as_str(),
        ])?;
        insert.execute(params![
            account.as_str(),
            feed,
            item.page_id().as_str(),
            item.id().as_str(),
            item.author_id(),
            payload,
            item.created_at().timestamp_millis(),
        ])?;
    }
    Ok(())
}

fn insert_gap(
    conn: &Connection,
    account: &AccountKey,
    kind: &FeedKind,
    id: &OrderedId,
) -> StoreResult<bool> {
    let inserted = conn.execute(
        r#"INSERT OR IGNORE INTO feed_entries
           (account_id, feed_kind, page_id, item_id, is_gap, author_id, payload, created_at)
           VALUES (?1, ?2, ?3, NULL, 1, NULL, NULL, ?4)"#,
        params![
            account.as_str(),
            kind.storage_key(),
            id.as_str(),
            Utc::now().timestamp_millis()
        ],
    )?;
    Ok(inserted > 0)
}

fn delete_between(
    conn: &Connection,
    account: &AccountKey,
    kind: &FeedKind,
    upper: Option<&OrderedId>,
    lower: Option<&OrderedId>,
    gaps_only: bool,
) -> StoreResult<usize> {
    let sql = format!(
        "DELETE FROM feed_entries WHERE account_id = ?1 AND feed_kind = ?2 AND {} AND {}{}",
        BELOW_UPPER,
        ABOVE_LOWER,
        if gaps_only { " AND is_gap = 1" } else { "" }
    );
    let removed = conn.execute(
        &sql,
        params![
            account.as_str(),
            kind.storage_key(),
            upper.map(OrderedId::as_str),
            lower.map(OrderedId::as_str),
        ],
    )?;
    Ok(removed)
}
