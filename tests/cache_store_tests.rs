use chrono::{Duration, Utc};
use std::sync::Arc;
use std::thread;

use timeline_sync::merge::{self, FetchedPage, PersistPlan, Window};
use timeline_sync::models::{
    Account, AccountKey, Chat, ChatMessage, FeedEntry, FeedKind, Status, TimelineItem,
};
use timeline_sync::ordered_id::OrderedId;
use timeline_sync::store::CacheStore;

fn chat() -> FeedKind {
    FeedKind::ChatMessages { chat_id: "c1".to_string() }
}

fn message(id: &str) -> ChatMessage {
    message_aged(id, Duration::zero())
}

fn message_aged(id: &str, age: Duration) -> ChatMessage {
    ChatMessage {
        id: OrderedId::from(id),
        chat_id: "c1".to_string(),
        account_id: "7".to_string(),
        content: Some(format!("hello {}", id)),
        created_at: Utc::now() - age,
        attachment: None,
    }
}

fn load(store: &CacheStore, account: &AccountKey) -> Vec<String> {
    let entries: Vec<FeedEntry<ChatMessage>> =
        store.get_range(account, &chat(), None, None, 100).unwrap();
    entries
        .iter()
        .map(|e| match e {
            FeedEntry::Item(m) => m.id.to_string(),
            FeedEntry::Gap(id) => format!("gap:{}", id),
        })
        .collect()
}

// ==================== Gap Tests ====================

#[test]
fn test_gap_never_overwrites_item() {
    let store = CacheStore::in_memory().unwrap();
    let account = AccountKey::new("1");
    store.upsert_page(&account, &chat(), &[message("10")]).unwrap();

    let inserted = store
        .insert_gap_if_absent(&account, &chat(), &OrderedId::from("10"))
        .unwrap();
    assert!(!inserted);

    let entries: Vec<FeedEntry<ChatMessage>> =
        store.get_range(&account, &chat(), None, None, 10).unwrap();
    assert_eq!(entries.len(), 1);
    let kept = entries[0].as_item().unwrap();
    assert_eq!(kept.content.as_deref(), Some("hello 10"));
}

#[test]
fn test_item_replaces_gap() {
    let store = CacheStore::in_memory().unwrap();
    let account = AccountKey::new("1");
    store
        .insert_gap_if_absent(&account, &chat(), &OrderedId::from("10"))
        .unwrap();
    assert_eq!(load(&store, &account), vec!["gap:10"]);

    store.upsert_page(&account, &chat(), &[message("10")]).unwrap();
    assert_eq!(load(&store, &account), vec!["10"]);
}

#[test]
fn test_duplicate_gap_insert_is_ignored() {
    let store = CacheStore::in_memory().unwrap();
    let account = AccountKey::new("1");
    let gap = OrderedId::from("10");

    assert!(store.insert_gap_if_absent(&account, &chat(), &gap).unwrap());
    assert!(!store.insert_gap_if_absent(&account, &chat(), &gap).unwrap());
    assert_eq!(store.count_entries(&account, &chat()).unwrap(), 1);
}

// ==================== Range Tests ====================

#[test]
fn test_delete_range_is_strict() {
    let store = CacheStore::in_memory().unwrap();
    let account = AccountKey::new("1");
    store
        .upsert_page(&account, &chat(), &[message("5"), message("4"), message("3"), message("2")])
        .unwrap();
    store
        .insert_gap_if_absent(&account, &chat(), &OrderedId::from("1"))
        .unwrap();

    let removed = store
        .delete_range(&account, &chat(), &OrderedId::from("2"), &OrderedId::from("5"))
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(load(&store, &account), vec!["5", "2", "gap:1"]);
}

#[test]
fn test_get_range_respects_bounds_and_limit() {
    let store = CacheStore::in_memory().unwrap();
    let account = AccountKey::new("1");
    let page: Vec<ChatMessage> = (1..=12).rev().map(|i| message(&i.to_string())).collect();
    store.upsert_page(&account, &chat(), &page).unwrap();

    let entries: Vec<FeedEntry<ChatMessage>> = store
        .get_range(&account, &chat(), Some(&OrderedId::from("11")), Some(&OrderedId::from("2")), 3)
        .unwrap();
    let ids: Vec<String> = entries.iter().map(|e| e.id().to_string()).collect();
    assert_eq!(ids, vec!["10", "9", "8"]);
}

#[test]
fn test_overwrite_deleted_status() {
    let store = CacheStore::in_memory().unwrap();
    let account = AccountKey::new("1");
    store
        .upsert_page(&account, &chat(), &[message("3"), message("2"), message("1")])
        .unwrap();

    // The server no longer has "2".
    store
        .delete_range(&account, &chat(), &OrderedId::from("1"), &OrderedId::from("3"))
        .unwrap();
    store
        .upsert_page(&account, &chat(), &[message("3"), message("1")])
        .unwrap();

    assert_eq!(load(&store, &account), vec!["3", "1"]);
}

#[test]
fn test_merge_plan_drops_deleted_status() {
    let store = CacheStore::in_memory().unwrap();
    let account = AccountKey::new("1");
    store
        .upsert_page(&account, &chat(), &[message("3"), message("2"), message("1")])
        .unwrap();

    let existing = store.get_range(&account, &chat(), None, None, 30).unwrap();
    let page = FetchedPage::new(vec![message("3"), message("1")], 30);
    let merged = merge::merge(&existing, page, &Window::unbounded());
    store.commit(&account, &chat(), &merged.plan).unwrap();

    assert_eq!(load(&store, &account), vec!["3", "1"]);
}

#[test]
fn test_empty_page_with_bounds_clears_window() {
    let store = CacheStore::in_memory().unwrap();
    let account = AccountKey::new("1");
    store
        .upsert_page(&account, &chat(), &[message("9"), message("6"), message("3")])
        .unwrap();
    store
        .insert_gap_if_absent(&account, &chat(), &OrderedId::from("5"))
        .unwrap();

    let existing: Vec<FeedEntry<ChatMessage>> = store.get_range(&account, &chat(), None, None, 30).unwrap();
    let merged = merge::merge(&existing, FetchedPage::empty(30), &Window::between("9", "3"));
    store.commit(&account, &chat(), &merged.plan).unwrap();

    assert_eq!(load(&store, &account), vec!["9", "3"]);
}

#[test]
fn test_commit_gap_does_not_shadow_upserted_item() {
    let store = CacheStore::in_memory().unwrap();
    let account = AccountKey::new("1");
    let plan = PersistPlan {
        upserts: vec![message("6")],
        gaps: vec![OrderedId::from("6"), OrderedId::from("4")],
        ..PersistPlan::default()
    };
    store.commit(&account, &chat(), &plan).unwrap();

    assert_eq!(load(&store, &account), vec!["6", "gap:4"]);
}

#[test]
fn test_unreadable_payload_is_skipped() {
    let store = CacheStore::in_memory().unwrap();
    let account = AccountKey::new("1");
    store.upsert_page(&account, &chat(), &[message("10")]).unwrap();
    store
        .insert_gap_if_absent(&account, &chat(), &OrderedId::from("9"))
        .unwrap();

    // A chat message row does not decode as a status.
    let entries: Vec<FeedEntry<Status>> =
        store.get_range(&account, &chat(), None, None, 10).unwrap();
    assert_eq!(entries, vec![FeedEntry::Gap(OrderedId::from("9"))]);
}

// ==================== Chat List Tests ====================

fn chat_row(id: &str, last_message: &str) -> Chat {
    let mut last = message(last_message);
    last.chat_id = id.to_string();
    Chat {
        id: OrderedId::from(id),
        account: Account {
            id: "7".to_string(),
            username: "bob".to_string(),
            acct: "bob".to_string(),
            display_name: String::new(),
            url: String::new(),
            avatar: String::new(),
            bot: false,
        },
        unread: 0,
        updated_at: Utc::now(),
        last_message: Some(last),
    }
}

fn load_chats(store: &CacheStore, account: &AccountKey) -> Vec<String> {
    let entries: Vec<FeedEntry<Chat>> =
        store.get_range(account, &FeedKind::Chats, None, None, 100).unwrap();
    entries
        .iter()
        .map(|e| match e {
            FeedEntry::Item(c) => c.id().to_string(),
            FeedEntry::Gap(id) => format!("gap:{}", id),
        })
        .collect()
}

#[test]
fn test_chat_list_cached_in_activity_order() {
    let store = CacheStore::in_memory().unwrap();
    let account = AccountKey::new("1");
    let page = FetchedPage::new(
        vec![
            chat_row("5", "AEu9"),
            chat_row("9", "AEu5"),
            chat_row("3", "AEt2"),
            chat_row("7", "AEs8"),
        ],
        30,
    );
    let first = merge::merge(&[], page, &Window::unbounded());
    store.commit(&account, &FeedKind::Chats, &first.plan).unwrap();
    assert_eq!(load_chats(&store, &account), vec!["5", "9", "3", "7"]);

    // Chat 3 gets a new message and is listed first again.
    let refreshed = merge::merge(
        &first.sequence,
        FetchedPage::new(vec![chat_row("3", "AEv1"), chat_row("5", "AEu9")], 30),
        &Window::top(Some("AEu9".into())),
    );
    store.commit(&account, &FeedKind::Chats, &refreshed.plan).unwrap();

    assert_eq!(load_chats(&store, &account), vec!["3", "5", "9", "7"]);
    assert_eq!(store.count_entries(&account, &FeedKind::Chats).unwrap(), 4);
}

// ==================== Cleanup Tests ====================

#[test]
fn test_cleanup_keeps_newest_row() {
    let store = CacheStore::in_memory().unwrap();
    let account = AccountKey::new("1");
    store
        .upsert_page(
            &account,
            &chat(),
            &[
                message_aged("3", Duration::days(20)),
                message_aged("2", Duration::days(21)),
                message_aged("1", Duration::days(22)),
            ],
        )
        .unwrap();

    let removed = store.cleanup(&account, Utc::now()).unwrap();
    assert_eq!(removed, 2);
    assert_eq!(load(&store, &account), vec!["3"]);

    // Running again never empties the feed.
    store.cleanup(&account, Utc::now()).unwrap();
    assert_eq!(load(&store, &account), vec!["3"]);
}

#[test]
fn test_cleanup_keeps_recent_rows_and_fresh_gaps() {
    let store = CacheStore::in_memory().unwrap();
    let account = AccountKey::new("1");
    store
        .upsert_page(
            &account,
            &chat(),
            &[
                message_aged("9", Duration::hours(1)),
                message_aged("5", Duration::days(30)),
                message_aged("4", Duration::days(31)),
            ],
        )
        .unwrap();
    store
        .insert_gap_if_absent(&account, &chat(), &OrderedId::from("8"))
        .unwrap();

    store.cleanup(&account, Utc::now() - Duration::days(14)).unwrap();
    assert_eq!(load(&store, &account), vec!["9", "gap:8"]);
}

#[test]
fn test_cleanup_with_only_gaps_keeps_one() {
    let store = CacheStore::in_memory().unwrap();
    let account = AccountKey::new("1");
    store
        .insert_gap_if_absent(&account, &chat(), &OrderedId::from("8"))
        .unwrap();

    store.cleanup(&account, Utc::now() + Duration::days(1)).unwrap();
    assert_eq!(store.count_entries(&account, &chat()).unwrap(), 1);
}

#[test]
fn test_cleanup_at_construction() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let path = path.to_str().unwrap();
    let account = AccountKey::new("1");

    {
        let store = CacheStore::new(path).unwrap();
        store
            .upsert_page(
                &account,
                &chat(),
                &[
                    message_aged("3", Duration::days(1)),
                    message_aged("2", Duration::days(20)),
                    message_aged("1", Duration::days(21)),
                ],
            )
            .unwrap();
    }

    let reopened = CacheStore::new(path).unwrap();
    assert_eq!(load(&reopened, &account), vec!["3"]);

    let strict = CacheStore::open_with_retention(path, Duration::zero()).unwrap();
    assert_eq!(load(&strict, &account), vec!["3"]);
}

// ==================== Concurrency Tests ====================

#[test]
fn test_parallel_writers_on_separate_partitions() {
    let store = Arc::new(CacheStore::in_memory().unwrap());

    let handles: Vec<_> = (0..4)
        .map(|n| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let account = AccountKey::new(format!("account-{}", n));
                for i in 1..=25 {
                    store
                        .upsert_page(&account, &chat(), &[message(&i.to_string())])
                        .unwrap();
                    store
                        .insert_gap_if_absent(&account, &chat(), &OrderedId::from(i.to_string()))
                        .unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    for n in 0..4 {
        let account = AccountKey::new(format!("account-{}", n));
        assert_eq!(store.count_entries(&account, &chat()).unwrap(), 25);
        let entries: Vec<FeedEntry<ChatMessage>> =
            store.get_range(&account, &chat(), None, None, 100).unwrap();
        assert!(entries.iter().all(|e| !e.is_gap()));
    }
}
