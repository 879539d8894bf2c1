use std::error::Error;
use std::sync::Arc;

use timeline_sync::config::TimelineConfig;
use timeline_sync::models::{
    Chat, ChatMessage, Conversation, FeedEntry, FeedKind, Status, TimelineItem,
};
use timeline_sync::remote::{MastodonClient, RemoteFetcher};
use timeline_sync::session::{FeedSession, FetchOutcome, PaginationState, SessionContext, SessionError};
use timeline_sync::store::CacheStore;

#[tokio::main]
async fn main() {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    // Load environment variables
    dotenvy::dotenv().ok();

    if let Err(e) = run().await {
        log::error!("timeline-sync failed: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let config = TimelineConfig::from_env()?;

    log::info!("Database: {}", config.database_path);
    let store = Arc::new(CacheStore::open_with_retention(
        &config.database_path,
        config.retention,
    )?);

    let client = MastodonClient::new(
        &config.instance_url,
        &config.access_token,
        config.fetch_timeout,
    );

    match &config.feed {
        FeedKind::Home => sync_feed::<Status>(&config, store, Arc::new(client.home())).await,
        FeedKind::Chats => sync_feed::<Chat>(&config, store, Arc::new(client.chats())).await,
        FeedKind::ChatMessages { chat_id } => {
            sync_feed::<ChatMessage>(&config, store, Arc::new(client.chat_messages(chat_id))).await
        }
        FeedKind::Conversations => {
            sync_feed::<Conversation>(&config, store, Arc::new(client.conversations())).await
        }
    }
}

/// Open a session on the configured feed, pull the requested number of older
/// pages, and print what the session ends up holding.
async fn sync_feed<T: TimelineItem>(
    config: &TimelineConfig,
    store: Arc<CacheStore>,
    fetcher: Arc<dyn RemoteFetcher<T>>,
) -> Result<(), Box<dyn Error>> {
    let session = FeedSession::new(
        SessionContext::new(config.account.clone()),
        config.feed.clone(),
        store,
        fetcher,
        config.page_limit,
    )
    .with_retention(config.retention);

    match session.start().await {
        Ok(outcome) => log::info!("Refresh of {}: {:?}", config.feed, outcome),
        Err(SessionError::Fetch(e)) => log::warn!("Refresh failed, showing cached entries: {}", e),
        Err(e) => return Err(e.into()),
    }

    for page in 0..config.bottom_pages {
        match session.load_more().await {
            Ok(FetchOutcome::Applied { fetched, .. }) => {
                log::info!("Older page {}: {} items", page + 1, fetched);
            }
            Ok(_) => break,
            Err(e) => {
                log::warn!("Loading older page failed: {}", e);
                break;
            }
        }
        if session.state()? == PaginationState::Exhausted {
            log::info!("Reached the end of {}", config.feed);
            break;
        }
    }

    for entry in session.snapshot()? {
        match entry {
            FeedEntry::Item(item) => {
                println!("{} {} {}", item.id(), item.author_id(), item.summary());
            }
            FeedEntry::Gap(id) => println!("~ gap {}", id),
        }
    }

    session.close();
    Ok(())
}
