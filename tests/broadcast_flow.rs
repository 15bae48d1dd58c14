use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tg_broadcastbot::db::{self, HistoryQuery, SqliteDrafts};
use tg_broadcastbot::dispatch::Dispatcher;
use tg_broadcastbot::handlers::{handle_inbound, parse_text, App, Inbound};
use tg_broadcastbot::media_group::{MediaGroupAggregator, MediaGroupBuffer};
use tg_broadcastbot::model::{BroadcastStatus, Button, DraftState, MediaItem};
use tg_broadcastbot::reaper;
use tg_broadcastbot::topics::TopicRegistry;
use tg_broadcastbot::transport::{ChatTransport, Destination, SendError};
use tokio::sync::Mutex;

const OPERATOR: i64 = 5005;
const GROUP: i64 = -100200300;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Sent {
    Text(Destination, String, Option<String>),
    Photo(Destination, String),
    Video(Destination, String),
    Album(Destination, Vec<String>),
}

impl Sent {
    fn dest(&self) -> Destination {
        match self {
            Sent::Text(d, ..) | Sent::Photo(d, _) | Sent::Video(d, _) | Sent::Album(d, _) => *d,
        }
    }
}

/// Transport that records every request and rejects one forum thread.
#[derive(Default)]
struct FakeTelegram {
    sent: Mutex<Vec<Sent>>,
    missing_thread: Option<i32>,
}

impl FakeTelegram {
    fn without_thread(thread_id: i32) -> Self {
        Self {
            missing_thread: Some(thread_id),
            ..Default::default()
        }
    }

    async fn push(&self, item: Sent) -> Result<(), SendError> {
        let thread = item.dest().thread_id;
        self.sent.lock().await.push(item);
        if thread.is_some() && thread == self.missing_thread {
            return Err(SendError::ThreadNotFound(
                "Bad Request: message thread not found".into(),
            ));
        }
        Ok(())
    }

    async fn to_group(&self) -> Vec<Sent> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|s| s.dest().chat_id == GROUP)
            .cloned()
            .collect()
    }

    async fn last_reply(&self) -> Option<String> {
        self.sent.lock().await.iter().rev().find_map(|s| match s {
            Sent::Text(dest, text, None) if dest.chat_id == OPERATOR => Some(text.clone()),
            _ => None,
        })
    }
}

#[async_trait]
impl ChatTransport for FakeTelegram {
    async fn send_text(
        &self,
        dest: Destination,
        text: &str,
        button: Option<&Button>,
    ) -> Result<(), SendError> {
        let url = button.map(|b| b.url.clone());
        self.push(Sent::Text(dest, text.to_string(), url)).await
    }

    async fn send_photo(
        &self,
        dest: Destination,
        file_id: &str,
        _caption: Option<&str>,
        _button: Option<&Button>,
    ) -> Result<(), SendError> {
        self.push(Sent::Photo(dest, file_id.to_string())).await
    }

    async fn send_video(
        &self,
        dest: Destination,
        file_id: &str,
        _caption: Option<&str>,
        _button: Option<&Button>,
    ) -> Result<(), SendError> {
        self.push(Sent::Video(dest, file_id.to_string())).await
    }

    async fn send_media_group(
        &self,
        dest: Destination,
        items: &[MediaItem],
    ) -> Result<(), SendError> {
        let ids = items.iter().map(|i| i.file_id.clone()).collect();
        self.push(Sent::Album(dest, ids)).await
    }
}

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

async fn build_app(transport: Arc<FakeTelegram>, delay: Duration) -> (App, i64) {
    let pool = setup_pool().await;
    let user_id = db::get_or_create_user(&pool, OPERATOR, Some("sales"), Some("Sales Desk"))
        .await
        .unwrap();
    let dispatcher = Dispatcher::new(transport);
    let aggregator = MediaGroupAggregator::new(
        MediaGroupBuffer::new(),
        Arc::new(SqliteDrafts::new(pool.clone())),
        dispatcher.clone(),
        delay,
    );
    let app = App {
        topics: Arc::new(TopicRegistry::new(
            pool.clone(),
            GROUP,
            Duration::from_secs(300),
        )),
        pool,
        dispatcher,
        aggregator,
        allowed_users: Arc::new(vec![OPERATOR]),
    };
    (app, user_id)
}

async fn say(app: &App, user_id: i64, text: &str) {
    handle_inbound(app, user_id, OPERATOR, parse_text(text))
        .await
        .unwrap();
}

fn album_item(item: MediaItem, group: &str) -> Inbound {
    Inbound::Media {
        item,
        group_id: Some(group.to_string()),
    }
}

#[tokio::test]
async fn album_broadcast_to_all_topics_with_one_broken_thread() {
    let transport = Arc::new(FakeTelegram::without_thread(32));
    let (app, uid) = build_app(transport.clone(), Duration::from_millis(50)).await;

    say(&app, uid, "/topic_add 31 Sedans").await;
    say(&app, uid, "/topic_add 32 Trucks").await;
    say(&app, uid, "/broadcast").await;
    say(&app, uid, "2024 pickups just arrived").await;
    say(&app, uid, "Reserve | https://dealer.example/reserve").await;
    for item in [
        MediaItem::photo("front"),
        MediaItem::photo("side"),
        MediaItem::video("doc:walkaround"),
    ] {
        handle_inbound(&app, uid, OPERATOR, album_item(item, "g-77"))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(transport
        .last_reply()
        .await
        .unwrap()
        .starts_with("Album of 3 item(s) received."));

    say(&app, uid, "/send_all").await;

    let album = vec!["front".to_string(), "side".into(), "walkaround".into()];
    let caption = "2024 pickups just arrived".to_string();
    let reserve = Some("https://dealer.example/reserve".to_string());
    assert_eq!(
        transport.to_group().await,
        vec![
            Sent::Album(Destination::chat(GROUP), album.clone()),
            Sent::Text(Destination::chat(GROUP), caption.clone(), reserve.clone()),
            Sent::Album(Destination::topic(GROUP, 31), album.clone()),
            Sent::Text(Destination::topic(GROUP, 31), caption, reserve),
            // The album to the broken thread fails, so no follow-up text.
            Sent::Album(Destination::topic(GROUP, 32), album),
        ]
    );
    let summary = transport.last_reply().await.unwrap();
    assert!(summary.starts_with("Broadcast delivered to 2/3 targets, 1 failed:"));
    assert!(summary.contains("Trucks"));

    let history = db::list_broadcasts(&app.pool, &HistoryQuery::default())
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, BroadcastStatus::Partial);
    assert_eq!((history[0].attempted, history[0].failed), (3, 1));
    assert!(db::load_draft(&app.pool, uid).await.unwrap().is_none());
}

#[tokio::test]
async fn drain_flushes_albums_before_their_timer() {
    let transport = Arc::new(FakeTelegram::default());
    let (app, uid) = build_app(transport.clone(), Duration::from_secs(3600)).await;

    say(&app, uid, "/broadcast").await;
    say(&app, uid, "Closing the lot early").await;
    say(&app, uid, "/skip").await;
    handle_inbound(&app, uid, OPERATOR, album_item(MediaItem::photo("p"), "g-1"))
        .await
        .unwrap();
    assert_eq!(app.aggregator.buffer().len(), 1);

    app.aggregator.drain().await;
    assert!(app.aggregator.buffer().is_empty());
    let draft = db::load_draft(&app.pool, uid).await.unwrap().unwrap();
    assert_eq!(draft.state, DraftState::AwaitingConfirmation);
    assert!(transport
        .last_reply()
        .await
        .unwrap()
        .starts_with("Album of 1 item(s) received."));
}

#[tokio::test]
async fn swept_album_is_dropped_silently() {
    let transport = Arc::new(FakeTelegram::default());
    let (app, uid) = build_app(transport.clone(), Duration::from_millis(200)).await;

    say(&app, uid, "/broadcast").await;
    handle_inbound(&app, uid, OPERATOR, album_item(MediaItem::photo("p"), "g-2"))
        .await
        .unwrap();
    let sent_before = transport.sent.lock().await.len();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let evicted = reaper::sweep(app.aggregator.buffer(), Duration::from_millis(10)).unwrap();
    assert_eq!(evicted, 1);
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(transport.sent.lock().await.len(), sent_before);
    let draft = db::load_draft(&app.pool, uid).await.unwrap().unwrap();
    assert_eq!(draft.state, DraftState::AwaitingText);
}
