use crate::db::{self, HistoryQuery, NewBroadcast, Pool};
use crate::dispatch::Dispatcher;
use crate::media_group::{MediaGroupAggregator, Submitter};
use crate::model::{
    BroadcastPayload, Button, DraftState, Media, MediaItem, TargetScope, CONFIRM_PROMPT, NO_DRAFT,
    UPLOAD_TAG,
};
use crate::topics::TopicRegistry;
use crate::transport::Destination;
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::Document;
use tracing::{debug, info, instrument, warn};

const HISTORY_PAGE_SIZE: u32 = 10;

const USAGE: &str = "Broadcast commands:\n\
/broadcast - start a new broadcast\n\
/skip - skip the current step\n\
/send_all - send to the general chat and every topic\n\
/send_general - send to the general chat only\n\
/send_topic <name> - send to one topic\n\
/cancel - drop the current broadcast\n\
\n\
Topics:\n\
/topics - list topics\n\
/topic_add <thread_id> <name>\n\
/topic_rename <old> | <new>\n\
/topic_id <name> <thread_id>\n\
/topic_del <name>\n\
\n\
History:\n\
/history [page]\n\
/stats";


static COMMAND_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^/(?P<name>[A-Za-z0-9_]+)(?:@\S+)?(?:\s+(?P<args>.*))?$")
        .expect("Failed to compile command regex")
});

static BUTTON_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<label>[^|]+?)\s*\|\s*(?P<url>\S+)$").expect("button regex"));

/// Shared state of the operator console.
#[derive(Clone)]
pub struct App {
    pub pool: Pool,
    pub dispatcher: Dispatcher,
    pub aggregator: MediaGroupAggregator,
    pub topics: Arc<TopicRegistry>,
    pub allowed_users: Arc<Vec<i64>>,
}

impl App {
    /// Only operators listed in `telegram.allowed_users` may use the bot.
    pub fn is_allowed(&self, tg_user_id: i64) -> bool {
        self.allowed_users.contains(&tg_user_id)
    }
}

/// An incoming operator message reduced to what the console acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Command { name: String, args: String },
    Text(String),
    Media {
        item: MediaItem,
        group_id: Option<String>,
    },
    Unsupported { group_id: Option<String> },
}

pub fn parse_text(text: &str) -> Inbound {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return Inbound::Text(text.to_string());
    }
    match COMMAND_RE.captures(trimmed) {
        Some(caps) => Inbound::Command {
            name: caps["name"].to_ascii_lowercase(),
            args: caps
                .name("args")
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default(),
        },
        None => Inbound::Command {
            name: String::new(),
            args: String::new(),
        },
    }
}

/// Parse `Label | https://link` into a button. Only absolute http(s) links
/// are accepted.
pub fn parse_button(text: &str) -> Option<Button> {
    let caps = BUTTON_RE.captures(text.trim())?;
    let label = caps["label"].trim();
    let url = Url::parse(&caps["url"]).ok()?;
    if label.is_empty() || !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    Some(Button {
        label: label.to_string(),
        url: url.to_string(),
    })
}

fn video_document(doc: &Document) -> Option<MediaItem> {
    let is_video = doc
        .mime_type
        .as_ref()
        .is_some_and(|m| m.essence_str().starts_with("video/"));
    is_video.then(|| MediaItem::video(format!("{}{}", UPLOAD_TAG, doc.file.id)))
}

pub fn classify_message(msg: &Message) -> Inbound {
    if let Some(text) = msg.text() {
        return parse_text(text);
    }
    let group_id = msg.media_group_id().map(str::to_owned);
    let item = if let Some(sizes) = msg.photo() {
        // Largest size comes last.
        sizes.last().map(|s| MediaItem::photo(s.file.id.clone()))
    } else if let Some(video) = msg.video() {
        Some(MediaItem::video(video.file.id.clone()))
    } else if let Some(doc) = msg.document() {
        video_document(doc)
    } else {
        None
    };
    match item {
        Some(item) => Inbound::Media { item, group_id },
        None => Inbound::Unsupported { group_id },
    }
}

#[instrument(skip_all)]
pub async fn handle_update(app: &App, msg: &Message) -> Result<()> {
    let user = match msg.from() {
        Some(u) => u,
        None => return Ok(()),
    };
    let tg_user_id = user.id.0 as i64;
    if !app.is_allowed(tg_user_id) {
        debug!(tg_user_id, "ignoring message from unknown user");
        return Ok(());
    }

    let full_name = user.full_name();
    let user_id = db::get_or_create_user(
        &app.pool,
        tg_user_id,
        user.username.as_deref(),
        Some(full_name.as_str()),
    )
    .await?;
    handle_inbound(app, user_id, msg.chat.id.0, classify_message(msg)).await
}

/// Act on one operator message. `user_id` is the internal user id and
/// `chat_id` the operator's private chat.
pub async fn handle_inbound(app: &App, user_id: i64, chat_id: i64, inbound: Inbound) -> Result<()> {
    match inbound {
        Inbound::Command { name, args } => handle_command(app, user_id, chat_id, &name, &args).await,
        Inbound::Text(text) => handle_text(app, user_id, chat_id, &text).await,
        Inbound::Media {
            item,
            group_id: Some(group_id),
        } => {
            app.aggregator
                .submit(Submitter { user_id, chat_id }, &group_id, Some(item));
            Ok(())
        }
        Inbound::Media {
            item,
            group_id: None,
        } => handle_single_media(app, user_id, chat_id, item).await,
        Inbound::Unsupported {
            group_id: Some(group_id),
        } => {
            app.aggregator
                .submit(Submitter { user_id, chat_id }, &group_id, None);
            Ok(())
        }
        Inbound::Unsupported { group_id: None } => {
            reply(app, chat_id, "Unsupported message type. Send a photo or a video.").await;
            Ok(())
        }
    }
}

async fn reply(app: &App, chat_id: i64, text: &str) {
    if let Err(err) = app.dispatcher.notify(Destination::chat(chat_id), text).await {
        warn!(error = %err, chat_id, "failed to reply to operator");
    }
}

async fn handle_command(
    app: &App,
    user_id: i64,
    chat_id: i64,
    name: &str,
    args: &str,
) -> Result<()> {
    match name {
        "start" | "help" => reply(app, chat_id, USAGE).await,
        "broadcast" => {
            db::start_draft(&app.pool, user_id).await?;
            info!(user_id, "started broadcast draft");
            reply(app, chat_id, DraftState::AwaitingText.prompt()).await;
        }
        "skip" => skip_step(app, user_id, chat_id).await?,
        "send_all" => send_broadcast(app, user_id, chat_id, TargetScope::All).await?,
        "send_general" => send_broadcast(app, user_id, chat_id, TargetScope::General).await?,
        "send_topic" => {
            if args.is_empty() {
                reply(app, chat_id, "Usage: /send_topic <name>").await;
            } else {
                send_broadcast(app, user_id, chat_id, TargetScope::Topic(args.to_string())).await?;
            }
        }
        "cancel" => {
            let text = if db::clear_draft(&app.pool, user_id).await? {
                "Broadcast cancelled."
            } else {
                "Nothing to cancel."
            };
            reply(app, chat_id, text).await;
        }
        "topics" => list_topics(app, chat_id).await?,
        "topic_add" => topic_add(app, chat_id, args).await?,
        "topic_rename" => topic_rename(app, chat_id, args).await?,
        "topic_id" => topic_set_id(app, chat_id, args).await?,
        "topic_del" => {
            let text = if args.is_empty() {
                "Usage: /topic_del <name>".to_string()
            } else if app.topics.delete(args).await? {
                format!("Topic {} deleted.", args)
            } else {
                format!("No topic named {}.", args)
            };
            reply(app, chat_id, &text).await;
        }
        "history" => show_history(app, chat_id, args).await?,
        "stats" => show_stats(app, chat_id).await?,
        _ => reply(app, chat_id, "Unknown command. Send /help for the list.").await,
    }
    Ok(())
}

async fn handle_text(app: &App, user_id: i64, chat_id: i64, text: &str) -> Result<()> {
    let Some(draft) = db::load_draft(&app.pool, user_id).await? else {
        reply(app, chat_id, NO_DRAFT).await;
        return Ok(());
    };
    match draft.state {
        DraftState::AwaitingText => {
            db::set_draft_text(&app.pool, user_id, text).await?;
            reply(app, chat_id, DraftState::AwaitingButton.prompt()).await;
        }
        DraftState::AwaitingButton => match parse_button(text) {
            Some(button) => {
                db::set_draft_button(&app.pool, user_id, Some(&button)).await?;
                reply(app, chat_id, DraftState::AwaitingMedia.prompt()).await;
            }
            None => {
                reply(
                    app,
                    chat_id,
                    "That is not a valid button. Use `Label | https://link`, or /skip.",
                )
                .await;
            }
        },
        state => reply(app, chat_id, state.prompt()).await,
    }
    Ok(())
}

async fn skip_step(app: &App, user_id: i64, chat_id: i64) -> Result<()> {
    let Some(draft) = db::load_draft(&app.pool, user_id).await? else {
        reply(app, chat_id, NO_DRAFT).await;
        return Ok(());
    };
    match draft.state {
        DraftState::AwaitingText => {
            db::set_draft_text(&app.pool, user_id, "").await?;
            reply(app, chat_id, DraftState::AwaitingButton.prompt()).await;
        }
        DraftState::AwaitingButton => {
            db::set_draft_button(&app.pool, user_id, None).await?;
            reply(app, chat_id, DraftState::AwaitingMedia.prompt()).await;
        }
        DraftState::AwaitingMedia => {
            if draft.text.trim().is_empty() {
                reply(
                    app,
                    chat_id,
                    "A broadcast without text needs media. Send a photo, a video or an album.",
                )
                .await;
                return Ok(());
            }
            db::set_draft_media(&app.pool, user_id, &Media::None).await?;
            preview(app, chat_id, &draft.payload_with(Media::None)).await;
        }
        DraftState::AwaitingConfirmation => reply(app, chat_id, CONFIRM_PROMPT).await,
    }
    Ok(())
}

async fn handle_single_media(app: &App, user_id: i64, chat_id: i64, item: MediaItem) -> Result<()> {
    let Some(draft) = db::load_draft(&app.pool, user_id).await? else {
        reply(app, chat_id, NO_DRAFT).await;
        return Ok(());
    };
    if !draft.state.accepts_media() {
        reply(app, chat_id, draft.state.prompt()).await;
        return Ok(());
    }
    let media = Media::from(item);
    db::set_draft_media(&app.pool, user_id, &media).await?;
    debug!(user_id, media = %media.describe(), "attached media to draft");
    preview(app, chat_id, &draft.payload_with(media)).await;
    Ok(())
}

async fn preview(app: &App, chat_id: i64, payload: &BroadcastPayload) {
    let text = match app
        .dispatcher
        .send_one(payload, Destination::chat(chat_id))
        .await
    {
        Ok(()) => format!("Preview above. {}", CONFIRM_PROMPT),
        Err(err) => {
            warn!(error = %err, "preview failed");
            format!("Could not preview the broadcast: {}.", err.operator_hint())
        }
    };
    reply(app, chat_id, &text).await;
}

#[instrument(skip(app, scope), fields(scope = %scope.tag()))]
async fn send_broadcast(app: &App, user_id: i64, chat_id: i64, scope: TargetScope) -> Result<()> {
    let Some(draft) = db::load_draft(&app.pool, user_id).await? else {
        reply(app, chat_id, NO_DRAFT).await;
        return Ok(());
    };
    if draft.state != DraftState::AwaitingConfirmation {
        let text = format!("The broadcast is not ready yet. {}", draft.state.prompt());
        reply(app, chat_id, &text).await;
        return Ok(());
    }
    let payload = draft.payload();
    if payload.is_empty() {
        reply(app, chat_id, "The broadcast is empty. Send /broadcast to start over.").await;
        return Ok(());
    }
    // Record the topic under its registered spelling.
    let scope = match scope {
        TargetScope::Topic(name) => match app.topics.find(&name).await? {
            Some(topic) => TargetScope::Topic(topic.name),
            None => {
                let text = format!("No topic named {}. Send /topics for the list.", name);
                reply(app, chat_id, &text).await;
                return Ok(());
            }
        },
        other => other,
    };

    let set = app.topics.destinations(&scope).await?;
    let outcome = app.dispatcher.send_all(&payload, &set).await;
    let status = outcome.status();
    let tag = scope.tag();
    let record_id = db::create_broadcast(
        &app.pool,
        &NewBroadcast {
            user_id,
            text: &payload.text,
            button_label: payload.button.as_ref().map(|b| b.label.as_str()),
            button_url: payload.button.as_ref().map(|b| b.url.as_str()),
            media: &payload.media,
            status,
            target_scope: &tag,
            attempted: outcome.attempted as i64,
            failed: outcome.failed() as i64,
        },
    )
    .await?;
    db::clear_draft(&app.pool, user_id).await?;
    info!(
        record_id,
        status = status.as_str(),
        attempted = outcome.attempted,
        failed = outcome.failed(),
        "broadcast recorded"
    );
    reply(app, chat_id, &outcome.summary()).await;
    Ok(())
}

async fn list_topics(app: &App, chat_id: i64) -> Result<()> {
    let topics = app.topics.topics().await?;
    let text = if topics.is_empty() {
        "No topics yet. Add one with /topic_add <thread_id> <name>.".to_string()
    } else {
        let mut out = String::from("Topics:");
        for topic in &topics {
            out.push_str(&format!("\n- {} (thread {})", topic.name, topic.thread_id));
        }
        out
    };
    reply(app, chat_id, &text).await;
    Ok(())
}

async fn topic_add(app: &App, chat_id: i64, args: &str) -> Result<()> {
    let parsed = args
        .split_once(char::is_whitespace)
        .and_then(|(id, name)| Some((id.parse::<i32>().ok()?, name.trim())))
        .filter(|(_, name)| !name.is_empty());
    let Some((thread_id, name)) = parsed else {
        reply(app, chat_id, "Usage: /topic_add <thread_id> <name>").await;
        return Ok(());
    };
    if app.topics.find(name).await?.is_some() {
        reply(app, chat_id, &format!("Topic {} already exists.", name)).await;
        return Ok(());
    }
    app.topics.create(name, thread_id).await?;
    let text = format!("Topic {} added with thread {}.", name, thread_id);
    reply(app, chat_id, &text).await;
    Ok(())
}

async fn topic_rename(app: &App, chat_id: i64, args: &str) -> Result<()> {
    let parsed = args
        .split_once('|')
        .map(|(old, new)| (old.trim(), new.trim()))
        .filter(|(old, new)| !old.is_empty() && !new.is_empty());
    let Some((old_name, new_name)) = parsed else {
        reply(app, chat_id, "Usage: /topic_rename <old> | <new>").await;
        return Ok(());
    };
    let text = if app.topics.rename(old_name, new_name).await? {
        format!("Topic {} renamed to {}.", old_name, new_name)
    } else {
        format!("No topic named {}.", old_name)
    };
    reply(app, chat_id, &text).await;
    Ok(())
}

async fn topic_set_id(app: &App, chat_id: i64, args: &str) -> Result<()> {
    let parsed = args
        .rsplit_once(char::is_whitespace)
        .and_then(|(name, id)| Some((name.trim(), id.parse::<i32>().ok()?)))
        .filter(|(name, _)| !name.is_empty());
    let Some((name, thread_id)) = parsed else {
        reply(app, chat_id, "Usage: /topic_id <name> <thread_id>").await;
        return Ok(());
    };
    let text = if app.topics.set_thread_id(name, thread_id).await? {
        format!("Topic {} now uses thread {}.", name, thread_id)
    } else {
        format!("No topic named {}.", name)
    };
    reply(app, chat_id, &text).await;
    Ok(())
}

fn short(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= max && !text.contains('\n') {
        return line.to_string();
    }
    let cut: String = line.chars().take(max).collect();
    format!("{}…", cut)
}

async fn show_history(app: &App, chat_id: i64, args: &str) -> Result<()> {
    let page = match args {
        "" => 1,
        raw => match raw.parse::<u32>() {
            Ok(p) if p > 0 => p,
            _ => {
                reply(app, chat_id, "Usage: /history [page]").await;
                return Ok(());
            }
        },
    };
    let total = db::count_broadcasts(&app.pool, None).await?;
    let pages = ((total + i64::from(HISTORY_PAGE_SIZE) - 1) / i64::from(HISTORY_PAGE_SIZE)).max(1);
    let records = db::list_broadcasts(
        &app.pool,
        &HistoryQuery {
            page,
            per_page: HISTORY_PAGE_SIZE,
            ..Default::default()
        },
    )
    .await?;

    let text = if total == 0 {
        "No broadcasts yet.".to_string()
    } else if records.is_empty() {
        format!("Page {} is empty, history has {} page(s).", page, pages)
    } else {
        let mut out = format!("Broadcasts (page {}/{}, {} total):", page, pages, total);
        for rec in &records {
            out.push_str(&format!(
                "\n#{} {} {} {}/{} {} [{}] {}",
                rec.id,
                rec.created_at.format("%Y-%m-%d %H:%M"),
                rec.status.as_str(),
                rec.attempted - rec.failed,
                rec.attempted,
                rec.target_scope,
                rec.media.describe(),
                short(&rec.text, 40)
            ));
        }
        out
    };
    reply(app, chat_id, &text).await;
    Ok(())
}

async fn show_stats(app: &App, chat_id: i64) -> Result<()> {
    let stats = db::broadcast_stats(&app.pool).await?;
    let text = format!(
        "Broadcasts: {} total, {} sent, {} partial, {} failed.\nTargets: {} attempted, {} failed.",
        stats.total,
        stats.sent,
        stats.partial,
        stats.failed,
        stats.targets_attempted,
        stats.targets_failed
    );
    reply(app, chat_id, &text).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDrafts;
    use crate::media_group::MediaGroupBuffer;
    use crate::model::BroadcastStatus;
    use crate::transport::recording::{Call, RecordingTransport};
    use crate::transport::SendError;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;

    const OPERATOR_CHAT: i64 = 42;
    const GROUP: i64 = -100777;

    async fn setup() -> (Arc<RecordingTransport>, App, i64) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let user_id = db::get_or_create_user(&pool, 42, Some("op"), None)
            .await
            .unwrap();

        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Dispatcher::new(transport.clone());
        let aggregator = MediaGroupAggregator::new(
            MediaGroupBuffer::new(),
            Arc::new(SqliteDrafts::new(pool.clone())),
            dispatcher.clone(),
            Duration::from_millis(50),
        );
        let app = App {
            topics: Arc::new(TopicRegistry::new(pool.clone(), GROUP, Duration::from_secs(300))),
            pool,
            dispatcher,
            aggregator,
            allowed_users: Arc::new(vec![42]),
        };
        (transport, app, user_id)
    }

    async fn send(app: &App, user_id: i64, text: &str) {
        handle_inbound(app, user_id, OPERATOR_CHAT, parse_text(text))
            .await
            .unwrap();
    }

    async fn last_reply(transport: &RecordingTransport) -> String {
        transport
            .calls()
            .await
            .into_iter()
            .rev()
            .find_map(|c| match c {
                Call::Text { dest, text, .. } if dest.chat_id == OPERATOR_CHAT => Some(text),
                _ => None,
            })
            .unwrap()
    }

    async fn group_calls(transport: &RecordingTransport) -> Vec<Call> {
        transport
            .calls()
            .await
            .into_iter()
            .filter(|c| match c {
                Call::Text { dest, .. }
                | Call::Photo { dest, .. }
                | Call::Video { dest, .. }
                | Call::MediaGroup { dest, .. } => dest.chat_id == GROUP,
            })
            .collect()
    }

    #[test]
    fn commands_are_parsed_with_bot_suffix_and_args() {
        assert_eq!(
            parse_text("/send_topic@DealerBot  SUV deals "),
            Inbound::Command {
                name: "send_topic".into(),
                args: "SUV deals".into()
            }
        );
        assert_eq!(
            parse_text("/Stats"),
            Inbound::Command {
                name: "stats".into(),
                args: String::new()
            }
        );
        assert_eq!(parse_text("New arrivals"), Inbound::Text("New arrivals".into()));
    }

    #[test]
    fn button_needs_label_and_http_link() {
        assert_eq!(
            parse_button("Book a test drive | https://dealer.example/td"),
            Some(Button {
                label: "Book a test drive".into(),
                url: "https://dealer.example/td".into(),
            })
        );
        assert!(parse_button("no link here").is_none());
        assert!(parse_button(" | https://dealer.example").is_none());
        assert!(parse_button("Call | tel:+123").is_none());
        assert!(parse_button("Open | not a url").is_none());
    }

    #[tokio::test]
    async fn compose_single_photo_and_send_to_all_targets() {
        let (transport, app, uid) = setup().await;
        app.topics.create("SUV", 11).await.unwrap();
        app.topics.create("Trucks", 12).await.unwrap();

        send(&app, uid, "/broadcast").await;
        send(&app, uid, "Spring sale on all models").await;
        send(&app, uid, "Details | https://dealer.example/sale").await;
        handle_inbound(
            &app,
            uid,
            OPERATOR_CHAT,
            Inbound::Media {
                item: MediaItem::photo("photo-1"),
                group_id: None,
            },
        )
        .await
        .unwrap();
        assert!(last_reply(&transport).await.starts_with("Preview above."));

        send(&app, uid, "/send_all").await;
        let calls = group_calls(&transport).await;
        let threads: Vec<Option<i32>> = calls
            .iter()
            .map(|c| match c {
                Call::Photo { dest, caption, .. } => {
                    assert_eq!(caption.as_deref(), Some("Spring sale on all models"));
                    dest.thread_id
                }
                other => panic!("unexpected call {:?}", other),
            })
            .collect();
        assert_eq!(threads, vec![None, Some(11), Some(12)]);
        assert_eq!(
            last_reply(&transport).await,
            "Broadcast delivered to 3/3 targets."
        );

        assert!(db::load_draft(&app.pool, uid).await.unwrap().is_none());
        let history = db::list_broadcasts(&app.pool, &HistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, BroadcastStatus::Sent);
        assert_eq!(history[0].target_scope, "all");
        assert_eq!(history[0].button_url.as_deref(), Some("https://dealer.example/sale"));
    }

    #[tokio::test]
    async fn album_is_collected_then_sent_to_one_topic() {
        let (transport, app, uid) = setup().await;
        app.topics.create("SUV", 11).await.unwrap();

        send(&app, uid, "/broadcast").await;
        send(&app, uid, "Three new SUVs").await;
        send(&app, uid, "/skip").await;
        for item in [
            Inbound::Media {
                item: MediaItem::photo("p1"),
                group_id: Some("album-1".into()),
            },
            Inbound::Unsupported {
                group_id: Some("album-1".into()),
            },
            Inbound::Media {
                item: MediaItem::video("doc:v1"),
                group_id: Some("album-1".into()),
            },
        ] {
            handle_inbound(&app, uid, OPERATOR_CHAT, item).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let draft = db::load_draft(&app.pool, uid).await.unwrap().unwrap();
        assert_eq!(draft.state, DraftState::AwaitingConfirmation);
        assert_eq!(
            draft.media,
            Media::Group {
                items: vec![MediaItem::photo("p1"), MediaItem::video("doc:v1")]
            }
        );
        assert!(last_reply(&transport).await.starts_with("Album of 2 item(s) received."));

        send(&app, uid, "/send_topic suv").await;
        assert_eq!(
            group_calls(&transport).await,
            vec![
                Call::MediaGroup {
                    dest: Destination::topic(GROUP, 11),
                    items: vec![MediaItem::photo("p1"), MediaItem::video("v1")],
                },
                Call::Text {
                    dest: Destination::topic(GROUP, 11),
                    text: "Three new SUVs".into(),
                    button: None,
                },
            ]
        );
        let history = db::list_broadcasts(&app.pool, &HistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(history[0].target_scope, "topic:SUV");
    }

    #[tokio::test]
    async fn failing_topic_records_partial_broadcast() {
        let (transport, app, uid) = setup().await;
        app.topics.create("SUV", 11).await.unwrap();
        app.topics.create("Trucks", 12).await.unwrap();
        transport
            .fail_thread(Some(12), SendError::ThreadNotFound("thread not found".into()))
            .await;

        send(&app, uid, "/broadcast").await;
        send(&app, uid, "Text only").await;
        send(&app, uid, "/skip").await;
        send(&app, uid, "/skip").await;
        send(&app, uid, "/send_all").await;

        let summary = last_reply(&transport).await;
        assert!(summary.starts_with("Broadcast delivered to 2/3 targets, 1 failed:"));
        assert!(summary.contains("Trucks: topic not found"));
        let stats = db::broadcast_stats(&app.pool).await.unwrap();
        assert_eq!(stats.partial, 1);
        assert_eq!(stats.targets_failed, 1);

        send(&app, uid, "/stats").await;
        assert_eq!(
            last_reply(&transport).await,
            "Broadcasts: 1 total, 0 sent, 1 partial, 0 failed.\nTargets: 3 attempted, 1 failed."
        );
        send(&app, uid, "/history").await;
        let history = last_reply(&transport).await;
        assert!(history.starts_with("Broadcasts (page 1/1, 1 total):"));
        assert!(history.contains("partial 2/3 all [no media] Text only"));
    }

    #[tokio::test]
    async fn send_is_refused_until_the_draft_is_ready() {
        let (transport, app, uid) = setup().await;
        send(&app, uid, "/send_all").await;
        assert_eq!(last_reply(&transport).await, NO_DRAFT);

        send(&app, uid, "/broadcast").await;
        send(&app, uid, "/send_general").await;
        assert!(last_reply(&transport)
            .await
            .starts_with("The broadcast is not ready yet."));

        send(&app, uid, "/skip").await;
        send(&app, uid, "/skip").await;
        send(&app, uid, "/skip").await;
        assert!(last_reply(&transport)
            .await
            .starts_with("A broadcast without text needs media."));

        send(&app, uid, "/cancel").await;
        assert_eq!(last_reply(&transport).await, "Broadcast cancelled.");
        assert!(group_calls(&transport).await.is_empty());
    }

    #[tokio::test]
    async fn unknown_topic_is_reported_without_sending() {
        let (transport, app, uid) = setup().await;
        send(&app, uid, "/broadcast").await;
        send(&app, uid, "Hello").await;
        send(&app, uid, "/skip").await;
        send(&app, uid, "/skip").await;
        send(&app, uid, "/send_topic Vans").await;
        assert_eq!(
            last_reply(&transport).await,
            "No topic named Vans. Send /topics for the list."
        );
        assert!(group_calls(&transport).await.is_empty());
        assert!(db::load_draft(&app.pool, uid).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn topic_management_commands() {
        let (transport, app, uid) = setup().await;
        send(&app, uid, "/topics").await;
        assert!(last_reply(&transport).await.starts_with("No topics yet."));

        send(&app, uid, "/topic_add 11 Used cars").await;
        assert_eq!(
            last_reply(&transport).await,
            "Topic Used cars added with thread 11."
        );
        send(&app, uid, "/topic_add 12 Used cars").await;
        assert_eq!(last_reply(&transport).await, "Topic Used cars already exists.");
        send(&app, uid, "/topic_add eleven Vans").await;
        assert_eq!(
            last_reply(&transport).await,
            "Usage: /topic_add <thread_id> <name>"
        );

        send(&app, uid, "/topic_rename Used cars | Certified").await;
        send(&app, uid, "/topic_id Certified 21").await;
        send(&app, uid, "/topics").await;
        assert_eq!(last_reply(&transport).await, "Topics:\n- Certified (thread 21)");

        send(&app, uid, "/topic_del Certified").await;
        assert_eq!(last_reply(&transport).await, "Topic Certified deleted.");
        send(&app, uid, "/topic_del Certified").await;
        assert_eq!(last_reply(&transport).await, "No topic named Certified.");
    }

    #[tokio::test]
    async fn topic_names_ignore_case_in_every_command() {
        let (transport, app, uid) = setup().await;
        send(&app, uid, "/topic_add 11 SUV").await;
        send(&app, uid, "/topic_add 12 suv").await;
        assert_eq!(last_reply(&transport).await, "Topic suv already exists.");

        send(&app, uid, "/topic_id suv 13").await;
        send(&app, uid, "/topics").await;
        assert_eq!(last_reply(&transport).await, "Topics:\n- SUV (thread 13)");

        send(&app, uid, "/topic_del suv").await;
        assert_eq!(last_reply(&transport).await, "Topic suv deleted.");
        assert!(app.topics.topics().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn album_before_the_media_step_leaves_the_draft_alone() {
        let (transport, app, uid) = setup().await;
        send(&app, uid, "/broadcast").await;
        let album_item = Inbound::Media {
            item: MediaItem::photo("early"),
            group_id: Some("g".into()),
        };
        handle_inbound(&app, uid, OPERATOR_CHAT, album_item).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let draft = db::load_draft(&app.pool, uid).await.unwrap().unwrap();
        assert_eq!(draft.state, DraftState::AwaitingText);
        assert_eq!(draft.media, Media::None);
        assert_eq!(
            last_reply(&transport).await,
            format!("Album of 1 item(s) ignored. {}", DraftState::AwaitingText.prompt())
        );
        assert!(!transport
            .calls()
            .await
            .iter()
            .any(|c| matches!(c, Call::MediaGroup { .. })));
    }

    #[tokio::test]
    async fn only_listed_operators_are_allowed() {
        let (_transport, app, _uid) = setup().await;
        assert!(app.is_allowed(42));
        assert!(!app.is_allowed(43));
    }

    #[test]
    fn history_text_is_shortened_to_first_line() {
        assert_eq!(short("Short", 40), "Short");
        assert_eq!(short("Line one\nLine two", 40), "Line one…");
        assert_eq!(short("abcdef", 3), "abc…");
    }
}
