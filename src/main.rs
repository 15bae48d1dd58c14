use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use teloxide::prelude::*;
use tg_broadcastbot::config;
use tg_broadcastbot::db::{self, SqliteDrafts};
use tg_broadcastbot::dispatch::Dispatcher;
use tg_broadcastbot::handlers::{self, App};
use tg_broadcastbot::media_group::{MediaGroupAggregator, MediaGroupBuffer};
use tg_broadcastbot::reaper::{Reaper, ReaperSettings};
use tg_broadcastbot::topics::TopicRegistry;
use tg_broadcastbot::transport::TelegramTransport;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let bot = Bot::new(cfg.telegram.bot_token.clone());
    let dispatcher = Dispatcher::new(Arc::new(TelegramTransport::new(bot.clone())));
    let buffer = MediaGroupBuffer::new();
    let aggregator = MediaGroupAggregator::new(
        buffer.clone(),
        Arc::new(SqliteDrafts::new(pool.clone())),
        dispatcher.clone(),
        cfg.media_group_delay(),
    );
    let topics = Arc::new(TopicRegistry::new(
        pool.clone(),
        cfg.broadcast.group_chat_id,
        cfg.topic_cache_ttl(),
    ));

    let reaper = Reaper::new(buffer, ReaperSettings::from(&cfg.reaper));
    reaper.start();

    let app = App {
        pool,
        dispatcher,
        aggregator: aggregator.clone(),
        topics,
        allowed_users: Arc::new(cfg.telegram.allowed_users.clone()),
    };

    info!(
        group_chat_id = cfg.broadcast.group_chat_id,
        operators = cfg.telegram.allowed_users.len(),
        "starting telegram bot"
    );
    teloxide::repl(bot, move |_bot: Bot, msg: Message| {
        let app = app.clone();
        async move {
            if let Err(err) = handlers::handle_update(&app, &msg).await {
                error!(?err, "failed to handle update");
            }
            respond(())
        }
    })
    .await;

    info!("bot stopped, flushing pending albums");
    aggregator.drain().await;
    reaper.stop();
    Ok(())
}
