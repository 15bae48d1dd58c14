use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tg_broadcastbot::config::{self, Config};
use tg_broadcastbot::db::{self, HistoryQuery, SortOrder};
use tg_broadcastbot::model::BroadcastStatus;

#[derive(Debug, Parser)]
#[command(about = "Print the broadcast history or delivery statistics from the bot database.")]
struct Args {
    /// Path to YAML config file (reads `app.data_dir`; DATABASE_URL wins when set)
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// 1-based page number
    #[arg(long, default_value_t = 1)]
    page: u32,

    #[arg(long, default_value_t = 20)]
    per_page: u32,

    /// Only show broadcasts with this status: sent, partial or failed
    #[arg(long, value_parser = parse_status)]
    status: Option<BroadcastStatus>,

    /// List oldest broadcasts first
    #[arg(long)]
    oldest_first: bool,

    /// Print aggregate statistics instead of the history
    #[arg(long)]
    stats: bool,
}

fn parse_status(raw: &str) -> Result<BroadcastStatus, String> {
    BroadcastStatus::parse_status(raw)
        .ok_or_else(|| format!("unknown status {}, expected sent, partial or failed", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    run(&cfg, &args).await
}

async fn run(cfg: &Config, args: &Args) -> Result<()> {
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    if args.stats {
        let stats = db::broadcast_stats(&pool).await?;
        println!("broadcasts: {}", stats.total);
        println!("  sent:     {}", stats.sent);
        println!("  partial:  {}", stats.partial);
        println!("  failed:   {}", stats.failed);
        println!("targets attempted: {}", stats.targets_attempted);
        println!("targets failed:    {}", stats.targets_failed);
        return Ok(());
    }

    let query = HistoryQuery {
        page: args.page.max(1),
        per_page: args.per_page.max(1),
        status: args.status,
        order: if args.oldest_first {
            SortOrder::OldestFirst
        } else {
            SortOrder::NewestFirst
        },
    };
    let total = db::count_broadcasts(&pool, args.status).await?;
    let records = db::list_broadcasts(&pool, &query).await?;
    let pages = ((total + i64::from(query.per_page) - 1) / i64::from(query.per_page)).max(1);
    println!("page {}/{} ({} broadcasts)", query.page, pages, total);
    for rec in records {
        let button = match (&rec.button_label, &rec.button_url) {
            (Some(label), Some(url)) => format!(" button=\"{}\" -> {}", label, url),
            _ => String::new(),
        };
        println!(
            "#{:<5} {} {:<7} {}/{} scope={} media={}{}",
            rec.id,
            rec.created_at.format("%Y-%m-%d %H:%M:%S"),
            rec.status.as_str(),
            rec.attempted - rec.failed,
            rec.attempted,
            rec.target_scope,
            rec.media.describe(),
            button
        );
        for line in rec.text.lines() {
            println!("        {}", line);
        }
    }
    Ok(())
}
