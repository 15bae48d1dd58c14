use super::model::{BroadcastRecord, BroadcastStats, HistoryQuery, NewBroadcast, SortOrder, Topic};
use crate::model::{BroadcastStatus, Button, Draft, DraftState, Media};
use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys=ON;").execute(&pool).await?;
    Ok(pool)
}

/// Normalize a file-backed SQLite URL: expand a leading `~/`, create the
/// parent directory and ask sqlx to create the file. In-memory and
/// non-sqlite URLs pass through unchanged.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{}?{}", path, q),
        None => format!("sqlite://{}?mode=rwc", path),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_or_create_user(
    pool: &Pool,
    tg_user_id: i64,
    username: Option<&str>,
    full_name: Option<&str>,
) -> Result<i64> {
    if let Some(id) = sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE tg_user_id = ?")
        .bind(tg_user_id)
        .fetch_optional(pool)
        .await?
    {
        return Ok(id);
    }

    let rec = sqlx::query(
        "INSERT INTO users (tg_user_id, username, full_name) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(tg_user_id)
    .bind(username)
    .bind(full_name)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

// ---- drafts ----------------------------------------------------------------

/// Start a fresh draft for `user_id`, discarding any previous one.
#[instrument(skip_all)]
pub async fn start_draft(pool: &Pool, user_id: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO drafts (user_id, state) VALUES (?, ?) \
         ON CONFLICT(user_id) DO UPDATE SET state = excluded.state, text = '', \
         button_label = NULL, button_url = NULL, media = '{\"kind\":\"none\"}', \
         updated_at = CURRENT_TIMESTAMP",
    )
    .bind(user_id)
    .bind(DraftState::AwaitingText.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn load_draft(pool: &Pool, user_id: i64) -> Result<Option<Draft>> {
    let row = sqlx::query(
        "SELECT user_id, state, text, button_label, button_url, media FROM drafts WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let state_str: String = row.get("state");
    let state = DraftState::parse_state(&state_str)
        .ok_or_else(|| anyhow!("draft of user {} has unknown state {}", user_id, state_str))?;
    let label: Option<String> = row.get("button_label");
    let url: Option<String> = row.get("button_url");
    let button = match (label, url) {
        (Some(label), Some(url)) => Some(Button { label, url }),
        _ => None,
    };
    let media_raw: String = row.get("media");
    let media: Media = serde_json::from_str(&media_raw)
        .with_context(|| format!("draft of user {} has invalid media", user_id))?;

    Ok(Some(Draft {
        user_id,
        state,
        text: row.get("text"),
        button,
        media,
    }))
}

async fn update_draft(pool: &Pool, user_id: i64, sql: &str, binds: &[Option<&str>]) -> Result<()> {
    let mut query = sqlx::query(sql);
    for value in binds {
        query = query.bind(*value);
    }
    let res = query.bind(user_id).execute(pool).await?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("no active draft for user {}", user_id));
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_draft_text(pool: &Pool, user_id: i64, text: &str) -> Result<()> {
    update_draft(
        pool,
        user_id,
        "UPDATE drafts SET text = ?, state = ?, updated_at = CURRENT_TIMESTAMP WHERE user_id = ?",
        &[Some(text), Some(DraftState::AwaitingButton.as_str())],
    )
    .await
}

#[instrument(skip_all)]
pub async fn set_draft_button(pool: &Pool, user_id: i64, button: Option<&Button>) -> Result<()> {
    update_draft(
        pool,
        user_id,
        "UPDATE drafts SET button_label = ?, button_url = ?, state = ?, \
         updated_at = CURRENT_TIMESTAMP WHERE user_id = ?",
        &[
            button.map(|b| b.label.as_str()),
            button.map(|b| b.url.as_str()),
            Some(DraftState::AwaitingMedia.as_str()),
        ],
    )
    .await
}

/// Attach media and move the draft to confirmation.
#[instrument(skip_all)]
pub async fn set_draft_media(pool: &Pool, user_id: i64, media: &Media) -> Result<()> {
    let raw = serde_json::to_string(media)?;
    update_draft(
        pool,
        user_id,
        "UPDATE drafts SET media = ?, state = ?, updated_at = CURRENT_TIMESTAMP WHERE user_id = ?",
        &[Some(raw.as_str()), Some(DraftState::AwaitingConfirmation.as_str())],
    )
    .await
}

/// Attach a finalized album, but only while the draft is at the media step or
/// already awaiting confirmation. Returns `false` when no draft accepted it.
#[instrument(skip_all)]
pub async fn attach_album(pool: &Pool, user_id: i64, media: &Media) -> Result<bool> {
    let raw = serde_json::to_string(media)?;
    let res = sqlx::query(
        "UPDATE drafts SET media = ?, state = ?, updated_at = CURRENT_TIMESTAMP \
         WHERE user_id = ? AND state IN (?, ?)",
    )
    .bind(raw)
    .bind(DraftState::AwaitingConfirmation.as_str())
    .bind(user_id)
    .bind(DraftState::AwaitingMedia.as_str())
    .bind(DraftState::AwaitingConfirmation.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn clear_draft(pool: &Pool, user_id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM drafts WHERE user_id = ?")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

// ---- topics ----------------------------------------------------------------

fn topic_from_row(row: &SqliteRow) -> Topic {
    Topic {
        id: row.get("id"),
        name: row.get("name"),
        thread_id: row.get("thread_id"),
    }
}

/// All topics in creation order.
#[instrument(skip_all)]
pub async fn list_topics(pool: &Pool) -> Result<Vec<Topic>> {
    let rows = sqlx::query("SELECT id, name, thread_id FROM topics ORDER BY id ASC")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(topic_from_row).collect())
}

#[instrument(skip_all)]
pub async fn create_topic(pool: &Pool, name: &str, thread_id: i32) -> Result<i64> {
    let id: i64 =
        sqlx::query_scalar("INSERT INTO topics (name, thread_id) VALUES (?, ?) RETURNING id")
            .bind(name)
            .bind(thread_id)
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to create topic {}", name))?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn rename_topic(pool: &Pool, old_name: &str, new_name: &str) -> Result<bool> {
    let res = sqlx::query("UPDATE topics SET name = ? WHERE name = ?")
        .bind(new_name)
        .bind(old_name)
        .execute(pool)
        .await
        .with_context(|| format!("failed to rename topic {}", old_name))?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn set_topic_thread_id(pool: &Pool, name: &str, thread_id: i32) -> Result<bool> {
    let res = sqlx::query("UPDATE topics SET thread_id = ? WHERE name = ?")
        .bind(thread_id)
        .bind(name)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn delete_topic(pool: &Pool, name: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM topics WHERE name = ?")
        .bind(name)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

// ---- broadcast history -----------------------------------------------------

#[instrument(skip_all)]
pub async fn create_broadcast(pool: &Pool, new: &NewBroadcast<'_>) -> Result<i64> {
    let media = serde_json::to_string(new.media)?;
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO broadcasts (user_id, text, button_label, button_url, media, status, \
         target_scope, attempted, failed) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(new.user_id)
    .bind(new.text)
    .bind(new.button_label)
    .bind(new.button_url)
    .bind(media)
    .bind(new.status.as_str())
    .bind(new.target_scope)
    .bind(new.attempted)
    .bind(new.failed)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

fn broadcast_from_row(row: &SqliteRow) -> Result<BroadcastRecord> {
    let id: i64 = row.get("id");
    let status_str: String = row.get("status");
    let status = BroadcastStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("broadcast {} has unknown status {}", id, status_str))?;
    let media_raw: String = row.get("media");
    let media = serde_json::from_str(&media_raw)
        .with_context(|| format!("broadcast {} has invalid media", id))?;
    Ok(BroadcastRecord {
        id,
        user_id: row.get("user_id"),
        text: row.get("text"),
        button_label: row.get("button_label"),
        button_url: row.get("button_url"),
        media,
        status,
        target_scope: row.get("target_scope"),
        attempted: row.get("attempted"),
        failed: row.get("failed"),
        created_at: row.get("created_at"),
    })
}

#[instrument(skip_all)]
pub async fn list_broadcasts(pool: &Pool, query: &HistoryQuery) -> Result<Vec<BroadcastRecord>> {
    let order = match query.order {
        SortOrder::NewestFirst => "DESC",
        SortOrder::OldestFirst => "ASC",
    };
    let sql = format!(
        "SELECT id, user_id, text, button_label, button_url, media, status, target_scope, \
         attempted, failed, created_at FROM broadcasts \
         WHERE (?1 IS NULL OR status = ?1) ORDER BY id {} LIMIT ?2 OFFSET ?3",
        order
    );
    let per_page = i64::from(query.per_page.max(1));
    let offset = i64::from(query.page.max(1) - 1) * per_page;
    let rows = sqlx::query(&sql)
        .bind(query.status.map(|s| s.as_str()))
        .bind(per_page)
        .bind(offset)
        .fetch_all(pool)
        .await?;
    rows.iter().map(broadcast_from_row).collect()
}

#[instrument(skip_all)]
pub async fn count_broadcasts(pool: &Pool, status: Option<BroadcastStatus>) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM broadcasts WHERE (?1 IS NULL OR status = ?1)")
            .bind(status.map(|s| s.as_str()))
            .fetch_one(pool)
            .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn broadcast_stats(pool: &Pool) -> Result<BroadcastStats> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS total, \
         COALESCE(SUM(CASE WHEN status = 'sent' THEN 1 ELSE 0 END), 0) AS sent, \
         COALESCE(SUM(CASE WHEN status = 'partial' THEN 1 ELSE 0 END), 0) AS partial, \
         COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed, \
         COALESCE(SUM(attempted), 0) AS targets_attempted, \
         COALESCE(SUM(failed), 0) AS targets_failed \
         FROM broadcasts",
    )
    .fetch_one(pool)
    .await?;
    Ok(BroadcastStats {
        total: row.get("total"),
        sent: row.get("sent"),
        partial: row.get("partial"),
        failed: row.get("failed"),
        targets_attempted: row.get("targets_attempted"),
        targets_failed: row.get("targets_failed"),
    })
}
