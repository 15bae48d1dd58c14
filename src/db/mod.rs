//! Database module: row models and SQL repositories.
//!
//! - `model`: typed rows and query parameters returned by repositories.
//! - `repo`: SQL-only functions that map rows into those types.
//!
//! Callers import from `tg_broadcastbot::db`; the repository API and models
//! are re-exported here.

pub mod model;
pub mod repo;

pub use model::{BroadcastRecord, BroadcastStats, HistoryQuery, NewBroadcast, SortOrder, Topic};
pub use repo::*;

use crate::media_group::DraftStore;
use crate::model::{Draft, Media};
use anyhow::Result;
use async_trait::async_trait;

/// [`DraftStore`] over the `drafts` table.
#[derive(Clone)]
pub struct SqliteDrafts {
    pool: Pool,
}

impl SqliteDrafts {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DraftStore for SqliteDrafts {
    async fn load(&self, user_id: i64) -> Result<Option<Draft>> {
        load_draft(&self.pool, user_id).await
    }

    async fn attach_media(&self, user_id: i64, media: &Media) -> Result<bool> {
        attach_album(&self.pool, user_id, media).await
    }
}
