//! Row models returned by the repository.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! lives in higher layers.

use crate::model::{BroadcastStatus, Media};
use chrono::{DateTime, Utc};

/// Forum topic of the broadcast group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub id: i64,
    pub name: String,
    pub thread_id: i32,
}

/// Fields of a new broadcast history entry.
#[derive(Debug, Clone)]
pub struct NewBroadcast<'a> {
    pub user_id: i64,
    pub text: &'a str,
    pub button_label: Option<&'a str>,
    pub button_url: Option<&'a str>,
    pub media: &'a Media,
    pub status: BroadcastStatus,
    pub target_scope: &'a str,
    pub attempted: i64,
    pub failed: i64,
}

#[derive(Debug, Clone)]
pub struct BroadcastRecord {
    pub id: i64,
    pub user_id: i64,
    pub text: String,
    pub button_label: Option<String>,
    pub button_url: Option<String>,
    pub media: Media,
    pub status: BroadcastStatus,
    pub target_scope: String,
    pub attempted: i64,
    pub failed: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Page request for the broadcast history.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    /// 1-based page number.
    pub page: u32,
    pub per_page: u32,
    pub status: Option<BroadcastStatus>,
    pub order: SortOrder,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 10,
            status: None,
            order: SortOrder::NewestFirst,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub total: i64,
    pub sent: i64,
    pub partial: i64,
    pub failed: i64,
    pub targets_attempted: i64,
    pub targets_failed: i64,
}
