//! Album collection.
//!
//! Telegram delivers each photo or video of an album as its own message, tied
//! together only by `media_group_id`. [`MediaGroupAggregator`] buffers those
//! messages per `(operator, media_group_id)` and, a fixed delay after the
//! *first* item, finalizes the batch into the operator's draft and sends a
//! preview. The delay is not extended by later items, so worst-case latency is
//! bounded; a tail arriving after the deadline is not part of the album.

use crate::dispatch::Dispatcher;
use crate::model::{Draft, Media, MediaItem, CONFIRM_PROMPT, NO_DRAFT};
use crate::transport::Destination;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Conversation context the aggregator reads at finalize time.
#[async_trait]
pub trait DraftStore: Send + Sync {
    async fn load(&self, user_id: i64) -> Result<Option<Draft>>;

    /// Store `media` on the draft and move it to confirmation. Returns `false`
    /// when there is no draft at a step that accepts media.
    async fn attach_media(&self, user_id: i64, media: &Media) -> Result<bool>;
}

/// Buffer key. The operator id keeps equal `media_group_id`s from different
/// operators apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub user_id: i64,
    pub group_id: String,
}

impl GroupKey {
    pub fn new(user_id: i64, group_id: impl Into<String>) -> Self {
        Self {
            user_id,
            group_id: group_id.into(),
        }
    }
}

/// Who submitted an item and where their preview goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitter {
    pub user_id: i64,
    pub chat_id: i64,
}

/// One in-flight album.
#[derive(Debug)]
pub struct PendingBatch {
    pub id: Uuid,
    pub group_id: String,
    pub chat_id: i64,
    pub items: Vec<MediaItem>,
    pub created_at: Instant,
    timer: Option<JoinHandle<()>>,
}

impl PendingBatch {
    fn new(group_id: &str, chat_id: i64, first: MediaItem) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id: group_id.to_string(),
            chat_id,
            items: vec![first],
            created_at: Instant::now(),
            timer: None,
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Abort the finalize timer, if one is still scheduled.
    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    pub fn has_live_timer(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_finished())
    }
}

/// Shared store of in-flight albums. Cheap to clone; all clones see the same
/// entries. The lock is never held across an await.
#[derive(Clone, Default)]
pub struct MediaGroupBuffer {
    inner: Arc<Mutex<HashMap<GroupKey, PendingBatch>>>,
}

impl MediaGroupBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<GroupKey, PendingBatch>>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("media group buffer lock poisoned"))
    }

    /// Append `item` to the batch for `key`. When no batch exists one is
    /// created and `schedule` is called, under the same lock, to start its
    /// finalize timer. Returns `true` when a new batch was created.
    pub fn append_or_schedule<F>(
        &self,
        key: &GroupKey,
        chat_id: i64,
        item: MediaItem,
        schedule: F,
    ) -> Result<bool>
    where
        F: FnOnce() -> JoinHandle<()>,
    {
        let mut batches = self.lock()?;
        if let Some(batch) = batches.get_mut(key) {
            batch.items.push(item);
            return Ok(false);
        }
        let mut batch = PendingBatch::new(&key.group_id, chat_id, item);
        // The timer cannot take the batch before this guard is dropped.
        batch.timer = Some(schedule());
        batches.insert(key.clone(), batch);
        Ok(true)
    }

    /// Remove and return the batch for `key`.
    pub fn take(&self, key: &GroupKey) -> Result<Option<PendingBatch>> {
        Ok(self.lock()?.remove(key))
    }

    /// Remove every batch older than `retention`.
    pub fn evict_older_than(&self, retention: Duration) -> Result<Vec<(GroupKey, PendingBatch)>> {
        let mut batches = self.lock()?;
        let stale: Vec<GroupKey> = batches
            .iter()
            .filter(|(_, batch)| batch.age() > retention)
            .map(|(key, _)| key.clone())
            .collect();
        Ok(stale
            .into_iter()
            .filter_map(|key| batches.remove(&key).map(|batch| (key, batch)))
            .collect())
    }

    /// Remove and return every batch.
    pub fn drain(&self) -> Result<Vec<(GroupKey, PendingBatch)>> {
        Ok(self.lock()?.drain().collect())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &GroupKey) -> bool {
        self.lock().map(|b| b.contains_key(key)).unwrap_or(false)
    }

    pub fn items(&self, key: &GroupKey) -> Option<Vec<MediaItem>> {
        self.lock().ok()?.get(key).map(|b| b.items.clone())
    }

    pub fn has_live_timer(&self, key: &GroupKey) -> bool {
        self.lock()
            .ok()
            .and_then(|b| b.get(key).map(PendingBatch::has_live_timer))
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let inner = self.inner.clone();
        let _ = std::thread::spawn(move || {
            let _guard = inner.lock();
            panic!("poisoning media group buffer for a test");
        })
        .join();
    }
}

/// Collects album items and turns each completed album into a draft preview.
#[derive(Clone)]
pub struct MediaGroupAggregator {
    buffer: MediaGroupBuffer,
    drafts: Arc<dyn DraftStore>,
    dispatcher: Dispatcher,
    delay: Duration,
}

impl MediaGroupAggregator {
    pub fn new(
        buffer: MediaGroupBuffer,
        drafts: Arc<dyn DraftStore>,
        dispatcher: Dispatcher,
        delay: Duration,
    ) -> Self {
        Self {
            buffer,
            drafts,
            dispatcher,
            delay,
        }
    }

    pub fn buffer(&self) -> &MediaGroupBuffer {
        &self.buffer
    }

    /// Add one album item. `None` stands for an item type albums do not
    /// support and is dropped. Errors are logged, never returned.
    pub fn submit(&self, submitter: Submitter, group_id: &str, item: Option<MediaItem>) {
        let Some(item) = item else {
            debug!(user_id = submitter.user_id, group_id, "dropping unsupported album item");
            return;
        };
        let key = GroupKey::new(submitter.user_id, group_id);
        let delay = self.delay;
        let schedule = || {
            let this = self.clone();
            let timer_key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                this.finalize(&timer_key).await;
            })
        };
        match self
            .buffer
            .append_or_schedule(&key, submitter.chat_id, item, schedule)
        {
            Ok(true) => {
                debug!(user_id = submitter.user_id, group_id, ?delay, "scheduled album finalize")
            }
            Ok(false) => debug!(user_id = submitter.user_id, group_id, "appended album item"),
            Err(err) => {
                error!(?err, user_id = submitter.user_id, group_id, "failed to buffer album item")
            }
        }
    }

    /// Take the batch for `key` out of the buffer and deliver it. Returns
    /// `false` when the batch was already finalized or evicted.
    async fn finalize(&self, key: &GroupKey) -> bool {
        let batch = match self.buffer.take(key) {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                debug!(user_id = key.user_id, group_id = %key.group_id, "album already handled");
                return false;
            }
            Err(err) => {
                error!(?err, user_id = key.user_id, group_id = %key.group_id, "failed to take album");
                return false;
            }
        };
        self.deliver(key.user_id, batch).await;
        true
    }

    #[instrument(skip_all, fields(user_id = user_id, batch = %batch.id, group_id = %batch.group_id))]
    async fn deliver(&self, user_id: i64, batch: PendingBatch) {
        let dest = Destination::chat(batch.chat_id);
        let count = batch.items.len();
        let draft = match self.drafts.load(user_id).await {
            Ok(draft) => draft,
            Err(err) => {
                warn!(?err, "failed to load draft for album; using defaults");
                None
            }
        };
        if let Some(draft) = draft.as_ref().filter(|d| !d.state.accepts_media()) {
            info!(items = count, state = draft.state.as_str(), "album ignored at this draft step");
            let notice = format!("Album of {} item(s) ignored. {}", count, draft.state.prompt());
            self.notify(dest, &notice).await;
            return;
        }

        let media = Media::Group { items: batch.items };
        let attached = match &draft {
            Some(_) => match self.drafts.attach_media(user_id, &media).await {
                Ok(attached) => attached,
                Err(err) => {
                    warn!(?err, "failed to store album on draft");
                    false
                }
            },
            None => {
                warn!("no draft for album; using empty text and no button");
                false
            }
        };

        let payload = draft.unwrap_or_default().payload_with(media);
        let notice = match self.dispatcher.send_one(&payload, dest).await {
            Err(err) => {
                warn!(error = %err, "album preview failed");
                format!("Could not preview the album: {}.", err.operator_hint())
            }
            Ok(()) if attached => {
                info!(items = count, "album finalized");
                format!("Album of {} item(s) received. {}", count, CONFIRM_PROMPT)
            }
            Ok(()) => format!(
                "Album of {} item(s) received, but it is not part of a broadcast. {}",
                count, NO_DRAFT
            ),
        };
        self.notify(dest, &notice).await;
    }

    async fn notify(&self, dest: Destination, text: &str) {
        if let Err(err) = self.dispatcher.notify(dest, text).await {
            warn!(error = %err, "failed to send album notice");
        }
    }

    /// Finalize every pending album immediately. Used on shutdown.
    pub async fn drain(&self) {
        let batches = match self.buffer.drain() {
            Ok(batches) => batches,
            Err(err) => {
                error!(?err, "failed to drain album buffer");
                return;
            }
        };
        if batches.is_empty() {
            return;
        }
        info!(pending = batches.len(), "finalizing pending albums before exit");
        join_all(batches.into_iter().map(|(key, mut batch)| {
            batch.cancel_timer();
            self.deliver(key.user_id, batch)
        }))
        .await;
    }
}
