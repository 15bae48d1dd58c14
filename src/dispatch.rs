use crate::db::Topic;
use crate::model::{BroadcastPayload, BroadcastStatus, Media, MediaItem, MediaKind, UPLOAD_TAG};
use crate::transport::{ChatTransport, Destination, SendError};
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub const GENERAL_LABEL: &str = "General";

/// One fan-out target inside the broadcast group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub label: String,
    pub thread_id: Option<i32>,
}

/// Targets of a single dispatch, all inside one chat. Built per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationSet {
    pub chat_id: i64,
    pub targets: Vec<Target>,
}

impl DestinationSet {
    /// General slot first, then every topic in registry order.
    pub fn all(chat_id: i64, topics: &[Topic]) -> Self {
        let mut set = Self::general(chat_id);
        set.targets.extend(topics.iter().map(|t| Target {
            label: t.name.clone(),
            thread_id: Some(t.thread_id),
        }));
        set
    }

    pub fn general(chat_id: i64) -> Self {
        Self {
            chat_id,
            targets: vec![Target {
                label: GENERAL_LABEL.to_string(),
                thread_id: None,
            }],
        }
    }

    pub fn topic(chat_id: i64, topic: &Topic) -> Self {
        Self {
            chat_id,
            targets: vec![Target {
                label: topic.name.clone(),
                thread_id: Some(topic.thread_id),
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub label: String,
    pub reason: SendError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub attempted: usize,
    pub failures: Vec<Failure>,
}

impl DispatchOutcome {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn delivered(&self) -> usize {
        self.attempted - self.failed()
    }

    pub fn status(&self) -> BroadcastStatus {
        match self.failed() {
            0 => BroadcastStatus::Sent,
            n if n < self.attempted => BroadcastStatus::Partial,
            _ => BroadcastStatus::Failed,
        }
    }

    /// Operator-facing report of a fan-out.
    pub fn summary(&self) -> String {
        let mut out = if self.failures.is_empty() {
            format!(
                "Broadcast delivered to {}/{} targets.",
                self.delivered(),
                self.attempted
            )
        } else {
            format!(
                "Broadcast delivered to {}/{} targets, {} failed:",
                self.delivered(),
                self.attempted,
                self.failed()
            )
        };
        for failure in &self.failures {
            out.push_str(&format!(
                "\n- {}: {}",
                failure.label,
                failure.reason.operator_hint()
            ));
        }
        out
    }
}

/// Strip the document-upload tag from a video file id.
pub fn clean_video_id(file_id: &str) -> &str {
    file_id.strip_prefix(UPLOAD_TAG).unwrap_or(file_id)
}

fn clean_item(item: &MediaItem) -> MediaItem {
    match item.kind {
        MediaKind::Video => MediaItem::video(clean_video_id(&item.file_id)),
        MediaKind::Photo => item.clone(),
    }
}

/// Sends finalized payloads to one or many destinations.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn ChatTransport>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self { transport }
    }

    /// Deliver `payload` to a single destination.
    ///
    /// Telegram cannot attach an inline keyboard to an album, so an album goes
    /// out bare and the caption and button follow as a separate message in the
    /// same thread.
    pub async fn send_one(
        &self,
        payload: &BroadcastPayload,
        dest: Destination,
    ) -> Result<(), SendError> {
        let caption = payload.caption();
        let button = payload.button.as_ref();
        match &payload.media {
            Media::None => self.transport.send_text(dest, &payload.text, button).await,
            Media::Photo { file_id } => {
                self.transport
                    .send_photo(dest, file_id, caption, button)
                    .await
            }
            Media::Video { file_id } => {
                self.transport
                    .send_video(dest, clean_video_id(file_id), caption, button)
                    .await
            }
            Media::Group { items } => {
                if items.is_empty() {
                    return Err(SendError::EmptyMediaGroup);
                }
                let items: Vec<MediaItem> = items.iter().map(clean_item).collect();
                self.transport.send_media_group(dest, &items).await?;
                if caption.is_some() || button.is_some() {
                    self.transport
                        .send_text(dest, caption.unwrap_or_default(), button)
                        .await?;
                }
                Ok(())
            }
        }
    }

    /// Fan `payload` out to every target of `set`. Failures are counted per
    /// target and never stop the remaining sends.
    #[instrument(skip_all, fields(chat_id = set.chat_id, targets = set.targets.len()))]
    pub async fn send_all(&self, payload: &BroadcastPayload, set: &DestinationSet) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        for target in &set.targets {
            outcome.attempted += 1;
            let dest = Destination {
                chat_id: set.chat_id,
                thread_id: target.thread_id,
            };
            if let Err(reason) = self.send_one(payload, dest).await {
                warn!(
                    target = %target.label,
                    thread_id = ?target.thread_id,
                    error = %reason,
                    "broadcast send failed"
                );
                outcome.failures.push(Failure {
                    label: target.label.clone(),
                    reason,
                });
            }
        }
        info!(
            attempted = outcome.attempted,
            failed = outcome.failed(),
            "broadcast fan-out finished"
        );
        outcome
    }

    /// Plain text reply, used for operator prompts.
    pub async fn notify(&self, dest: Destination, text: &str) -> Result<(), SendError> {
        self.transport.send_text(dest, text, None).await
    }
}
