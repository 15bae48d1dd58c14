use serde::{Deserialize, Serialize};

/// Prefix marking a video file id that was uploaded as a document.
pub const UPLOAD_TAG: &str = "doc:";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaItem {
    pub kind: MediaKind,
    pub file_id: String,
}

impl MediaItem {
    pub fn photo(file_id: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Photo,
            file_id: file_id.into(),
        }
    }

    pub fn video(file_id: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Video,
            file_id: file_id.into(),
        }
    }
}

/// Media attached to a broadcast.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Media {
    #[default]
    None,
    Photo {
        file_id: String,
    },
    Video {
        file_id: String,
    },
    Group {
        items: Vec<MediaItem>,
    },
}

impl Media {
    pub fn describe(&self) -> String {
        match self {
            Media::None => "no media".to_string(),
            Media::Photo { .. } => "photo".to_string(),
            Media::Video { .. } => "video".to_string(),
            Media::Group { items } => format!("album of {}", items.len()),
        }
    }
}

impl From<MediaItem> for Media {
    fn from(item: MediaItem) -> Self {
        match item.kind {
            MediaKind::Photo => Media::Photo {
                file_id: item.file_id,
            },
            MediaKind::Video => Media::Video {
                file_id: item.file_id,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastPayload {
    pub text: String,
    pub button: Option<Button>,
    pub media: Media,
}

impl BroadcastPayload {
    pub fn caption(&self) -> Option<&str> {
        let text = self.text.trim();
        (!text.is_empty()).then_some(self.text.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.caption().is_none() && matches!(self.media, Media::None)
    }
}

pub const CONFIRM_PROMPT: &str = "Send /send_all, /send_general, /send_topic <name> or /cancel.";
pub const NO_DRAFT: &str = "No broadcast in progress. Send /broadcast to start one.";

/// Composition step of an operator's broadcast draft.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum DraftState {
    #[default]
    AwaitingText,
    AwaitingButton,
    AwaitingMedia,
    AwaitingConfirmation,
}

impl DraftState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftState::AwaitingText => "awaiting_text",
            DraftState::AwaitingButton => "awaiting_button",
            DraftState::AwaitingMedia => "awaiting_media",
            DraftState::AwaitingConfirmation => "awaiting_confirmation",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "awaiting_text" => Some(DraftState::AwaitingText),
            "awaiting_button" => Some(DraftState::AwaitingButton),
            "awaiting_media" => Some(DraftState::AwaitingMedia),
            "awaiting_confirmation" => Some(DraftState::AwaitingConfirmation),
            _ => None,
        }
    }

    /// Whether a photo, video or album may be attached at this step. Media sent
    /// while awaiting confirmation replaces the earlier attachment.
    pub fn accepts_media(&self) -> bool {
        matches!(
            self,
            DraftState::AwaitingMedia | DraftState::AwaitingConfirmation
        )
    }

    /// What the operator should send next.
    pub fn prompt(&self) -> &'static str {
        match self {
            DraftState::AwaitingText => "Send the broadcast text, or /skip for none.",
            DraftState::AwaitingButton => {
                "Send the button as `Label | https://link`, or /skip for no button."
            }
            DraftState::AwaitingMedia => {
                "Send a photo, a video or an album, or /skip to send text only."
            }
            DraftState::AwaitingConfirmation => CONFIRM_PROMPT,
        }
    }
}

/// Broadcast fields collected across the steps of one operator conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    pub user_id: i64,
    pub state: DraftState,
    pub text: String,
    pub button: Option<Button>,
    pub media: Media,
}

impl Draft {
    pub fn payload(&self) -> BroadcastPayload {
        self.payload_with(self.media.clone())
    }

    pub fn payload_with(&self, media: Media) -> BroadcastPayload {
        BroadcastPayload {
            text: self.text.clone(),
            button: self.button.clone(),
            media,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BroadcastStatus {
    Sent,
    Partial,
    Failed,
}

impl BroadcastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastStatus::Sent => "sent",
            BroadcastStatus::Partial => "partial",
            BroadcastStatus::Failed => "failed",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(BroadcastStatus::Sent),
            "partial" => Some(BroadcastStatus::Partial),
            "failed" => Some(BroadcastStatus::Failed),
            _ => None,
        }
    }
}

/// Which destinations of the group a broadcast is fanned out to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetScope {
    All,
    General,
    Topic(String),
}

impl TargetScope {
    pub fn tag(&self) -> String {
        match self {
            TargetScope::All => "all".to_string(),
            TargetScope::General => "general".to_string(),
            TargetScope::Topic(name) => format!("topic:{}", name),
        }
    }
}
