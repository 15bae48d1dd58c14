//! Chat transport seam: every outbound Telegram call goes through
//! [`ChatTransport`] so dispatch logic can be exercised without a live bot.
use crate::model::{Button, MediaItem, MediaKind};
use async_trait::async_trait;
use reqwest::Url;
use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, InputFile, InputMedia, InputMediaPhoto,
    InputMediaVideo,
};
use teloxide::RequestError;
use thiserror::Error;

/// A chat plus an optional forum topic. `thread_id = None` is the chat's
/// general slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    pub chat_id: i64,
    pub thread_id: Option<i32>,
}

impl Destination {
    pub fn chat(chat_id: i64) -> Self {
        Self {
            chat_id,
            thread_id: None,
        }
    }

    pub fn topic(chat_id: i64, thread_id: i32) -> Self {
        Self {
            chat_id,
            thread_id: Some(thread_id),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("media group has no items")]
    EmptyMediaGroup,
    #[error("message thread not found: {0}")]
    ThreadNotFound(String),
    #[error("invalid button url {0}")]
    InvalidButtonUrl(String),
    #[error("telegram request failed: {0}")]
    Telegram(String),
}

impl SendError {
    /// Short operator-facing explanation.
    pub fn operator_hint(&self) -> &'static str {
        match self {
            SendError::EmptyMediaGroup => "the album is empty, no media could be resolved",
            SendError::ThreadNotFound(_) => "topic not found, check its thread id with /topics",
            SendError::InvalidButtonUrl(_) => "the button link is not a valid URL",
            SendError::Telegram(_) => "sending failed",
        }
    }
}

/// Map a teloxide error to [`SendError`]. Telegram reports a deleted or wrong
/// forum topic only through the error description, so this is the one place
/// that inspects it.
pub fn classify_request_error(err: RequestError) -> SendError {
    let description = err.to_string();
    if description.to_ascii_lowercase().contains("thread not found") {
        SendError::ThreadNotFound(description)
    } else {
        SendError::Telegram(description)
    }
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(
        &self,
        dest: Destination,
        text: &str,
        button: Option<&Button>,
    ) -> Result<(), SendError>;

    async fn send_photo(
        &self,
        dest: Destination,
        file_id: &str,
        caption: Option<&str>,
        button: Option<&Button>,
    ) -> Result<(), SendError>;

    async fn send_video(
        &self,
        dest: Destination,
        file_id: &str,
        caption: Option<&str>,
        button: Option<&Button>,
    ) -> Result<(), SendError>;

    async fn send_media_group(
        &self,
        dest: Destination,
        items: &[MediaItem],
    ) -> Result<(), SendError>;
}

/// [`ChatTransport`] backed by the Telegram Bot API.
#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn keyboard(button: &Button) -> Result<InlineKeyboardMarkup, SendError> {
    let url = Url::parse(&button.url).map_err(|_| SendError::InvalidButtonUrl(button.url.clone()))?;
    Ok(InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::url(button.label.clone(), url),
    ]]))
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_text(
        &self,
        dest: Destination,
        text: &str,
        button: Option<&Button>,
    ) -> Result<(), SendError> {
        let mut req = self.bot.send_message(ChatId(dest.chat_id), text);
        if let Some(thread_id) = dest.thread_id {
            req = req.message_thread_id(thread_id);
        }
        if let Some(button) = button {
            req = req.reply_markup(keyboard(button)?);
        }
        req.await.map_err(classify_request_error)?;
        Ok(())
    }

    async fn send_photo(
        &self,
        dest: Destination,
        file_id: &str,
        caption: Option<&str>,
        button: Option<&Button>,
    ) -> Result<(), SendError> {
        let mut req = self
            .bot
            .send_photo(ChatId(dest.chat_id), InputFile::file_id(file_id));
        if let Some(thread_id) = dest.thread_id {
            req = req.message_thread_id(thread_id);
        }
        if let Some(caption) = caption {
            req = req.caption(caption);
        }
        if let Some(button) = button {
            req = req.reply_markup(keyboard(button)?);
        }
        req.await.map_err(classify_request_error)?;
        Ok(())
    }

    async fn send_video(
        &self,
        dest: Destination,
        file_id: &str,
        caption: Option<&str>,
        button: Option<&Button>,
    ) -> Result<(), SendError> {
        let mut req = self
            .bot
            .send_video(ChatId(dest.chat_id), InputFile::file_id(file_id));
        if let Some(thread_id) = dest.thread_id {
            req = req.message_thread_id(thread_id);
        }
        if let Some(caption) = caption {
            req = req.caption(caption);
        }
        if let Some(button) = button {
            req = req.reply_markup(keyboard(button)?);
        }
        req.await.map_err(classify_request_error)?;
        Ok(())
    }

    async fn send_media_group(
        &self,
        dest: Destination,
        items: &[MediaItem],
    ) -> Result<(), SendError> {
        let media: Vec<InputMedia> = items
            .iter()
            .map(|item| match item.kind {
                MediaKind::Photo => InputMedia::Photo(InputMediaPhoto::new(InputFile::file_id(
                    item.file_id.clone(),
                ))),
                MediaKind::Video => InputMedia::Video(InputMediaVideo::new(InputFile::file_id(
                    item.file_id.clone(),
                ))),
            })
            .collect();
        let mut req = self.bot.send_media_group(ChatId(dest.chat_id), media);
        if let Some(thread_id) = dest.thread_id {
            req = req.message_thread_id(thread_id);
        }
        req.await.map_err(classify_request_error)?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use teloxide::ApiError;

    #[test]
    fn thread_not_found_is_classified() {
        let err = RequestError::Api(ApiError::Unknown(
            "Bad Request: message thread not found".into(),
        ));
        assert!(matches!(
            classify_request_error(err),
            SendError::ThreadNotFound(_)
        ));
    }

    #[test]
    fn other_api_errors_are_generic() {
        let err = RequestError::Api(ApiError::BotBlocked);
        assert!(matches!(classify_request_error(err), SendError::Telegram(_)));
    }

    #[test]
    fn keyboard_rejects_relative_url() {
        let button = Button {
            label: "Open".into(),
            url: "catalog/42".into(),
        };
        assert_eq!(
            keyboard(&button).unwrap_err(),
            SendError::InvalidButtonUrl("catalog/42".into())
        );
        let button = Button {
            label: "Open".into(),
            url: "https://example.com/catalog/42".into(),
        };
        assert!(keyboard(&button).is_ok());
    }
}
