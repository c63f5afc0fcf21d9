//! Wire events exchanged over a room connection.
//!
//! Frames are JSON text, adjacently tagged: `{"event": "join", "data": {"group_id": 7}}`.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    db::{Committed, NewMessage},
    error::ChatError,
    session::SessionClaim,
};

pub const MAX_CONTENT_LEN: usize = 4000;
pub const MAX_MEDIA_FIELD_LEN: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Join { group_id: i64 },
    Leave { group_id: i64 },
    Message(SubmitMessage),
}

impl ClientEvent {
    pub fn parse(frame: &str) -> Result<Self, ChatError> {
        serde_json::from_str(frame).map_err(|err| ChatError::Validation(format!("invalid event: {err}")))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubmitMessage {
    pub group_id: i64,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
}

impl SubmitMessage {
    /// Checks the body and turns it into a row for `sender`.
    ///
    /// Empty strings count as absent.
    pub fn validate(self, sender: &SessionClaim) -> Result<NewMessage, ChatError> {
        let content = non_empty(self.content);
        let media_url = non_empty(self.media_url);
        let media_type = non_empty(self.media_type);

        if content.is_none() && media_url.is_none() {
            return Err(ChatError::Validation("content or media_url is required".to_owned()));
        }
        if content.as_ref().is_some_and(|c| c.chars().count() > MAX_CONTENT_LEN) {
            return Err(ChatError::Validation(format!(
                "content longer than {MAX_CONTENT_LEN} characters"
            )));
        }
        for field in [&media_url, &media_type].into_iter().flatten() {
            if field.len() > MAX_MEDIA_FIELD_LEN {
                return Err(ChatError::Validation(format!(
                    "media field longer than {MAX_MEDIA_FIELD_LEN} bytes"
                )));
            }
        }

        Ok(NewMessage {
            group_id: self.group_id,
            user_id: sender.id,
            content,
            media_url,
            media_type,
        })
    }
}

fn non_empty(field: Option<String>) -> Option<String> {
    field.filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Joined { group_id: i64 },
    Left { group_id: i64 },
    Message(MessageView),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: i64,
    pub email: String,
}

/// A committed message as the room sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: i64,
    pub group_id: i64,
    pub user: Author,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl MessageView {
    pub fn new(sender: &SessionClaim, message: NewMessage, committed: Committed) -> Self {
        Self {
            id: committed.id,
            group_id: message.group_id,
            user: Author {
                id: sender.id,
                email: sender.email.clone(),
            },
            content: message.content,
            media_url: message.media_url,
            media_type: message.media_type,
            created_at: committed.created_at,
        }
    }
}
