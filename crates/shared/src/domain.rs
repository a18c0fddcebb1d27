use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(ClientTempId);

impl ClientTempId {
    /// Fresh client-side key for an optimistic send.
    pub fn generate() -> Self {
        Self(format!("tmp-{}", uuid::Uuid::new_v4()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserRef {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl UserRef {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            username: None,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }
}

impl fmt::Display for UserRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.username {
            Some(username) => f.write_str(username),
            None => f.write_str(self.id.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Video,
    File,
}

impl AttachmentKind {
    pub fn from_mimetype(mimetype: &str) -> Self {
        let lower = mimetype.trim().to_ascii_lowercase();
        if lower.starts_with("image/") {
            Self::Image
        } else if lower.starts_with("video/") {
            Self::Video
        } else {
            Self::File
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub url: String,
    pub filename: String,
    pub mimetype: String,
}

/// Rich-content reference produced by an external picker (GIF search etc).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GifRef {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl GifRef {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            id: None,
            preview_url: None,
            title: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Failed,
}

/// Per-message delivery state. A message only carries a server id once sent,
/// and every unsent message is keyed by its client temp id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Delivery {
    Pending {
        client_temp_id: ClientTempId,
    },
    Sent {
        id: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_temp_id: Option<ClientTempId>,
    },
    Failed {
        client_temp_id: ClientTempId,
        reason: String,
    },
}

impl Delivery {
    pub fn status(&self) -> MessageStatus {
        match self {
            Self::Pending { .. } => MessageStatus::Pending,
            Self::Sent { .. } => MessageStatus::Sent,
            Self::Failed { .. } => MessageStatus::Failed,
        }
    }

    pub fn id(&self) -> Option<&MessageId> {
        match self {
            Self::Sent { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn client_temp_id(&self) -> Option<&ClientTempId> {
        match self {
            Self::Pending { client_temp_id } | Self::Failed { client_temp_id, .. } => {
                Some(client_temp_id)
            }
            Self::Sent { client_temp_id, .. } => client_temp_id.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub conversation_id: ConversationId,
    pub sender: UserRef,
    pub body: String,
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gif: Option<GifRef>,
    pub created_at: DateTime<Utc>,
    pub delivery: Delivery,
}

impl Message {
    /// Locally-composed entry shown before the server has confirmed it.
    pub fn pending(
        conversation_id: ConversationId,
        sender: UserRef,
        body: impl Into<String>,
        attachments: Vec<Attachment>,
        gif: Option<GifRef>,
        client_temp_id: ClientTempId,
    ) -> Self {
        Self {
            conversation_id,
            sender,
            body: body.into(),
            attachments,
            gif,
            created_at: Utc::now(),
            delivery: Delivery::Pending { client_temp_id },
        }
    }

    pub fn id(&self) -> Option<&MessageId> {
        self.delivery.id()
    }

    pub fn client_temp_id(&self) -> Option<&ClientTempId> {
        self.delivery.client_temp_id()
    }

    pub fn status(&self) -> MessageStatus {
        self.delivery.status()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.delivery, Delivery::Pending { .. })
    }
}

/// List-item summary of a message. Never holds more than a truncated body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePreview {
    pub id: Option<MessageId>,
    pub sender: UserRef,
    pub snippet: String,
    pub attachment_count: usize,
    pub has_gif: bool,
    pub created_at: DateTime<Utc>,
}

impl MessagePreview {
    pub fn from_message(message: &Message, max_chars: usize) -> Self {
        Self {
            id: message.id().cloned(),
            sender: message.sender.clone(),
            snippet: truncate_chars(&message.body, max_chars),
            attachment_count: message.attachments.len(),
            has_gif: message.gif.is_some(),
            created_at: message.created_at,
        }
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => format!("{}…", &text[..byte_index]),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: Vec<UserRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePreview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn has_participant(&self, user_id: &UserId) -> bool {
        self.participants.iter().any(|user| &user.id == user_id)
    }
}
