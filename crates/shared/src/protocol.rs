use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::{
    Attachment, AttachmentKind, ClientTempId, Conversation, ConversationId, Delivery, GifRef,
    Message, MessageId, MessagePreview, UserId, UserRef,
};

const DEFAULT_MIMETYPE: &str = "application/octet-stream";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("message belongs to conversation {actual}, expected {expected}")]
    ConversationMismatch {
        expected: ConversationId,
        actual: ConversationId,
    },
    #[error("conversation {conversation_id} has {count} participant(s); at least 2 required")]
    TooFewParticipants {
        conversation_id: ConversationId,
        count: usize,
    },
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for PayloadError {
    fn from(value: serde_json::Error) -> Self {
        Self::Malformed(value.to_string())
    }
}

/// Every frame the client writes on the live channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFrame {
    pub request_id: u64,
    #[serde(flatten)]
    pub op: ClientOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientOp {
    Authenticate {
        token: String,
    },
    Join {
        conversation_id: ConversationId,
    },
    Leave {
        conversation_id: ConversationId,
    },
    History {
        conversation_id: ConversationId,
    },
    Send {
        conversation_id: ConversationId,
        client_temp_id: ClientTempId,
        body: String,
        attachments: Vec<Attachment>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gif: Option<GifRef>,
    },
}

impl ClientOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::History { .. } => "history",
            Self::Send { .. } => "send",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Ack {
        request_id: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        data: Value,
    },
    NewMessage {
        conversation_id: WireRef,
        message: WireMessage,
    },
    ConversationUpdated {
        conversation_id: WireRef,
        last_message: WireMessage,
    },
    #[serde(other)]
    Unknown,
}

/// An identifier that may arrive bare or as a populated object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireRef {
    Id(String),
    Numeric(i64),
    Object {
        #[serde(alias = "_id")]
        id: String,
    },
}

impl WireRef {
    pub fn into_string(self) -> String {
        match self {
            Self::Id(id) | Self::Object { id } => id,
            Self::Numeric(id) => id.to_string(),
        }
    }
}

impl From<&str> for WireRef {
    fn from(value: &str) -> Self {
        Self::Id(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireUser {
    Id(String),
    Object {
        #[serde(alias = "_id")]
        id: String,
        #[serde(default, alias = "name", skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
}

impl From<WireUser> for UserRef {
    fn from(value: WireUser) -> Self {
        match value {
            WireUser::Id(id) => UserRef::new(id),
            WireUser::Object { id, username } => UserRef {
                id: UserId(id),
                username,
            },
        }
    }
}

impl From<&UserRef> for WireUser {
    fn from(value: &UserRef) -> Self {
        Self::Object {
            id: value.id.0.clone(),
            username: value.username.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireGif {
    Url(String),
    Object(GifRef),
}

impl WireGif {
    fn normalize(self) -> Option<GifRef> {
        match self {
            Self::Url(url) if url.trim().is_empty() => None,
            Self::Url(url) => Some(GifRef::from_url(url)),
            Self::Object(gif) if gif.url.trim().is_empty() => None,
            Self::Object(gif) => Some(gif),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAttachment {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub url: String,
    #[serde(default, alias = "name", skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(
        default,
        alias = "mimeType",
        alias = "contentType",
        skip_serializing_if = "Option::is_none"
    )]
    pub mimetype: Option<String>,
}

impl WireAttachment {
    pub fn into_attachment(self) -> Result<Attachment, PayloadError> {
        if self.url.trim().is_empty() {
            return Err(PayloadError::MissingField("url"));
        }
        let mimetype = self
            .mimetype
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MIMETYPE.to_string());
        let kind = match self.kind.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("image") => AttachmentKind::Image,
            Some("video") => AttachmentKind::Video,
            Some("file") => AttachmentKind::File,
            _ => AttachmentKind::from_mimetype(&mimetype),
        };
        let filename = self
            .filename
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| filename_from_url(&self.url));
        Ok(Attachment {
            kind,
            url: self.url,
            filename,
            mimetype,
        })
    }
}

impl From<&Attachment> for WireAttachment {
    fn from(value: &Attachment) -> Self {
        let kind = match value.kind {
            AttachmentKind::Image => "image",
            AttachmentKind::Video => "video",
            AttachmentKind::File => "file",
        };
        Self {
            kind: Some(kind.to_string()),
            url: value.url.clone(),
            filename: Some(value.filename.clone()),
            mimetype: Some(value.mimetype.clone()),
        }
    }
}

fn filename_from_url(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .filter(|segment| !segment.is_empty())
        .unwrap_or("attachment")
        .to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(default, alias = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<WireRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<String>,
    #[serde(default, alias = "conversation", skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<WireRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<WireUser>,
    #[serde(default, alias = "text", alias = "content", skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub attachments: Vec<WireAttachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gif: Option<WireGif>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl WireMessage {
    /// Normalizes a server-confirmed message. `expected_conversation` is the
    /// conversation the surrounding frame or request was about, if known.
    pub fn into_message(
        self,
        expected_conversation: Option<&ConversationId>,
    ) -> Result<Message, PayloadError> {
        let id = self
            .id
            .map(|id| MessageId(id.into_string()))
            .ok_or(PayloadError::MissingField("id"))?;
        let conversation_id = match (self.conversation_id, expected_conversation) {
            (Some(actual), Some(expected)) => {
                let actual = ConversationId(actual.into_string());
                if &actual != expected {
                    return Err(PayloadError::ConversationMismatch {
                        expected: expected.clone(),
                        actual,
                    });
                }
                actual
            }
            (Some(actual), None) => ConversationId(actual.into_string()),
            (None, Some(expected)) => expected.clone(),
            (None, None) => return Err(PayloadError::MissingField("conversationId")),
        };
        let sender = self
            .sender
            .map(UserRef::from)
            .ok_or(PayloadError::MissingField("sender"))?;
        let created_at = self
            .created_at
            .ok_or(PayloadError::MissingField("createdAt"))?;
        let attachments = self
            .attachments
            .into_iter()
            .map(WireAttachment::into_attachment)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Message {
            conversation_id,
            sender,
            body: self.body.unwrap_or_default(),
            attachments,
            gif: self.gif.and_then(WireGif::normalize),
            created_at,
            delivery: Delivery::Sent {
                id,
                client_temp_id: self
                    .client_temp_id
                    .filter(|value| !value.is_empty())
                    .map(ClientTempId),
            },
        })
    }
}

impl From<&Message> for WireMessage {
    fn from(value: &Message) -> Self {
        Self {
            id: value.id().map(|id| WireRef::Id(id.0.clone())),
            client_temp_id: value.client_temp_id().map(|id| id.0.clone()),
            conversation_id: Some(WireRef::Id(value.conversation_id.0.clone())),
            sender: Some(WireUser::from(&value.sender)),
            body: Some(value.body.clone()),
            attachments: value.attachments.iter().map(WireAttachment::from).collect(),
            gif: value.gif.clone().map(WireGif::Object),
            created_at: Some(value.created_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireConversation {
    #[serde(default, alias = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<WireRef>,
    #[serde(default, alias = "members")]
    pub participants: Vec<WireUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<WireMessage>,
    #[serde(default, alias = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
}

impl WireConversation {
    pub fn into_conversation(self, preview_chars: usize) -> Result<Conversation, PayloadError> {
        let id = self
            .id
            .map(|id| ConversationId(id.into_string()))
            .ok_or(PayloadError::MissingField("id"))?;
        let participants: Vec<UserRef> = self.participants.into_iter().map(UserRef::from).collect();
        if participants.len() < 2 {
            return Err(PayloadError::TooFewParticipants {
                conversation_id: id,
                count: participants.len(),
            });
        }
        // Summaries from list endpoints are often partially populated; an
        // unusable preview degrades to none rather than rejecting the row.
        let last_message = self
            .last_message
            .and_then(|message| message.into_message(Some(&id)).ok())
            .map(|message| MessagePreview::from_message(&message, preview_chars));
        let last_message_at = self
            .last_message_at
            .or_else(|| last_message.as_ref().map(|preview| preview.created_at));

        Ok(Conversation {
            id,
            participants,
            last_message,
            last_message_at,
        })
    }
}

impl From<&Conversation> for WireConversation {
    fn from(value: &Conversation) -> Self {
        Self {
            id: Some(WireRef::Id(value.id.0.clone())),
            participants: value.participants.iter().map(WireUser::from).collect(),
            last_message: None,
            last_message_at: value.last_message_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthAck {
    pub user: WireUser,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryResponse {
    #[serde(default)]
    pub messages: Vec<WireMessage>,
}

impl HistoryResponse {
    /// Normalizes every entry against `conversation_id`, returning the usable
    /// messages and the reasons the rest were dropped.
    pub fn into_messages(
        self,
        conversation_id: &ConversationId,
    ) -> (Vec<Message>, Vec<PayloadError>) {
        let mut messages = Vec::with_capacity(self.messages.len());
        let mut rejected = Vec::new();
        for wire in self.messages {
            match wire.into_message(Some(conversation_id)) {
                Ok(message) => messages.push(message),
                Err(err) => rejected.push(err),
            }
        }
        (messages, rejected)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendAck {
    #[serde(default)]
    pub message: Option<WireMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationListResponse {
    #[serde(default)]
    pub conversations: Vec<WireConversation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub conversation: WireConversation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenDirectRequest {
    pub participant_id: UserId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_loosely_shaped_message() {
        let raw = json!({
            "_id": "m1",
            "conversation": { "_id": "c1", "participants": [] },
            "sender": { "_id": "u1", "username": "alice" },
            "text": "hi",
            "attachments": [{ "url": "https://cdn.example/files/cat.png", "mimetype": "image/png" }],
            "gif": "https://media.example/party.gif",
            "createdAt": "2024-03-01T10:00:00.000Z"
        });
        let wire: WireMessage = serde_json::from_value(raw).expect("wire message");
        let message = wire.into_message(None).expect("normalized");

        assert_eq!(message.id(), Some(&MessageId::from("m1")));
        assert_eq!(message.conversation_id, ConversationId::from("c1"));
        assert_eq!(message.sender.username.as_deref(), Some("alice"));
        assert_eq!(message.body, "hi");
        assert_eq!(message.attachments[0].kind, AttachmentKind::Image);
        assert_eq!(message.attachments[0].filename, "cat.png");
        assert_eq!(
            message.gif.as_ref().map(|gif| gif.url.as_str()),
            Some("https://media.example/party.gif")
        );
    }

    #[test]
    fn rejects_message_without_id_or_timestamp() {
        let wire: WireMessage = serde_json::from_value(json!({
            "sender": "u1",
            "body": "hi",
            "createdAt": "2024-03-01T10:00:00Z"
        }))
        .expect("wire message");
        assert_eq!(
            wire.into_message(Some(&ConversationId::from("c1"))),
            Err(PayloadError::MissingField("id"))
        );

        let wire: WireMessage =
            serde_json::from_value(json!({ "id": "m1", "sender": "u1" })).expect("wire message");
        assert_eq!(
            wire.into_message(Some(&ConversationId::from("c1"))),
            Err(PayloadError::MissingField("createdAt"))
        );
    }

    #[test]
    fn rejects_message_for_other_conversation() {
        let wire: WireMessage = serde_json::from_value(json!({
            "id": "m1",
            "conversationId": "c2",
            "sender": "u1",
            "createdAt": "2024-03-01T10:00:00Z"
        }))
        .expect("wire message");
        let err = wire
            .into_message(Some(&ConversationId::from("c1")))
            .expect_err("mismatch");
        assert!(matches!(err, PayloadError::ConversationMismatch { .. }));
    }

    #[test]
    fn client_frame_flattens_op_fields() {
        let frame = ClientFrame {
            request_id: 4,
            op: ClientOp::Join {
                conversation_id: ConversationId::from("c1"),
            },
        };
        let value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(
            value,
            json!({ "requestId": 4, "op": "join", "conversationId": "c1" })
        );
    }

    #[test]
    fn unknown_server_frame_type_is_tolerated() {
        let frame: ServerFrame =
            serde_json::from_value(json!({ "type": "typing", "conversationId": "c1" }))
                .expect("frame");
        assert!(matches!(frame, ServerFrame::Unknown));
    }

    #[test]
    fn conversation_requires_two_participants() {
        let wire: WireConversation = serde_json::from_value(json!({
            "_id": "c1",
            "participants": ["u1"]
        }))
        .expect("wire conversation");
        assert!(matches!(
            wire.into_conversation(80),
            Err(PayloadError::TooFewParticipants { count: 1, .. })
        ));
    }
}
