//! Request/response endpoints: history fallback, conversation directory and
//! attachment uploads.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Attachment, Conversation, ConversationId, Message, UserId},
    error::ApiError,
    protocol::{
        ConversationListResponse, ConversationResponse, HistoryResponse, OpenDirectRequest,
        WireAttachment,
    },
};
use tracing::{info, warn};
use url::Url;

use crate::{
    config::ClientSettings,
    error::{SyncError, SyncResult},
    AttachmentUploader, ConversationApi, HistoryApi,
};

/// A local file queued for upload.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub filename: String,
    pub mimetype: Option<String>,
    pub bytes: Vec<u8>,
}

impl FileUpload {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            mimetype: None,
            bytes,
        }
    }

    pub fn with_mimetype(mut self, mimetype: impl Into<String>) -> Self {
        self.mimetype = Some(mimetype.into());
        self
    }
}

#[derive(Clone)]
pub struct HttpApi {
    http: Client,
    base_url: Url,
    auth_token: String,
    request_timeout: Duration,
    upload_timeout: Duration,
    preview_chars: usize,
}

impl HttpApi {
    pub fn new(settings: &ClientSettings, auth_token: impl Into<String>) -> SyncResult<Self> {
        let http = Client::builder()
            .connect_timeout(settings.connect_timeout())
            .build()
            .map_err(|err| SyncError::Config(format!("http client: {err}")))?;
        Ok(Self {
            http,
            base_url: settings.http_base_url()?,
            auth_token: auth_token.into(),
            request_timeout: settings.history_timeout(),
            upload_timeout: settings.upload_timeout(),
            preview_chars: settings.preview_chars,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> SyncResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::Config(format!("{} cannot be a base url", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url, timeout: Duration) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.auth_token)
            .timeout(timeout)
    }

    async fn get_json<T: DeserializeOwned>(&self, op: &'static str, segments: &[&str]) -> SyncResult<T> {
        let url = self.endpoint(segments)?;
        let response = self
            .request(Method::GET, url, self.request_timeout)
            .send()
            .await?;
        decode(op, response).await
    }
}

async fn decode<T: DeserializeOwned>(op: &'static str, response: Response) -> SyncResult<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|err| SyncError::InvalidPayload(format!("{op} response: {err}")));
    }

    let body = response.text().await.unwrap_or_default();
    let api_error = serde_json::from_str::<ApiError>(&body).ok();
    let reason = api_error
        .as_ref()
        .map(|err| err.message.clone())
        .unwrap_or_else(|| format!("HTTP {status}"));

    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
        || api_error.as_ref().is_some_and(ApiError::is_auth)
    {
        return Err(SyncError::Auth(reason));
    }
    if status.is_server_error() || api_error.as_ref().is_some_and(ApiError::is_transient) {
        return Err(SyncError::Network(format!("{op}: {reason}")));
    }
    Err(SyncError::Rejected { op, reason })
}

#[async_trait]
impl HistoryApi for HttpApi {
    async fn fetch_history(&self, conversation_id: &ConversationId) -> SyncResult<Vec<Message>> {
        let response: HistoryResponse = self
            .get_json("history", &["conversations", conversation_id.as_str(), "messages"])
            .await?;
        let (messages, rejected) = response.into_messages(conversation_id);
        for err in &rejected {
            warn!(%conversation_id, %err, "session: dropping invalid history entry");
        }
        Ok(messages)
    }
}

#[async_trait]
impl ConversationApi for HttpApi {
    async fn list_conversations(&self) -> SyncResult<Vec<Conversation>> {
        let response: ConversationListResponse =
            self.get_json("conversations", &["conversations"]).await?;
        let mut conversations = Vec::with_capacity(response.conversations.len());
        for wire in response.conversations {
            match wire.into_conversation(self.preview_chars) {
                Ok(conversation) => conversations.push(conversation),
                Err(err) => warn!(%err, "list: dropping invalid conversation"),
            }
        }
        Ok(conversations)
    }

    async fn fetch_conversation(&self, conversation_id: &ConversationId) -> SyncResult<Conversation> {
        let response: ConversationResponse = self
            .get_json("conversation", &["conversations", conversation_id.as_str()])
            .await?;
        Ok(response.conversation.into_conversation(self.preview_chars)?)
    }

    async fn open_direct(&self, peer: &UserId) -> SyncResult<Conversation> {
        let url = self.endpoint(&["conversations"])?;
        let response = self
            .request(Method::POST, url, self.request_timeout)
            .json(&OpenDirectRequest {
                participant_id: peer.clone(),
            })
            .send()
            .await?;
        let response: ConversationResponse = decode("open_direct", response).await?;
        let conversation = response.conversation.into_conversation(self.preview_chars)?;
        info!(conversation_id = %conversation.id, %peer, "list: direct conversation ready");
        Ok(conversation)
    }
}

#[async_trait]
impl AttachmentUploader for HttpApi {
    async fn upload(&self, file: &FileUpload) -> SyncResult<Attachment> {
        let url = self.endpoint(&["uploads"])?;
        let mimetype = file
            .mimetype
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let response = self
            .request(Method::POST, url, self.upload_timeout)
            .query(&[("filename", file.filename.as_str()), ("mimetype", mimetype.as_str())])
            .header(reqwest::header::CONTENT_TYPE, mimetype.as_str())
            .body(file.bytes.clone())
            .send()
            .await?;
        let wire: WireAttachment = decode("upload", response).await?;
        let attachment = wire.into_attachment()?;
        info!(
            filename = %attachment.filename,
            bytes = file.bytes.len(),
            "send: attachment uploaded"
        );
        Ok(attachment)
    }
}

#[cfg(test)]
#[path = "tests/protocol_client_tests.rs"]
mod tests;
