//! Outgoing messages: upload attachments, show the message optimistically,
//! emit it, then settle it against the server's ack.

use std::{sync::Arc, time::Duration};

use futures::{StreamExt, TryStreamExt};
use serde_json::Value;
use shared::{
    domain::{Attachment, ClientTempId, ConversationId, Delivery, GifRef, Message, UserRef},
    protocol::{ClientOp, SendAck},
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    config::ClientSettings,
    error::{SyncError, SyncResult},
    message_store::MessageStore,
    protocol_client::FileUpload,
    AttachmentUploader, LiveChannel,
};

#[derive(Debug, Clone, Copy)]
pub struct SendSettings {
    pub ack_timeout: Duration,
    pub upload_timeout: Duration,
    pub upload_concurrency: usize,
}

impl From<&ClientSettings> for SendSettings {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            ack_timeout: settings.ack_timeout(),
            upload_timeout: settings.upload_timeout(),
            upload_concurrency: settings.upload_concurrency,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub conversation_id: ConversationId,
    pub body: String,
    pub files: Vec<FileUpload>,
    pub gif: Option<GifRef>,
}

impl OutgoingMessage {
    pub fn text(conversation_id: ConversationId, body: impl Into<String>) -> Self {
        Self {
            conversation_id,
            body: body.into(),
            files: Vec::new(),
            gif: None,
        }
    }

    pub fn with_file(mut self, file: FileUpload) -> Self {
        self.files.push(file);
        self
    }

    pub fn with_gif(mut self, gif: GifRef) -> Self {
        self.gif = Some(gif);
        self
    }

    fn is_empty(&self) -> bool {
        self.body.trim().is_empty() && self.files.is_empty() && self.gif.is_none()
    }
}

/// Handle for a send whose optimistic entry is already in the store.
#[derive(Debug)]
pub struct SendTicket {
    client_temp_id: ClientTempId,
    conversation_id: ConversationId,
    completion: JoinHandle<SyncResult<Message>>,
}

impl SendTicket {
    pub fn client_temp_id(&self) -> &ClientTempId {
        &self.client_temp_id
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Resolves with the confirmed message, or the reason it was marked failed.
    pub async fn delivered(self) -> SyncResult<Message> {
        match self.completion.await {
            Ok(result) => result,
            Err(err) => Err(SyncError::SendFailure {
                client_temp_id: self.client_temp_id,
                reason: format!("send task ended unexpectedly: {err}"),
            }),
        }
    }
}

pub struct SendPipeline {
    channel: Arc<dyn LiveChannel>,
    uploader: Arc<dyn AttachmentUploader>,
    store: Arc<Mutex<MessageStore>>,
    local_user: UserRef,
    settings: SendSettings,
}

impl SendPipeline {
    pub fn new(
        channel: Arc<dyn LiveChannel>,
        uploader: Arc<dyn AttachmentUploader>,
        store: Arc<Mutex<MessageStore>>,
        local_user: UserRef,
        settings: SendSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            uploader,
            store,
            local_user,
            settings,
        })
    }

    /// Uploads every file first; any upload failure aborts the send before
    /// anything reaches the store. Returns once the optimistic entry is visible.
    pub async fn send(self: &Arc<Self>, outgoing: OutgoingMessage) -> SyncResult<SendTicket> {
        if outgoing.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let attachments = self.upload_all(&outgoing.files).await?;
        Ok(self
            .dispatch(outgoing.conversation_id, outgoing.body, attachments, outgoing.gif)
            .await)
    }

    /// Re-sends a failed message under a fresh client temp id, reusing the
    /// attachments that were already uploaded.
    pub async fn retry(self: &Arc<Self>, client_temp_id: &ClientTempId) -> SyncResult<SendTicket> {
        let failed = {
            let mut store = self.store.lock().await;
            match store.unsent(client_temp_id) {
                Some(message) if matches!(message.delivery, Delivery::Failed { .. }) => {
                    store.remove(client_temp_id)
                }
                _ => None,
            }
        };
        let failed = failed.ok_or_else(|| SyncError::UnknownMessage {
            client_temp_id: client_temp_id.clone(),
        })?;

        info!(%client_temp_id, conversation_id = %failed.conversation_id, "send: retrying failed message");
        Ok(self
            .dispatch(failed.conversation_id, failed.body, failed.attachments, failed.gif)
            .await)
    }

    async fn upload_all(&self, files: &[FileUpload]) -> SyncResult<Vec<Attachment>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let uploader = &self.uploader;
        let timeout = self.settings.upload_timeout;

        let upload_futures: Vec<_> = files
            .iter()
            .enumerate()
            .map(|(index, file)| async move {
                let reason = match tokio::time::timeout(timeout, uploader.upload(file)).await {
                    Ok(Ok(attachment)) => return Ok(attachment),
                    Ok(Err(err)) => err.to_string(),
                    Err(_) => "timed out".to_string(),
                };
                warn!(index, filename = %file.filename, %reason, "send: attachment upload failed");
                Err(SyncError::UploadFailure {
                    index,
                    filename: file.filename.clone(),
                    reason,
                })
            })
            .collect();
        let uploads = futures::stream::iter(upload_futures)
            .buffered(self.settings.upload_concurrency.max(1));

        uploads.try_collect().await
    }

    async fn dispatch(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        body: String,
        attachments: Vec<Attachment>,
        gif: Option<GifRef>,
    ) -> SendTicket {
        let client_temp_id = ClientTempId::generate();
        let optimistic = Message::pending(
            conversation_id.clone(),
            self.local_user.clone(),
            body.clone(),
            attachments.clone(),
            gif.clone(),
            client_temp_id.clone(),
        );
        self.store.lock().await.append_optimistic(optimistic);

        let op = ClientOp::Send {
            conversation_id: conversation_id.clone(),
            client_temp_id: client_temp_id.clone(),
            body,
            attachments,
            gif,
        };
        let pipeline = Arc::clone(self);
        let task_temp_id = client_temp_id.clone();
        let task_conversation = conversation_id.clone();
        let completion = tokio::spawn(async move {
            pipeline
                .complete(task_temp_id, task_conversation, op)
                .await
        });

        SendTicket {
            client_temp_id,
            conversation_id,
            completion,
        }
    }

    async fn complete(
        &self,
        client_temp_id: ClientTempId,
        conversation_id: ConversationId,
        op: ClientOp,
    ) -> SyncResult<Message> {
        let outcome = match self.channel.request(op, self.settings.ack_timeout).await {
            Ok(data) => confirm(&client_temp_id, &conversation_id, data),
            Err(SyncError::AckTimeout { .. }) => Err(SyncError::SendTimeout {
                client_temp_id: client_temp_id.clone(),
            }),
            Err(SyncError::Rejected { reason, .. }) => Err(SyncError::SendFailure {
                client_temp_id: client_temp_id.clone(),
                reason,
            }),
            Err(other) => Err(SyncError::SendFailure {
                client_temp_id: client_temp_id.clone(),
                reason: other.to_string(),
            }),
        };

        match outcome {
            Ok(message) => {
                self.store
                    .lock()
                    .await
                    .reconcile(&client_temp_id, message.clone());
                info!(%client_temp_id, %conversation_id, "send: delivered");
                Ok(message)
            }
            Err(err) => {
                let marked = self
                    .store
                    .lock()
                    .await
                    .mark_failed(&client_temp_id, err.to_string());
                warn!(
                    %client_temp_id,
                    %conversation_id,
                    error = %err,
                    still_unsent = marked.is_some(),
                    "send: not acknowledged"
                );
                Err(err)
            }
        }
    }
}

fn confirm(
    client_temp_id: &ClientTempId,
    conversation_id: &ConversationId,
    data: Value,
) -> SyncResult<Message> {
    let failure = |reason: String| SyncError::SendFailure {
        client_temp_id: client_temp_id.clone(),
        reason,
    };
    let ack: SendAck =
        serde_json::from_value(data).map_err(|err| failure(format!("malformed ack: {err}")))?;
    let wire = ack
        .message
        .ok_or_else(|| failure("ack did not carry the stored message".into()))?;
    wire.into_message(Some(conversation_id))
        .map_err(|err| failure(err.to_string()))
}

#[cfg(test)]
#[path = "tests/send_pipeline_tests.rs"]
mod tests;
