//! Active-conversation lifecycle: join the live room, load history, and keep
//! results from a superseded open out of the store.

use std::{sync::Arc, time::Duration};

use shared::{
    domain::{ConversationId, Message},
    protocol::{ClientOp, HistoryResponse},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    error::{SyncError, SyncResult},
    message_store::MessageStore,
    HistoryApi, LiveChannel,
};

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub join_timeout: Duration,
    pub history_timeout: Duration,
}

impl From<&ClientSettings> for SessionSettings {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            join_timeout: settings.join_timeout(),
            history_timeout: settings.history_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistorySource {
    LiveChannel,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Loaded { source: HistorySource, messages: usize },
    /// Another open or close happened first; nothing was written.
    Superseded,
}

#[derive(Debug, Default)]
struct ActiveSlot {
    conversation_id: Option<ConversationId>,
    generation: u64,
    joined: bool,
}

pub struct ConversationSession {
    channel: Arc<dyn LiveChannel>,
    history: Arc<dyn HistoryApi>,
    store: Arc<Mutex<MessageStore>>,
    settings: SessionSettings,
    active: Mutex<ActiveSlot>,
}

impl ConversationSession {
    pub fn new(
        channel: Arc<dyn LiveChannel>,
        history: Arc<dyn HistoryApi>,
        store: Arc<Mutex<MessageStore>>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            channel,
            history,
            store,
            settings,
            active: Mutex::new(ActiveSlot::default()),
        }
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.active.lock().await.conversation_id.clone()
    }

    /// Makes `conversation_id` the active conversation and loads its history,
    /// over the live channel when possible and the fetch endpoint otherwise.
    pub async fn open(&self, conversation_id: &ConversationId) -> SyncResult<OpenOutcome> {
        let (generation, previous) = {
            let mut slot = self.active.lock().await;
            let previous = match slot.conversation_id.take() {
                Some(previous) if slot.joined && &previous != conversation_id => Some(previous),
                _ => None,
            };
            slot.conversation_id = Some(conversation_id.clone());
            slot.generation += 1;
            slot.joined = false;
            (slot.generation, previous)
        };
        info!(%conversation_id, generation, "session: opening conversation");

        if let Some(previous) = previous {
            self.leave(&previous).await;
        }
        self.store.lock().await.begin_loading(conversation_id);
        self.load(conversation_id, generation).await
    }

    /// Leaves the room if `conversation_id` is the active one. Idempotent.
    pub async fn close(&self, conversation_id: &ConversationId) {
        let was_joined = {
            let mut slot = self.active.lock().await;
            if slot.conversation_id.as_ref() != Some(conversation_id) {
                return;
            }
            slot.conversation_id = None;
            slot.generation += 1;
            std::mem::take(&mut slot.joined)
        };
        info!(%conversation_id, "session: closed conversation");
        if was_joined {
            self.leave(conversation_id).await;
        }
    }

    /// Rejoins and reloads the active conversation after the live channel
    /// came back, covering anything pushed while it was down.
    pub async fn resync_active(&self) -> Option<SyncResult<OpenOutcome>> {
        let (conversation_id, generation) = {
            let mut slot = self.active.lock().await;
            let conversation_id = slot.conversation_id.clone()?;
            slot.generation += 1;
            slot.joined = false;
            (conversation_id, slot.generation)
        };
        info!(%conversation_id, "session: resyncing after reconnect");
        Some(self.load(&conversation_id, generation).await)
    }

    async fn load(&self, conversation_id: &ConversationId, generation: u64) -> SyncResult<OpenOutcome> {
        let live = match self.join(conversation_id).await {
            Ok(()) => {
                if !self.mark_joined(generation).await {
                    debug!(%conversation_id, "session: join landed after switching away; leaving");
                    self.leave(conversation_id).await;
                    return Ok(OpenOutcome::Superseded);
                }
                match self.live_history(conversation_id).await {
                    Ok(messages) => Some(messages),
                    Err(err) => {
                        warn!(%conversation_id, error = %err, "session: live history failed; fetching instead");
                        None
                    }
                }
            }
            Err(err) => {
                warn!(%conversation_id, error = %err, "session: join failed; fetching history instead");
                None
            }
        };

        let (source, messages) = match live {
            Some(messages) => (HistorySource::LiveChannel, messages),
            None => {
                if !self.is_current(generation).await {
                    return Ok(OpenOutcome::Superseded);
                }
                let fetch = self.history.fetch_history(conversation_id);
                match tokio::time::timeout(self.settings.history_timeout, fetch).await {
                    Ok(Ok(messages)) => (HistorySource::Fallback, messages),
                    Ok(Err(err)) => {
                        return self
                            .history_unavailable(conversation_id, generation, err.to_string())
                            .await
                    }
                    Err(_) => {
                        return self
                            .history_unavailable(conversation_id, generation, "timed out".into())
                            .await
                    }
                }
            }
        };

        let slot = self.active.lock().await;
        if slot.generation != generation {
            debug!(%conversation_id, "session: discarding history for superseded open");
            return Ok(OpenOutcome::Superseded);
        }
        let count = messages.len();
        self.store.lock().await.merge_history(conversation_id, messages);
        drop(slot);

        info!(%conversation_id, count, ?source, "session: history loaded");
        Ok(OpenOutcome::Loaded {
            source,
            messages: count,
        })
    }

    async fn join(&self, conversation_id: &ConversationId) -> SyncResult<()> {
        if !self.channel.is_connected() {
            return Err(SyncError::Disconnected);
        }
        let op = ClientOp::Join {
            conversation_id: conversation_id.clone(),
        };
        match self.channel.request(op, self.settings.join_timeout).await {
            Ok(_) => Ok(()),
            Err(SyncError::AckTimeout { .. }) => Err(SyncError::JoinTimeout {
                conversation_id: conversation_id.clone(),
            }),
            Err(SyncError::Rejected { reason, .. }) => Err(SyncError::JoinFailure {
                conversation_id: conversation_id.clone(),
                reason,
            }),
            Err(other) => Err(SyncError::JoinFailure {
                conversation_id: conversation_id.clone(),
                reason: other.to_string(),
            }),
        }
    }

    async fn live_history(&self, conversation_id: &ConversationId) -> SyncResult<Vec<Message>> {
        let op = ClientOp::History {
            conversation_id: conversation_id.clone(),
        };
        let data = self.channel.request(op, self.settings.history_timeout).await?;
        let response: HistoryResponse = serde_json::from_value(data)
            .map_err(|err| SyncError::InvalidPayload(format!("history ack: {err}")))?;
        let (messages, rejected) = response.into_messages(conversation_id);
        for err in &rejected {
            warn!(%conversation_id, %err, "session: dropping invalid history entry");
        }
        Ok(messages)
    }

    async fn leave(&self, conversation_id: &ConversationId) {
        if !self.channel.is_connected() {
            return;
        }
        let op = ClientOp::Leave {
            conversation_id: conversation_id.clone(),
        };
        if let Err(err) = self.channel.request(op, self.settings.join_timeout).await {
            debug!(%conversation_id, error = %err, "session: leave not acknowledged");
        }
    }

    async fn mark_joined(&self, generation: u64) -> bool {
        let mut slot = self.active.lock().await;
        if slot.generation != generation {
            return false;
        }
        slot.joined = true;
        true
    }

    async fn is_current(&self, generation: u64) -> bool {
        self.active.lock().await.generation == generation
    }

    async fn history_unavailable(
        &self,
        conversation_id: &ConversationId,
        generation: u64,
        reason: String,
    ) -> SyncResult<OpenOutcome> {
        let slot = self.active.lock().await;
        if slot.generation != generation {
            return Ok(OpenOutcome::Superseded);
        }
        self.store
            .lock()
            .await
            .mark_unavailable(conversation_id, reason.clone());
        drop(slot);

        warn!(%conversation_id, %reason, "session: history unavailable");
        Err(SyncError::HistoryUnavailable {
            conversation_id: conversation_id.clone(),
            reason,
        })
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
