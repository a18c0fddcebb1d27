//! Recency-ordered conversation list kept current by live pushes.

use chrono::{DateTime, Utc};
use shared::domain::{Conversation, ConversationId, Message, MessagePreview};
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListUpdate {
    /// First sighting of a conversation; participants beyond the sender are
    /// unknown until its details are fetched.
    Inserted { needs_details: bool },
    Updated,
    Unchanged,
}

#[derive(Debug, Clone)]
pub enum ListChange {
    Reloaded { count: usize },
    Updated {
        conversation_id: ConversationId,
        update: ListUpdate,
    },
}

#[derive(Debug, Clone)]
struct ListEntry {
    conversation: Conversation,
    details_pending: bool,
}

pub struct ConversationListSync {
    entries: Vec<ListEntry>,
    preview_chars: usize,
    changes: broadcast::Sender<ListChange>,
}

impl ConversationListSync {
    pub fn new(preview_chars: usize) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            entries: Vec::new(),
            preview_chars,
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ListChange> {
        self.changes.subscribe()
    }

    pub fn change_feed(&self) -> broadcast::Sender<ListChange> {
        self.changes.clone()
    }

    /// Merges a freshly fetched list. Conversations are never dropped locally,
    /// and a preview newer than the fetched one survives the reload.
    pub fn load(&mut self, conversations: Vec<Conversation>) -> usize {
        let count = conversations.len();
        for conversation in conversations {
            self.merge(conversation);
        }
        self.sort();
        info!(count, total = self.entries.len(), "list: loaded conversations");
        let _ = self.changes.send(ListChange::Reloaded { count });
        count
    }

    pub fn upsert(&mut self, conversation: Conversation) -> ListUpdate {
        let conversation_id = conversation.id.clone();
        let update = self.merge(conversation);
        self.sort();
        self.notify(conversation_id, update);
        update
    }

    pub fn apply_new_message(&mut self, message: &Message) -> ListUpdate {
        self.apply_preview(&message.conversation_id, message)
    }

    pub fn apply_conversation_updated(
        &mut self,
        conversation_id: &ConversationId,
        last_message: &Message,
    ) -> ListUpdate {
        self.apply_preview(conversation_id, last_message)
    }

    pub fn list(&self) -> Vec<Conversation> {
        self.entries
            .iter()
            .map(|entry| entry.conversation.clone())
            .collect()
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Option<Conversation> {
        self.position(conversation_id)
            .map(|index| self.entries[index].conversation.clone())
    }

    pub fn needs_details(&self, conversation_id: &ConversationId) -> bool {
        self.position(conversation_id)
            .is_some_and(|index| self.entries[index].details_pending)
    }

    fn apply_preview(&mut self, conversation_id: &ConversationId, message: &Message) -> ListUpdate {
        if message.id().is_none() {
            return ListUpdate::Unchanged;
        }
        let preview = MessagePreview::from_message(message, self.preview_chars);

        let update = match self.position(conversation_id) {
            Some(index) => {
                let conversation = &mut self.entries[index].conversation;
                if is_stale(conversation.last_message_at, message.created_at)
                    || conversation.last_message.as_ref() == Some(&preview)
                {
                    debug!(%conversation_id, "list: ignoring stale preview");
                    return ListUpdate::Unchanged;
                }
                conversation.last_message_at = Some(message.created_at);
                conversation.last_message = Some(preview);
                ListUpdate::Updated
            }
            None => {
                self.entries.push(ListEntry {
                    conversation: Conversation {
                        id: conversation_id.clone(),
                        participants: vec![message.sender.clone()],
                        last_message_at: Some(message.created_at),
                        last_message: Some(preview),
                    },
                    details_pending: true,
                });
                info!(%conversation_id, "list: conversation created by push");
                ListUpdate::Inserted {
                    needs_details: true,
                }
            }
        };
        self.sort();
        self.notify(conversation_id.clone(), update);
        update
    }

    fn merge(&mut self, incoming: Conversation) -> ListUpdate {
        let Some(index) = self.position(&incoming.id) else {
            self.entries.push(ListEntry {
                conversation: incoming,
                details_pending: false,
            });
            return ListUpdate::Inserted {
                needs_details: false,
            };
        };

        let entry = &mut self.entries[index];
        let current = &mut entry.conversation;
        let changed = current.participants != incoming.participants || entry.details_pending;
        current.participants = incoming.participants;
        entry.details_pending = false;

        let newer = match (current.last_message_at, incoming.last_message_at) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(current_at), Some(incoming_at)) => incoming_at > current_at,
        };
        if newer {
            current.last_message_at = incoming.last_message_at;
            current.last_message = incoming.last_message;
        }

        if changed || newer {
            ListUpdate::Updated
        } else {
            ListUpdate::Unchanged
        }
    }

    fn position(&self, conversation_id: &ConversationId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| &entry.conversation.id == conversation_id)
    }

    // Most recent first; conversations without messages sink to the end.
    fn sort(&mut self) {
        self.entries.sort_by(|a, b| {
            b.conversation
                .last_message_at
                .cmp(&a.conversation.last_message_at)
        });
    }

    fn notify(&self, conversation_id: ConversationId, update: ListUpdate) {
        if update != ListUpdate::Unchanged {
            let _ = self.changes.send(ListChange::Updated {
                conversation_id,
                update,
            });
        }
    }
}

fn is_stale(current: Option<DateTime<Utc>>, incoming: DateTime<Utc>) -> bool {
    current.is_some_and(|current| incoming < current)
}

#[cfg(test)]
#[path = "tests/conversation_list_tests.rs"]
mod tests;
