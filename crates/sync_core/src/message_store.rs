//! Canonical per-conversation message log.
//!
//! Entries are kept sorted by `(created_at, arrival)`; confirmed messages are
//! unique by server id and unsent ones by client temp id.

use std::collections::HashMap;

use shared::domain::{ClientTempId, ConversationId, Delivery, Message, MessageId};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const CHANGE_FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HistoryState {
    #[default]
    NotLoaded,
    Loading,
    Loaded,
    Unavailable {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    Updated,
    Reconciled,
    Duplicate,
    Ignored,
}

#[derive(Debug, Clone)]
pub enum StoreChange {
    Inserted {
        message: Message,
    },
    Updated {
        message: Message,
    },
    Reconciled {
        client_temp_id: ClientTempId,
        message: Message,
    },
    Failed {
        message: Message,
    },
    Removed {
        conversation_id: ConversationId,
        client_temp_id: ClientTempId,
    },
    HistoryMerged {
        conversation_id: ConversationId,
        added: usize,
    },
    HistoryStateChanged {
        conversation_id: ConversationId,
        state: HistoryState,
    },
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    arrival: u64,
}

#[derive(Debug, Default)]
struct ConversationLog {
    entries: Vec<Entry>,
    history: HistoryState,
}

impl ConversationLog {
    fn position_by_id(&self, id: &MessageId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.message.id() == Some(id))
    }

    fn position_unsent(&self, client_temp_id: &ClientTempId) -> Option<usize> {
        self.entries.iter().position(|entry| match &entry.message.delivery {
            Delivery::Pending { client_temp_id: key } | Delivery::Failed { client_temp_id: key, .. } => {
                key == client_temp_id
            }
            Delivery::Sent { .. } => false,
        })
    }

    fn insert_sorted(&mut self, entry: Entry) {
        let key = (entry.message.created_at, entry.arrival);
        let index = self
            .entries
            .partition_point(|existing| (existing.message.created_at, existing.arrival) < key);
        self.entries.insert(index, entry);
    }

    /// Replaces the entry at `index`, keeping its arrival rank so it only moves
    /// if the new timestamp demands it.
    fn replace_at(&mut self, index: usize, message: Message) {
        let arrival = self.entries.remove(index).arrival;
        self.insert_sorted(Entry { message, arrival });
    }
}

pub struct MessageStore {
    logs: HashMap<ConversationId, ConversationLog>,
    unsent_index: HashMap<ClientTempId, ConversationId>,
    next_arrival: u64,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            logs: HashMap::new(),
            unsent_index: HashMap::new(),
            next_arrival: 0,
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Sender half of the change feed, for subscribing without holding the store.
    pub fn change_feed(&self) -> broadcast::Sender<StoreChange> {
        self.changes.clone()
    }

    /// Merges a server-confirmed message. Re-delivery of a known id updates the
    /// existing entry in place; an echo carrying a client temp id settles the
    /// matching unsent entry.
    pub fn append(&mut self, message: Message) -> AppendOutcome {
        let (outcome, change) = self.merge_confirmed(message);
        if let Some(change) = change {
            self.notify(change);
        }
        outcome
    }

    pub fn append_optimistic(&mut self, message: Message) -> AppendOutcome {
        let Delivery::Pending { client_temp_id } = &message.delivery else {
            warn!(
                conversation_id = %message.conversation_id,
                "store: optimistic append ignored for non-pending message"
            );
            return AppendOutcome::Ignored;
        };
        let client_temp_id = client_temp_id.clone();
        let conversation_id = message.conversation_id.clone();
        let arrival = self.allocate_arrival();

        let log = self.logs.entry(conversation_id.clone()).or_default();
        let outcome = match log.position_unsent(&client_temp_id) {
            Some(index) => {
                log.replace_at(index, message.clone());
                AppendOutcome::Updated
            }
            None => {
                log.insert_sorted(Entry {
                    message: message.clone(),
                    arrival,
                });
                AppendOutcome::Inserted
            }
        };
        self.unsent_index.insert(client_temp_id, conversation_id);

        self.notify(match outcome {
            AppendOutcome::Inserted => StoreChange::Inserted { message },
            _ => StoreChange::Updated { message },
        });
        outcome
    }

    /// Swaps the unsent entry keyed by `client_temp_id` for the authoritative
    /// server copy.
    pub fn reconcile(&mut self, client_temp_id: &ClientTempId, server_message: Message) -> AppendOutcome {
        let Some(id) = server_message.id().cloned() else {
            warn!(%client_temp_id, "store: reconcile ignored for unconfirmed server message");
            return AppendOutcome::Ignored;
        };
        let message = Message {
            delivery: Delivery::Sent {
                id: id.clone(),
                client_temp_id: Some(client_temp_id.clone()),
            },
            ..server_message
        };
        self.unsent_index.remove(client_temp_id);
        let arrival = self.allocate_arrival();

        let log = self.logs.entry(message.conversation_id.clone()).or_default();
        let outcome = match (log.position_unsent(client_temp_id), log.position_by_id(&id)) {
            (Some(pending_index), Some(_)) => {
                // The push echo landed first; fold the optimistic entry into it.
                log.entries.remove(pending_index);
                if let Some(existing_index) = log.position_by_id(&id) {
                    log.replace_at(existing_index, message.clone());
                }
                AppendOutcome::Reconciled
            }
            (Some(pending_index), None) => {
                log.replace_at(pending_index, message.clone());
                AppendOutcome::Reconciled
            }
            (None, Some(existing_index)) => {
                log.replace_at(existing_index, message.clone());
                AppendOutcome::Updated
            }
            (None, None) => {
                log.insert_sorted(Entry {
                    message: message.clone(),
                    arrival,
                });
                AppendOutcome::Inserted
            }
        };

        debug!(%client_temp_id, message_id = %id, ?outcome, "store: reconciled send");
        self.notify(match outcome {
            AppendOutcome::Reconciled => StoreChange::Reconciled {
                client_temp_id: client_temp_id.clone(),
                message,
            },
            AppendOutcome::Inserted => StoreChange::Inserted { message },
            _ => StoreChange::Updated { message },
        });
        outcome
    }

    /// Moves a pending entry to `Failed`, keeping it visible for retry.
    pub fn mark_failed(&mut self, client_temp_id: &ClientTempId, reason: impl Into<String>) -> Option<Message> {
        let conversation_id = self.unsent_index.get(client_temp_id)?.clone();
        let log = self.logs.get_mut(&conversation_id)?;
        let index = log.position_unsent(client_temp_id)?;
        let entry = &mut log.entries[index];
        entry.message.delivery = Delivery::Failed {
            client_temp_id: client_temp_id.clone(),
            reason: reason.into(),
        };
        let message = entry.message.clone();
        self.notify(StoreChange::Failed {
            message: message.clone(),
        });
        Some(message)
    }

    /// Deletes an unsent (pending or failed) entry.
    pub fn remove(&mut self, client_temp_id: &ClientTempId) -> Option<Message> {
        let conversation_id = self.unsent_index.remove(client_temp_id)?;
        let log = self.logs.get_mut(&conversation_id)?;
        let index = log.position_unsent(client_temp_id)?;
        let removed = log.entries.remove(index).message;
        self.notify(StoreChange::Removed {
            conversation_id,
            client_temp_id: client_temp_id.clone(),
        });
        Some(removed)
    }

    pub fn list(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.logs
            .get(conversation_id)
            .map(|log| log.entries.iter().map(|entry| entry.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn unsent(&self, client_temp_id: &ClientTempId) -> Option<Message> {
        let conversation_id = self.unsent_index.get(client_temp_id)?;
        let log = self.logs.get(conversation_id)?;
        log.position_unsent(client_temp_id)
            .map(|index| log.entries[index].message.clone())
    }

    pub fn last_confirmed(&self, conversation_id: &ConversationId) -> Option<Message> {
        self.logs.get(conversation_id).and_then(|log| {
            log.entries
                .iter()
                .rev()
                .find(|entry| entry.message.id().is_some())
                .map(|entry| entry.message.clone())
        })
    }

    pub fn conversation_ids(&self) -> Vec<ConversationId> {
        self.logs.keys().cloned().collect()
    }

    pub fn history_state(&self, conversation_id: &ConversationId) -> HistoryState {
        self.logs
            .get(conversation_id)
            .map(|log| log.history.clone())
            .unwrap_or_default()
    }

    /// Marks a history load as in flight unless the log is already populated.
    pub fn begin_loading(&mut self, conversation_id: &ConversationId) {
        let log = self.logs.entry(conversation_id.clone()).or_default();
        if log.history != HistoryState::Loaded {
            self.set_history_state(conversation_id, HistoryState::Loading);
        }
    }

    /// Drops confirmed entries for the conversation; unsent ones stay so they
    /// can still be retried or discarded.
    pub fn mark_unavailable(&mut self, conversation_id: &ConversationId, reason: impl Into<String>) {
        if let Some(log) = self.logs.get_mut(conversation_id) {
            let before = log.entries.len();
            log.entries.retain(|entry| entry.message.id().is_none());
            let dropped = before - log.entries.len();
            if dropped > 0 {
                debug!(%conversation_id, dropped, "store: cleared confirmed entries");
            }
        }
        self.set_history_state(
            conversation_id,
            HistoryState::Unavailable {
                reason: reason.into(),
            },
        );
    }

    /// Folds a fetched page into the log; returns how many entries were new.
    pub fn merge_history(&mut self, conversation_id: &ConversationId, messages: Vec<Message>) -> usize {
        let mut added = 0;
        for message in messages {
            if &message.conversation_id != conversation_id {
                warn!(
                    %conversation_id,
                    other = %message.conversation_id,
                    "store: dropping history entry for another conversation"
                );
                continue;
            }
            let (outcome, _) = self.merge_confirmed(message);
            if matches!(outcome, AppendOutcome::Inserted | AppendOutcome::Reconciled) {
                added += 1;
            }
        }
        self.logs.entry(conversation_id.clone()).or_default().history = HistoryState::Loaded;
        self.notify(StoreChange::HistoryMerged {
            conversation_id: conversation_id.clone(),
            added,
        });
        added
    }

    fn merge_confirmed(&mut self, message: Message) -> (AppendOutcome, Option<StoreChange>) {
        let Delivery::Sent { id, client_temp_id } = &message.delivery else {
            warn!(
                conversation_id = %message.conversation_id,
                "store: append ignored for unconfirmed message"
            );
            return (AppendOutcome::Ignored, None);
        };
        let id = id.clone();
        let echoed_temp_id = client_temp_id.clone();
        let arrival = self.allocate_arrival();
        let log = self.logs.entry(message.conversation_id.clone()).or_default();

        if let Some(index) = log.position_by_id(&id) {
            let existing = &log.entries[index].message;
            let merged = Message {
                delivery: Delivery::Sent {
                    id,
                    client_temp_id: echoed_temp_id.or_else(|| existing.client_temp_id().cloned()),
                },
                ..message
            };
            if existing == &merged {
                return (AppendOutcome::Duplicate, None);
            }
            log.replace_at(index, merged.clone());
            return (AppendOutcome::Updated, Some(StoreChange::Updated { message: merged }));
        }

        if let Some(client_temp_id) = echoed_temp_id {
            if let Some(index) = log.position_unsent(&client_temp_id) {
                log.replace_at(index, message.clone());
                self.unsent_index.remove(&client_temp_id);
                return (
                    AppendOutcome::Reconciled,
                    Some(StoreChange::Reconciled {
                        client_temp_id,
                        message,
                    }),
                );
            }
        }

        log.insert_sorted(Entry {
            message: message.clone(),
            arrival,
        });
        (AppendOutcome::Inserted, Some(StoreChange::Inserted { message }))
    }

    fn set_history_state(&mut self, conversation_id: &ConversationId, state: HistoryState) {
        self.logs.entry(conversation_id.clone()).or_default().history = state.clone();
        self.notify(StoreChange::HistoryStateChanged {
            conversation_id: conversation_id.clone(),
            state,
        });
    }

    fn allocate_arrival(&mut self) -> u64 {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        arrival
    }

    fn notify(&self, change: StoreChange) {
        let _ = self.changes.send(change);
    }
}

#[cfg(test)]
#[path = "tests/message_store_tests.rs"]
mod tests;
