pub mod config;
pub mod conversation_list;
pub mod error;
pub mod message_store;
pub mod protocol_client;
pub mod send_pipeline;
pub mod session;
pub mod transport;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::{Attachment, ClientTempId, Conversation, ConversationId, Delivery, Message, UserId, UserRef},
    protocol::ClientOp,
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    conversation_list::{ConversationListSync, ListChange, ListUpdate},
    error::{SyncError, SyncResult},
    message_store::{HistoryState, MessageStore, StoreChange},
    protocol_client::{FileUpload, HttpApi},
    send_pipeline::{OutgoingMessage, SendPipeline, SendSettings, SendTicket},
    session::{ConversationSession, OpenOutcome, SessionSettings},
    transport::{ChannelEvent, ConnectionManager, ConnectionState, PushEvent, TransportSettings},
};

pub use crate::config::load_settings;

/// Request/ack transport plus the server push feed.
#[async_trait]
pub trait LiveChannel: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn request(&self, op: ClientOp, timeout: Duration) -> SyncResult<Value>;
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;
}

#[async_trait]
pub trait HistoryApi: Send + Sync {
    async fn fetch_history(&self, conversation_id: &ConversationId) -> SyncResult<Vec<Message>>;
}

#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn list_conversations(&self) -> SyncResult<Vec<Conversation>>;
    async fn fetch_conversation(&self, conversation_id: &ConversationId) -> SyncResult<Conversation>;
    async fn open_direct(&self, peer: &UserId) -> SyncResult<Conversation>;
}

#[async_trait]
pub trait AttachmentUploader: Send + Sync {
    async fn upload(&self, file: &FileUpload) -> SyncResult<Attachment>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected { reconnected: bool },
    ConnectionLost { reason: String, will_reconnect: bool },
    ReconnectAbandoned { attempts: u32 },
    /// The token stopped being accepted; a new session is required.
    AuthExpired { reason: String },
    SendFailed {
        conversation_id: ConversationId,
        client_temp_id: ClientTempId,
        reason: String,
    },
    Error(String),
}

/// The collaborators `ChatClient` is wired from.
pub struct ClientDependencies {
    pub channel: Arc<dyn LiveChannel>,
    pub history: Arc<dyn HistoryApi>,
    pub conversations: Arc<dyn ConversationApi>,
    pub uploader: Arc<dyn AttachmentUploader>,
}

pub struct ChatClient {
    local_user: UserRef,
    connection: Option<Arc<ConnectionManager>>,
    conversations_api: Arc<dyn ConversationApi>,
    store: Arc<Mutex<MessageStore>>,
    list: Arc<Mutex<ConversationListSync>>,
    session: Arc<ConversationSession>,
    pipeline: Arc<SendPipeline>,
    events: broadcast::Sender<ClientEvent>,
    store_feed: broadcast::Sender<StoreChange>,
    list_feed: broadcast::Sender<ListChange>,
    router: JoinHandle<()>,
}

impl ChatClient {
    /// Opens the live channel with `auth_token` and wires the HTTP endpoints
    /// from the same settings.
    pub async fn connect(settings: ClientSettings, auth_token: &str) -> SyncResult<Arc<Self>> {
        settings.validate()?;
        let connection = ConnectionManager::new(TransportSettings::from_client_settings(&settings)?);
        let local_user = connection.connect(auth_token).await?;
        let http = Arc::new(HttpApi::new(&settings, auth_token)?);

        let dependencies = ClientDependencies {
            channel: connection.clone(),
            history: http.clone(),
            conversations: http.clone(),
            uploader: http,
        };
        Ok(Self::assemble(
            dependencies,
            local_user,
            &settings,
            Some(connection),
        ))
    }

    /// Builds a client over caller-supplied collaborators.
    pub fn with_dependencies(
        dependencies: ClientDependencies,
        local_user: UserRef,
        settings: &ClientSettings,
    ) -> Arc<Self> {
        Self::assemble(dependencies, local_user, settings, None)
    }

    fn assemble(
        dependencies: ClientDependencies,
        local_user: UserRef,
        settings: &ClientSettings,
        connection: Option<Arc<ConnectionManager>>,
    ) -> Arc<Self> {
        let store = MessageStore::new();
        let store_feed = store.change_feed();
        let store = Arc::new(Mutex::new(store));
        let list = ConversationListSync::new(settings.preview_chars);
        let list_feed = list.change_feed();
        let list = Arc::new(Mutex::new(list));

        let session = Arc::new(ConversationSession::new(
            dependencies.channel.clone(),
            dependencies.history,
            store.clone(),
            SessionSettings::from(settings),
        ));
        let pipeline = SendPipeline::new(
            dependencies.channel.clone(),
            dependencies.uploader,
            store.clone(),
            local_user.clone(),
            SendSettings::from(settings),
        );
        let (events, _) = broadcast::channel(256);

        let router = EventRouter {
            store: store.clone(),
            list: list.clone(),
            session: session.clone(),
            conversations_api: dependencies.conversations.clone(),
            events: events.clone(),
        };
        let router = tokio::spawn(router.run(dependencies.channel.subscribe(), store_feed.subscribe()));

        info!(user_id = %local_user.id, "client: ready");
        Arc::new(Self {
            local_user,
            connection,
            conversations_api: dependencies.conversations,
            store,
            list,
            session,
            pipeline,
            events,
            store_feed,
            list_feed,
            router,
        })
    }

    pub fn local_user(&self) -> &UserRef {
        &self.local_user
    }

    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.connection.as_ref().map(|connection| connection.state())
    }

    pub fn watch_connection(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.connection.as_ref().map(|connection| connection.watch_state())
    }

    pub async fn open(&self, conversation_id: &ConversationId) -> SyncResult<OpenOutcome> {
        self.session.open(conversation_id).await
    }

    pub async fn close(&self, conversation_id: &ConversationId) {
        self.session.close(conversation_id).await
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.session.active_conversation().await
    }

    pub async fn send(&self, outgoing: OutgoingMessage) -> SyncResult<SendTicket> {
        self.pipeline.send(outgoing).await
    }

    pub async fn retry(&self, client_temp_id: &ClientTempId) -> SyncResult<SendTicket> {
        self.pipeline.retry(client_temp_id).await
    }

    /// Drops a failed message instead of retrying it.
    pub async fn discard_failed(&self, client_temp_id: &ClientTempId) -> SyncResult<Message> {
        let mut store = self.store.lock().await;
        let removed = match store.unsent(client_temp_id) {
            Some(message) if matches!(message.delivery, Delivery::Failed { .. }) => {
                store.remove(client_temp_id)
            }
            _ => None,
        };
        removed.ok_or_else(|| SyncError::UnknownMessage {
            client_temp_id: client_temp_id.clone(),
        })
    }

    pub async fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.store.lock().await.list(conversation_id)
    }

    pub async fn history_state(&self, conversation_id: &ConversationId) -> HistoryState {
        self.store.lock().await.history_state(conversation_id)
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.list.lock().await.list()
    }

    pub async fn refresh_conversations(&self) -> SyncResult<usize> {
        let conversations = self.conversations_api.list_conversations().await?;
        Ok(self.list.lock().await.load(conversations))
    }

    /// Finds or creates the direct conversation with `peer`.
    pub async fn open_direct(&self, peer: &UserId) -> SyncResult<Conversation> {
        if peer == &self.local_user.id {
            return Err(SyncError::InvalidPayload(
                "cannot open a conversation with yourself".into(),
            ));
        }
        let conversation = self.conversations_api.open_direct(peer).await?;
        self.list.lock().await.upsert(conversation.clone());
        Ok(conversation)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<StoreChange> {
        self.store_feed.subscribe()
    }

    pub fn subscribe_conversations(&self) -> broadcast::Receiver<ListChange> {
        self.list_feed.subscribe()
    }

    pub async fn disconnect(&self) {
        if let Some(active) = self.session.active_conversation().await {
            self.session.close(&active).await;
        }
        if let Some(connection) = &self.connection {
            connection.disconnect().await;
        }
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.router.abort();
    }
}

/// Fans channel pushes and store changes out to the store and the list.
struct EventRouter {
    store: Arc<Mutex<MessageStore>>,
    list: Arc<Mutex<ConversationListSync>>,
    session: Arc<ConversationSession>,
    conversations_api: Arc<dyn ConversationApi>,
    events: broadcast::Sender<ClientEvent>,
}

impl EventRouter {
    async fn run(
        self,
        mut channel_events: broadcast::Receiver<ChannelEvent>,
        mut store_changes: broadcast::Receiver<StoreChange>,
    ) {
        loop {
            tokio::select! {
                event = channel_events.recv() => match event {
                    Ok(event) => self.on_channel_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "client: push feed lagged; resyncing");
                        self.spawn_resync();
                    }
                    Err(RecvError::Closed) => break,
                },
                change = store_changes.recv() => match change {
                    Ok(change) => self.on_store_change(change).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "client: store feed lagged; recomputing previews");
                        self.refresh_previews().await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("client: event router stopped");
    }

    async fn on_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Push(PushEvent::NewMessage {
                conversation_id,
                message,
            }) => {
                let update = self.list.lock().await.apply_new_message(&message);
                self.fetch_details_if_needed(&conversation_id, update);
                self.append_if_active(&conversation_id, message).await;
            }
            ChannelEvent::Push(PushEvent::ConversationUpdated {
                conversation_id,
                last_message,
            }) => {
                let update = self
                    .list
                    .lock()
                    .await
                    .apply_conversation_updated(&conversation_id, &last_message);
                self.fetch_details_if_needed(&conversation_id, update);
                self.append_if_active(&conversation_id, last_message).await;
            }
            ChannelEvent::Connected { reconnected } => {
                let _ = self.events.send(ClientEvent::Connected { reconnected });
                if reconnected {
                    self.spawn_resync();
                }
            }
            ChannelEvent::Disconnected {
                reason,
                will_reconnect,
            } => {
                let _ = self.events.send(ClientEvent::ConnectionLost {
                    reason,
                    will_reconnect,
                });
            }
            ChannelEvent::AuthRejected { reason } => {
                let _ = self.events.send(ClientEvent::AuthExpired { reason });
            }
            ChannelEvent::GaveUp { attempts } => {
                let _ = self.events.send(ClientEvent::ReconnectAbandoned { attempts });
            }
        }
    }

    async fn on_store_change(&self, change: StoreChange) {
        match change {
            StoreChange::Inserted { message }
            | StoreChange::Updated { message }
            | StoreChange::Reconciled { message, .. } => {
                if message.id().is_some() {
                    let update = self.list.lock().await.apply_new_message(&message);
                    self.fetch_details_if_needed(&message.conversation_id, update);
                }
            }
            StoreChange::HistoryMerged {
                conversation_id, ..
            } => {
                let last = self.store.lock().await.last_confirmed(&conversation_id);
                if let Some(last) = last {
                    let update = self.list.lock().await.apply_new_message(&last);
                    self.fetch_details_if_needed(&conversation_id, update);
                }
            }
            StoreChange::Failed { message } => {
                if let Delivery::Failed {
                    client_temp_id,
                    reason,
                } = message.delivery
                {
                    let _ = self.events.send(ClientEvent::SendFailed {
                        conversation_id: message.conversation_id,
                        client_temp_id,
                        reason,
                    });
                }
            }
            StoreChange::Removed { .. } | StoreChange::HistoryStateChanged { .. } => {}
        }
    }

    /// Re-derives list previews from the store for changes the router missed.
    async fn refresh_previews(&self) {
        let latest: Vec<Message> = {
            let store = self.store.lock().await;
            store
                .conversation_ids()
                .iter()
                .filter_map(|conversation_id| store.last_confirmed(conversation_id))
                .collect()
        };
        for message in latest {
            let update = self.list.lock().await.apply_new_message(&message);
            self.fetch_details_if_needed(&message.conversation_id, update);
        }
    }

    async fn append_if_active(&self, conversation_id: &ConversationId, message: Message) {
        if self.session.active_conversation().await.as_ref() == Some(conversation_id) {
            self.store.lock().await.append(message);
        }
    }

    fn fetch_details_if_needed(&self, conversation_id: &ConversationId, update: ListUpdate) {
        if update != (ListUpdate::Inserted { needs_details: true }) {
            return;
        }
        let api = self.conversations_api.clone();
        let list = self.list.clone();
        let events = self.events.clone();
        let conversation_id = conversation_id.clone();
        tokio::spawn(async move {
            match api.fetch_conversation(&conversation_id).await {
                Ok(conversation) => {
                    list.lock().await.upsert(conversation);
                }
                Err(err) => {
                    warn!(%conversation_id, error = %err, "list: could not fetch conversation details");
                    surface(&events, &err);
                }
            }
        });
    }

    /// Rejoins the open conversation and reloads the list after a gap in the
    /// push feed.
    fn spawn_resync(&self) {
        let session = self.session.clone();
        let list = self.list.clone();
        let api = self.conversations_api.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Some(Err(err)) = session.resync_active().await {
                warn!(error = %err, "session: resync after reconnect failed");
                surface(&events, &err);
            }
            match api.list_conversations().await {
                Ok(conversations) => {
                    list.lock().await.load(conversations);
                }
                Err(err) => warn!(error = %err, "list: reload after reconnect failed"),
            }
        });
    }
}

/// Forwards background failures to subscribers unless the transport will
/// recover from them on its own.
fn surface(events: &broadcast::Sender<ClientEvent>, err: &SyncError) {
    if err.is_transient() {
        debug!(error = %err, "client: transient failure not surfaced");
        return;
    }
    let _ = events.send(ClientEvent::Error(err.to_string()));
}

/// What the console (or any other front end) drives.
#[async_trait]
pub trait ClientHandle: Send + Sync {
    fn local_user(&self) -> UserRef;
    async fn open(&self, conversation_id: &ConversationId) -> SyncResult<OpenOutcome>;
    async fn close(&self, conversation_id: &ConversationId);
    async fn active_conversation(&self) -> Option<ConversationId>;
    async fn send(&self, outgoing: OutgoingMessage) -> SyncResult<SendTicket>;
    async fn retry(&self, client_temp_id: &ClientTempId) -> SyncResult<SendTicket>;
    async fn discard_failed(&self, client_temp_id: &ClientTempId) -> SyncResult<Message>;
    async fn messages(&self, conversation_id: &ConversationId) -> Vec<Message>;
    async fn conversations(&self) -> Vec<Conversation>;
    async fn refresh_conversations(&self) -> SyncResult<usize>;
    async fn open_direct(&self, peer: &UserId) -> SyncResult<Conversation>;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
    fn subscribe_messages(&self) -> broadcast::Receiver<StoreChange>;
    /// `None` when the client was built without a live connection.
    fn watch_connection(&self) -> Option<watch::Receiver<ConnectionState>>;
    async fn disconnect(&self);
}

#[async_trait]
impl ClientHandle for Arc<ChatClient> {
    fn local_user(&self) -> UserRef {
        ChatClient::local_user(self).clone()
    }

    async fn open(&self, conversation_id: &ConversationId) -> SyncResult<OpenOutcome> {
        ChatClient::open(self, conversation_id).await
    }

    async fn close(&self, conversation_id: &ConversationId) {
        ChatClient::close(self, conversation_id).await
    }

    async fn active_conversation(&self) -> Option<ConversationId> {
        ChatClient::active_conversation(self).await
    }

    async fn send(&self, outgoing: OutgoingMessage) -> SyncResult<SendTicket> {
        ChatClient::send(self, outgoing).await
    }

    async fn retry(&self, client_temp_id: &ClientTempId) -> SyncResult<SendTicket> {
        ChatClient::retry(self, client_temp_id).await
    }

    async fn discard_failed(&self, client_temp_id: &ClientTempId) -> SyncResult<Message> {
        ChatClient::discard_failed(self, client_temp_id).await
    }

    async fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        ChatClient::messages(self, conversation_id).await
    }

    async fn conversations(&self) -> Vec<Conversation> {
        ChatClient::conversations(self).await
    }

    async fn refresh_conversations(&self) -> SyncResult<usize> {
        ChatClient::refresh_conversations(self).await
    }

    async fn open_direct(&self, peer: &UserId) -> SyncResult<Conversation> {
        ChatClient::open_direct(self, peer).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        ChatClient::subscribe(self)
    }

    fn subscribe_messages(&self) -> broadcast::Receiver<StoreChange> {
        ChatClient::subscribe_messages(self)
    }

    fn watch_connection(&self) -> Option<watch::Receiver<ConnectionState>> {
        ChatClient::watch_connection(self)
    }

    async fn disconnect(&self) {
        ChatClient::disconnect(self).await
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
