//! Fixtures, fakes and mock servers shared by the unit tests.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::Response,
    routing::get,
    Router,
};
use chrono::{DateTime, TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use shared::{
    domain::{
        Attachment, AttachmentKind, ClientTempId, Conversation, ConversationId, Delivery, Message,
        MessagePreview, UserId, UserRef,
    },
    protocol::{ClientFrame, ClientOp, WireMessage},
};
use tokio::sync::broadcast;
use url::Url;

use crate::{
    config::OfflinePolicy,
    error::{SyncError, SyncResult},
    protocol_client::FileUpload,
    transport::{Backoff, ChannelEvent, TransportSettings},
    AttachmentUploader, ConversationApi, HistoryApi, LiveChannel,
};

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .expect("valid timestamp")
}

pub fn sent_message(conversation: &str, id: &str, sender: &str, secs: i64, body: &str) -> Message {
    Message {
        conversation_id: ConversationId::from(conversation),
        sender: UserRef::new(sender),
        body: body.to_string(),
        attachments: Vec::new(),
        gif: None,
        created_at: at(secs),
        delivery: Delivery::Sent {
            id: id.into(),
            client_temp_id: None,
        },
    }
}

pub fn pending_message(
    conversation: &str,
    sender: &str,
    body: &str,
    client_temp_id: &ClientTempId,
    secs: i64,
) -> Message {
    let mut message = Message::pending(
        ConversationId::from(conversation),
        UserRef::new(sender),
        body,
        Vec::new(),
        None,
        client_temp_id.clone(),
    );
    message.created_at = at(secs);
    message
}

pub fn conversation(id: &str, participants: &[&str], last_secs: Option<i64>) -> Conversation {
    let last = last_secs.map(|secs| {
        let sender = participants.last().copied().unwrap_or("someone");
        sent_message(id, &format!("{id}-last"), sender, secs, "last")
    });
    Conversation {
        id: ConversationId::from(id),
        participants: participants.iter().map(|user| UserRef::new(*user)).collect(),
        last_message: last.as_ref().map(|message| MessagePreview::from_message(message, 80)),
        last_message_at: last.map(|message| message.created_at),
    }
}

pub fn history_ack(messages: &[Message]) -> Value {
    json!({ "messages": messages.iter().map(WireMessage::from).collect::<Vec<_>>() })
}

pub fn send_ack(message: &Message) -> Value {
    json!({ "message": WireMessage::from(message) })
}

/// Acks like the server: a send gets the stored message back with the client
/// temp id echoed, history is empty, everything else is a bare ack.
pub fn echo_send_ack(op: &ClientOp) -> FakeReply {
    match op {
        ClientOp::Send {
            conversation_id,
            client_temp_id,
            body,
            attachments,
            gif,
        } => {
            let stored = Message {
                conversation_id: conversation_id.clone(),
                sender: UserRef::new("alice"),
                body: body.clone(),
                attachments: attachments.clone(),
                gif: gif.clone(),
                created_at: at(100),
                delivery: Delivery::Sent {
                    id: format!("srv-{client_temp_id}").into(),
                    client_temp_id: Some(client_temp_id.clone()),
                },
            };
            FakeReply::ack(send_ack(&stored))
        }
        ClientOp::History { .. } => FakeReply::ack(history_ack(&[])),
        _ => FakeReply::ack(Value::Null),
    }
}

pub fn new_message_frame(message: &Message) -> Value {
    json!({
        "type": "new_message",
        "conversationId": message.conversation_id.as_str(),
        "message": WireMessage::from(message),
    })
}

pub fn transport_settings(url: Url) -> TransportSettings {
    TransportSettings {
        url,
        connect_timeout: Duration::from_secs(2),
        backoff: Backoff::new(Duration::from_millis(20), Duration::from_millis(80)),
        max_reconnect_attempts: Some(10),
        offline_policy: OfflinePolicy::Reject,
    }
}

pub enum FakeOutcome {
    Ack(Value),
    Reject(String),
    Silent,
}

pub struct FakeReply {
    pub delay: Duration,
    pub outcome: FakeOutcome,
}

impl FakeReply {
    pub fn ack(data: Value) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: FakeOutcome::Ack(data),
        }
    }

    pub fn reject(reason: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: FakeOutcome::Reject(reason.to_string()),
        }
    }

    pub fn silent() -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: FakeOutcome::Silent,
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type FakeBehaviour = Box<dyn Fn(&ClientOp) -> FakeReply + Send + Sync>;

/// In-memory live channel; replies are scripted per operation.
pub struct FakeChannel {
    connected: AtomicBool,
    events: broadcast::Sender<ChannelEvent>,
    requests: StdMutex<Vec<ClientOp>>,
    behaviour: FakeBehaviour,
}

impl FakeChannel {
    pub fn new(behaviour: impl Fn(&ClientOp) -> FakeReply + Send + Sync + 'static) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            connected: AtomicBool::new(true),
            events,
            requests: StdMutex::new(Vec::new()),
            behaviour: Box::new(behaviour),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn emit_event(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    pub fn requests(&self) -> Vec<ClientOp> {
        self.requests.lock().expect("request log").clone()
    }

    pub fn count(&self, op_name: &str) -> usize {
        self.requests()
            .iter()
            .filter(|op| op.name() == op_name)
            .count()
    }
}

#[async_trait]
impl LiveChannel for FakeChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request(&self, op: ClientOp, timeout: Duration) -> SyncResult<Value> {
        self.requests.lock().expect("request log").push(op.clone());
        if !self.is_connected() {
            return Err(SyncError::Disconnected);
        }
        let reply = (self.behaviour)(&op);
        match reply.outcome {
            FakeOutcome::Ack(value) if reply.delay < timeout => {
                tokio::time::sleep(reply.delay).await;
                Ok(value)
            }
            FakeOutcome::Reject(reason) if reply.delay < timeout => {
                tokio::time::sleep(reply.delay).await;
                Err(SyncError::Rejected {
                    op: op.name(),
                    reason,
                })
            }
            _ => {
                tokio::time::sleep(timeout).await;
                Err(SyncError::AckTimeout { op: op.name() })
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}

#[derive(Default)]
pub struct FakeHistory {
    pages: StdMutex<HashMap<ConversationId, Vec<Message>>>,
    delays: StdMutex<HashMap<ConversationId, Duration>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FakeHistory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_page(self: Arc<Self>, conversation: &str, messages: Vec<Message>) -> Arc<Self> {
        self.pages
            .lock()
            .expect("pages")
            .insert(ConversationId::from(conversation), messages);
        self
    }

    pub fn with_delay(self: Arc<Self>, conversation: &str, delay: Duration) -> Arc<Self> {
        self.delays
            .lock()
            .expect("delays")
            .insert(ConversationId::from(conversation), delay);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistoryApi for FakeHistory {
    async fn fetch_history(&self, conversation_id: &ConversationId) -> SyncResult<Vec<Message>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self
            .delays
            .lock()
            .expect("delays")
            .get(conversation_id)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::Network("history endpoint unreachable".into()));
        }
        Ok(self
            .pages
            .lock()
            .expect("pages")
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeUploader {
    failing: StdMutex<HashSet<String>>,
    uploaded: StdMutex<Vec<String>>,
}

impl FakeUploader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_on(&self, filename: &str) {
        self.failing
            .lock()
            .expect("failing set")
            .insert(filename.to_string());
    }

    pub fn uploaded(&self) -> Vec<String> {
        self.uploaded.lock().expect("upload log").clone()
    }
}

#[async_trait]
impl AttachmentUploader for FakeUploader {
    async fn upload(&self, file: &FileUpload) -> SyncResult<Attachment> {
        if self
            .failing
            .lock()
            .expect("failing set")
            .contains(&file.filename)
        {
            return Err(SyncError::Network("storage rejected the file".into()));
        }
        self.uploaded
            .lock()
            .expect("upload log")
            .push(file.filename.clone());
        let mimetype = file
            .mimetype
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        Ok(Attachment {
            kind: AttachmentKind::from_mimetype(&mimetype),
            url: format!("https://cdn.test/{}", file.filename),
            filename: file.filename.clone(),
            mimetype,
        })
    }
}

#[derive(Default)]
pub struct FakeConversations {
    listed: StdMutex<Vec<Conversation>>,
    details: StdMutex<HashMap<ConversationId, Conversation>>,
    detail_error: StdMutex<Option<SyncError>>,
    detail_calls: AtomicUsize,
}

impl FakeConversations {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_list(&self, conversations: Vec<Conversation>) {
        *self.listed.lock().expect("listed") = conversations;
    }

    pub fn add_details(&self, conversation: Conversation) {
        self.details
            .lock()
            .expect("details")
            .insert(conversation.id.clone(), conversation);
    }

    /// Makes every details fetch fail with `err` until cleared with `None`.
    pub fn fail_details_with(&self, err: Option<SyncError>) {
        *self.detail_error.lock().expect("detail error") = err;
    }

    pub fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConversationApi for FakeConversations {
    async fn list_conversations(&self) -> SyncResult<Vec<Conversation>> {
        Ok(self.listed.lock().expect("listed").clone())
    }

    async fn fetch_conversation(&self, conversation_id: &ConversationId) -> SyncResult<Conversation> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.detail_error.lock().expect("detail error").clone() {
            return Err(err);
        }
        self.details
            .lock()
            .expect("details")
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| SyncError::Rejected {
                op: "conversation",
                reason: "not found".into(),
            })
    }

    async fn open_direct(&self, peer: &UserId) -> SyncResult<Conversation> {
        let id = format!("dm-{peer}");
        Ok(conversation(&id, &["alice", peer.as_str()], None))
    }
}

/// What the mock live server writes back for one client frame.
pub enum ServerOut {
    Ack { ok: bool, error: Option<String>, data: Value },
    Frame(Value),
    /// Holds the remaining outputs back for the given duration.
    Pause(Duration),
    Close,
}

impl ServerOut {
    pub fn ok(data: Value) -> Self {
        Self::Ack {
            ok: true,
            error: None,
            data,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Ack {
            ok: false,
            error: Some(reason.to_string()),
            data: Value::Null,
        }
    }
}

type LiveBehaviour = Arc<dyn Fn(usize, &ClientOp) -> Vec<ServerOut> + Send + Sync>;

#[derive(Clone)]
struct LiveState {
    behaviour: LiveBehaviour,
    connections: Arc<AtomicUsize>,
    received: Arc<StdMutex<Vec<ClientOp>>>,
    pushes: broadcast::Sender<Value>,
}

pub struct MockLiveServer {
    addr: SocketAddr,
    state: LiveState,
}

impl MockLiveServer {
    pub fn ws_url(&self) -> Url {
        self.url_for("/ws")
    }

    pub fn url_for(&self, path: &str) -> Url {
        Url::parse(&format!("ws://{}{}", self.addr, path)).expect("mock url")
    }

    pub fn push(&self, frame: Value) {
        let _ = self.state.pushes.send(frame);
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<ClientOp> {
        self.state.received.lock().expect("received").clone()
    }
}

/// Accepts token `good` as user `alice` and acks every other operation.
pub fn default_reply(op: &ClientOp) -> Vec<ServerOut> {
    match op {
        ClientOp::Authenticate { token } if token == "good" => vec![ServerOut::ok(
            json!({ "user": { "id": "alice", "username": "alice" } }),
        )],
        ClientOp::Authenticate { .. } => vec![ServerOut::rejected("invalid token")],
        ClientOp::History { .. } => vec![ServerOut::ok(json!({ "messages": [] }))],
        _ => vec![ServerOut::ok(Value::Null)],
    }
}

pub async fn spawn_live_server(
    behaviour: impl Fn(usize, &ClientOp) -> Vec<ServerOut> + Send + Sync + 'static,
) -> MockLiveServer {
    let (pushes, _) = broadcast::channel(64);
    let state = LiveState {
        behaviour: Arc::new(behaviour),
        connections: Arc::new(AtomicUsize::new(0)),
        received: Arc::new(StdMutex::new(Vec::new())),
        pushes,
    };
    let app = Router::new()
        .route("/ws", get(upgrade))
        .route("/denied", get(|| async { StatusCode::UNAUTHORIZED }))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock live server");
    let addr = listener.local_addr().expect("mock live server addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve mock live server");
    });
    MockLiveServer { addr, state }
}

async fn upgrade(State(state): State<LiveState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_socket(state, socket))
}

async fn serve_socket(state: LiveState, socket: WebSocket) {
    let connection = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    let mut pushes = state.pushes.subscribe();
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            incoming = stream.next() => {
                let Some(Ok(message)) = incoming else { return };
                let AxumMessage::Text(text) = message else { continue };
                let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else { continue };
                state.received.lock().expect("received").push(frame.op.clone());

                for out in (state.behaviour)(connection, &frame.op) {
                    let value = match out {
                        ServerOut::Ack { ok, error, data } => json!({
                            "type": "ack",
                            "requestId": frame.request_id,
                            "ok": ok,
                            "error": error,
                            "data": data,
                        }),
                        ServerOut::Frame(value) => value,
                        ServerOut::Pause(duration) => {
                            tokio::time::sleep(duration).await;
                            continue;
                        }
                        ServerOut::Close => {
                            let _ = sink.close().await;
                            return;
                        }
                    };
                    if sink.send(AxumMessage::Text(value.to_string())).await.is_err() {
                        return;
                    }
                }
            }
            push = pushes.recv() => {
                let Ok(value) = push else { continue };
                if sink.send(AxumMessage::Text(value.to_string())).await.is_err() {
                    return;
                }
            }
        }
    }
}
