//! Authenticated live channel with request/ack correlation and reconnect.
//!
//! A single background task owns the websocket. Callers talk to it over an
//! mpsc command channel; server pushes fan out on a broadcast channel.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use shared::{
    domain::{ConversationId, Message, UserRef},
    protocol::{AuthAck, ClientFrame, ClientOp, ServerFrame},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::{ClientSettings, OfflinePolicy},
    error::{SyncError, SyncResult},
    LiveChannel,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Responder = oneshot::Sender<SyncResult<Value>>;

const EVENT_CAPACITY: usize = 1024;
const COMMAND_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum PushEvent {
    NewMessage {
        conversation_id: ConversationId,
        message: Message,
    },
    ConversationUpdated {
        conversation_id: ConversationId,
        last_message: Message,
    },
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Connected { reconnected: bool },
    Disconnected { reason: String, will_reconnect: bool },
    Push(PushEvent),
    /// The server refused the token on a reconnect; the channel is closed.
    AuthRejected { reason: String },
    /// Reconnect attempts ran out; the channel is closed.
    GaveUp { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay after `failures` consecutive failed attempts. The first retry
    /// after losing a live session is immediate.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(failures - 1);
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub url: Url,
    pub connect_timeout: Duration,
    pub backoff: Backoff,
    pub max_reconnect_attempts: Option<u32>,
    pub offline_policy: OfflinePolicy,
}

impl TransportSettings {
    pub fn from_client_settings(settings: &ClientSettings) -> SyncResult<Self> {
        Ok(Self {
            url: settings.live_url()?,
            connect_timeout: settings.connect_timeout(),
            backoff: Backoff::new(
                Duration::from_millis(settings.reconnect_base_delay_ms),
                Duration::from_millis(settings.reconnect_max_delay_ms),
            ),
            max_reconnect_attempts: settings.max_reconnect_attempts,
            offline_policy: settings.offline_policy,
        })
    }
}

enum Command {
    Request { op: ClientOp, responder: Responder },
    Shutdown,
}

struct ConnectionLink {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl ConnectionLink {
    async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        let _ = self.task.await;
    }
}

pub struct ConnectionManager {
    settings: TransportSettings,
    events: broadcast::Sender<ChannelEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    link: Mutex<Option<ConnectionLink>>,
}

impl ConnectionManager {
    pub fn new(settings: TransportSettings) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Idle);
        Arc::new(Self {
            settings,
            events,
            state: Arc::new(state),
            link: Mutex::new(None),
        })
    }

    /// Opens the channel and authenticates. Resolves with the user the server
    /// bound the token to. Failures of this first attempt are not retried.
    pub async fn connect(&self, auth_token: &str) -> SyncResult<UserRef> {
        let mut link = self.link.lock().await;
        if let Some(existing) = link.take() {
            debug!("transport: replacing existing connection");
            existing.shutdown().await;
        }

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let worker = ConnectionWorker {
            settings: self.settings.clone(),
            token: auth_token.to_string(),
            events: self.events.clone(),
            state: Arc::clone(&self.state),
            next_request_id: 1,
            outbox: VecDeque::new(),
        };
        let task = tokio::spawn(worker.run(commands_rx, ready_tx));

        match ready_rx.await {
            Ok(Ok(user)) => {
                *link = Some(ConnectionLink {
                    commands: commands_tx,
                    task,
                });
                Ok(user)
            }
            Ok(Err(err)) => {
                let _ = task.await;
                Err(err)
            }
            Err(_) => Err(SyncError::Network(
                "connection task ended before the handshake completed".into(),
            )),
        }
    }

    /// Sends `op` and waits for its correlated ack.
    pub async fn emit(&self, op: ClientOp, timeout: Duration) -> SyncResult<Value> {
        let op_name = op.name();
        let commands = self
            .link
            .lock()
            .await
            .as_ref()
            .map(|link| link.commands.clone())
            .ok_or(SyncError::NotConnected)?;

        let (responder, response) = oneshot::channel();
        commands
            .send(Command::Request { op, responder })
            .await
            .map_err(|_| SyncError::Disconnected)?;

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::Disconnected),
            Err(_) => Err(SyncError::AckTimeout { op: op_name }),
        }
    }

    /// Idempotent; pending requests fail with `Disconnected`.
    pub async fn disconnect(&self) {
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            link.shutdown().await;
        }
        self.state.send_replace(ConnectionState::Closed);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

#[async_trait]
impl LiveChannel for ConnectionManager {
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    async fn request(&self, op: ClientOp, timeout: Duration) -> SyncResult<Value> {
        self.emit(op, timeout).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}

struct InFlight {
    op: &'static str,
    responder: Responder,
}

struct QueuedRequest {
    op: ClientOp,
    responder: Responder,
}

enum SessionExit {
    Shutdown,
    Lost(String),
}

enum BackoffExit {
    Elapsed,
    Shutdown,
}

enum Handshake {
    Done(SyncResult<(Socket, UserRef)>),
    Shutdown,
}

struct AckOutcome {
    ok: bool,
    error: Option<String>,
    data: Value,
}

struct ConnectionWorker {
    settings: TransportSettings,
    token: String,
    events: broadcast::Sender<ChannelEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    next_request_id: u64,
    outbox: VecDeque<QueuedRequest>,
}

impl ConnectionWorker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        ready: oneshot::Sender<SyncResult<UserRef>>,
    ) {
        let mut ready = Some(ready);
        let mut failures: u32 = 0;

        loop {
            let reconnecting = ready.is_none();
            self.state.send_replace(if reconnecting {
                ConnectionState::Reconnecting {
                    attempt: failures + 1,
                }
            } else {
                ConnectionState::Connecting
            });

            let attempt = match self.handshake(&mut commands).await {
                Handshake::Done(attempt) => attempt,
                Handshake::Shutdown => {
                    info!("transport: shutdown during handshake");
                    self.close(SyncError::Disconnected);
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(SyncError::Disconnected));
                    }
                    return;
                }
            };

            let socket = match attempt {
                Ok((socket, user)) => {
                    failures = 0;
                    self.state.send_replace(ConnectionState::Connected);
                    info!(url = %self.settings.url, reconnected = reconnecting, "transport: live channel up");
                    let _ = self.events.send(ChannelEvent::Connected {
                        reconnected: reconnecting,
                    });
                    if let Some(ready) = ready.take() {
                        info!(user_id = %user.id, "transport: authenticated");
                        let _ = ready.send(Ok(user));
                    }
                    socket
                }
                Err(err) => {
                    if let Some(ready) = ready.take() {
                        warn!(error = %err, "transport: initial connect failed");
                        self.state.send_replace(ConnectionState::Closed);
                        let _ = ready.send(Err(err));
                        return;
                    }
                    if let SyncError::Auth(reason) = err {
                        warn!(%reason, "transport: token rejected on reconnect; closing");
                        self.close(SyncError::Auth(reason.clone()));
                        let _ = self.events.send(ChannelEvent::AuthRejected { reason });
                        return;
                    }

                    failures += 1;
                    if self
                        .settings
                        .max_reconnect_attempts
                        .is_some_and(|max| failures >= max)
                    {
                        warn!(attempts = failures, error = %err, "transport: giving up on reconnect");
                        self.close(SyncError::Disconnected);
                        let _ = self.events.send(ChannelEvent::GaveUp { attempts: failures });
                        return;
                    }

                    let delay = self.settings.backoff.delay(failures);
                    warn!(
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transport: reconnect attempt failed"
                    );
                    self.state.send_replace(ConnectionState::Reconnecting {
                        attempt: failures + 1,
                    });
                    match self.wait_backoff(delay, &mut commands).await {
                        BackoffExit::Elapsed => continue,
                        BackoffExit::Shutdown => {
                            self.close(SyncError::Disconnected);
                            return;
                        }
                    }
                }
            };

            let mut inflight = HashMap::new();
            let exit = self.drive(socket, &mut commands, &mut inflight).await;
            for (_, pending) in inflight.drain() {
                let _ = pending.responder.send(Err(SyncError::Disconnected));
            }

            match exit {
                SessionExit::Shutdown => {
                    info!("transport: live channel closed by client");
                    self.close(SyncError::Disconnected);
                    let _ = self.events.send(ChannelEvent::Disconnected {
                        reason: "closed by client".into(),
                        will_reconnect: false,
                    });
                    return;
                }
                SessionExit::Lost(reason) => {
                    warn!(%reason, "transport: live channel lost; reconnecting");
                    let _ = self.events.send(ChannelEvent::Disconnected {
                        reason,
                        will_reconnect: true,
                    });
                }
            }
        }
    }

    /// Runs one connect-and-authenticate attempt while still answering
    /// requests according to the offline policy.
    async fn handshake(&mut self, commands: &mut mpsc::Receiver<Command>) -> Handshake {
        let request_id = self.allocate_request_id();
        let attempt = open_session(&self.settings, &self.token, request_id);
        tokio::pin!(attempt);
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Request { op, responder }) => hold_or_reject(
                        self.settings.offline_policy,
                        &mut self.outbox,
                        op,
                        responder,
                    ),
                    Some(Command::Shutdown) | None => return Handshake::Shutdown,
                },
                result = &mut attempt => return Handshake::Done(result),
            }
        }
    }

    async fn drive(
        &mut self,
        mut socket: Socket,
        commands: &mut mpsc::Receiver<Command>,
        inflight: &mut HashMap<u64, InFlight>,
    ) -> SessionExit {
        while let Some(queued) = self.outbox.pop_front() {
            if queued.responder.is_closed() {
                debug!(op = queued.op.name(), "transport: dropping abandoned queued request");
                continue;
            }
            if let Err(reason) = self
                .write_request(&mut socket, queued.op, queued.responder, inflight)
                .await
            {
                return SessionExit::Lost(reason);
            }
        }

        loop {
            tokio::select! {
                frame = socket.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => self.dispatch(&text, inflight),
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return SessionExit::Lost("connection closed by server".into());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return SessionExit::Lost(err.to_string()),
                },
                command = commands.recv() => match command {
                    Some(Command::Request { op, responder }) => {
                        if let Err(reason) = self.write_request(&mut socket, op, responder, inflight).await {
                            return SessionExit::Lost(reason);
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        let _ = socket.close(None).await;
                        return SessionExit::Shutdown;
                    }
                },
            }
        }
    }

    async fn write_request(
        &mut self,
        socket: &mut Socket,
        op: ClientOp,
        responder: Responder,
        inflight: &mut HashMap<u64, InFlight>,
    ) -> Result<(), String> {
        let request_id = self.allocate_request_id();
        let op_name = op.name();
        let frame = ClientFrame { request_id, op };
        match send_frame(socket, &frame).await {
            Ok(()) => {
                inflight.retain(|_, pending| !pending.responder.is_closed());
                inflight.insert(
                    request_id,
                    InFlight {
                        op: op_name,
                        responder,
                    },
                );
                debug!(request_id, op = op_name, "transport: request written");
                Ok(())
            }
            Err(err) => {
                let _ = responder.send(Err(SyncError::Disconnected));
                Err(err.to_string())
            }
        }
    }

    fn dispatch(&self, text: &str, inflight: &mut HashMap<u64, InFlight>) {
        let frame = match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "transport: dropping malformed server frame");
                return;
            }
        };

        match frame {
            ServerFrame::Ack {
                request_id,
                ok,
                error,
                data,
            } => {
                let Some(pending) = inflight.remove(&request_id) else {
                    debug!(request_id, "transport: ack for unknown or abandoned request");
                    return;
                };
                let result = if ok {
                    Ok(data)
                } else {
                    Err(SyncError::Rejected {
                        op: pending.op,
                        reason: error.unwrap_or_else(|| "request rejected".into()),
                    })
                };
                let _ = pending.responder.send(result);
            }
            ServerFrame::NewMessage {
                conversation_id,
                message,
            } => {
                let conversation_id = ConversationId::from(conversation_id.into_string());
                match message.into_message(Some(&conversation_id)) {
                    Ok(message) => {
                        let _ = self.events.send(ChannelEvent::Push(PushEvent::NewMessage {
                            conversation_id,
                            message,
                        }));
                    }
                    Err(err) => warn!(%conversation_id, %err, "transport: dropping invalid new_message"),
                }
            }
            ServerFrame::ConversationUpdated {
                conversation_id,
                last_message,
            } => {
                let conversation_id = ConversationId::from(conversation_id.into_string());
                match last_message.into_message(Some(&conversation_id)) {
                    Ok(last_message) => {
                        let _ = self
                            .events
                            .send(ChannelEvent::Push(PushEvent::ConversationUpdated {
                                conversation_id,
                                last_message,
                            }));
                    }
                    Err(err) => {
                        warn!(%conversation_id, %err, "transport: dropping invalid conversation_updated")
                    }
                }
            }
            ServerFrame::Unknown => debug!("transport: ignoring unknown frame type"),
        }
    }

    async fn wait_backoff(
        &mut self,
        delay: Duration,
        commands: &mut mpsc::Receiver<Command>,
    ) -> BackoffExit {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Request { op, responder }) => hold_or_reject(
                        self.settings.offline_policy,
                        &mut self.outbox,
                        op,
                        responder,
                    ),
                    Some(Command::Shutdown) | None => return BackoffExit::Shutdown,
                },
                _ = &mut sleep => return BackoffExit::Elapsed,
            }
        }
    }

    fn close(&mut self, reason: SyncError) {
        for queued in self.outbox.drain(..) {
            let _ = queued.responder.send(Err(reason.clone()));
        }
        self.state.send_replace(ConnectionState::Closed);
    }

    fn allocate_request_id(&mut self) -> u64 {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        request_id
    }
}

async fn open_session(
    settings: &TransportSettings,
    token: &str,
    request_id: u64,
) -> SyncResult<(Socket, UserRef)> {
    let connect = connect_async(settings.url.as_str());
    let (mut socket, _) = tokio::time::timeout(settings.connect_timeout, connect)
        .await
        .map_err(|_| SyncError::Network(format!("timed out connecting to {}", settings.url)))?
        .map_err(map_handshake_error)?;

    let frame = ClientFrame {
        request_id,
        op: ClientOp::Authenticate {
            token: token.to_string(),
        },
    };
    send_frame(&mut socket, &frame).await?;

    let ack = tokio::time::timeout(
        settings.connect_timeout,
        wait_for_ack(&mut socket, request_id),
    )
    .await
    .map_err(|_| SyncError::Network("timed out waiting for the authentication ack".into()))??;

    if !ack.ok {
        return Err(SyncError::Auth(
            ack.error.unwrap_or_else(|| "token rejected".into()),
        ));
    }
    let auth: AuthAck = serde_json::from_value(ack.data)
        .map_err(|err| SyncError::InvalidPayload(format!("authentication ack: {err}")))?;
    Ok((socket, auth.user.into()))
}

fn hold_or_reject(
    policy: OfflinePolicy,
    outbox: &mut VecDeque<QueuedRequest>,
    op: ClientOp,
    responder: Responder,
) {
    match policy {
        OfflinePolicy::Reject => {
            let _ = responder.send(Err(SyncError::Disconnected));
        }
        OfflinePolicy::Queue => {
            debug!(
                op = op.name(),
                queued = outbox.len() + 1,
                "transport: holding request until reconnect"
            );
            outbox.push_back(QueuedRequest { op, responder });
        }
    }
}

async fn send_frame(socket: &mut Socket, frame: &ClientFrame) -> SyncResult<()> {
    let text = serde_json::to_string(frame)
        .map_err(|err| SyncError::InvalidPayload(err.to_string()))?;
    socket
        .send(WsMessage::Text(text))
        .await
        .map_err(|err| SyncError::Network(err.to_string()))
}

async fn wait_for_ack(socket: &mut Socket, request_id: u64) -> SyncResult<AckOutcome> {
    while let Some(frame) = socket.next().await {
        match frame.map_err(|err| SyncError::Network(err.to_string()))? {
            WsMessage::Text(text) => match serde_json::from_str::<ServerFrame>(&text) {
                Ok(ServerFrame::Ack {
                    request_id: acked,
                    ok,
                    error,
                    data,
                }) if acked == request_id => return Ok(AckOutcome { ok, error, data }),
                Ok(_) => debug!("transport: ignoring frame received before authentication"),
                Err(err) => warn!(%err, "transport: malformed frame during handshake"),
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    Err(SyncError::Network(
        "connection closed during authentication".into(),
    ))
}

fn map_handshake_error(err: tungstenite::Error) -> SyncError {
    match err {
        tungstenite::Error::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            SyncError::Auth(format!("upgrade rejected with HTTP {}", response.status()))
        }
        other => SyncError::Network(other.to_string()),
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
