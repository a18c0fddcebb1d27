mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use shared::domain::{ConversationId, GifRef, Message};
use sync_core::{
    load_settings,
    message_store::StoreChange,
    protocol_client::FileUpload,
    send_pipeline::{OutgoingMessage, SendTicket},
    transport::ConnectionState,
    ChatClient, ClientEvent, ClientHandle,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{
    wrappers::{BroadcastStream, WatchStream},
    StreamExt,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::commands::{describe_state, guess_mimetype, parse, Command, HELP};

#[derive(Parser, Debug)]
#[command(about = "Terminal client for direct-message conversations")]
struct Args {
    /// TOML settings file; `DMSYNC__*` variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long, env = "DMSYNC_TOKEN", hide_env_values = true)]
    token: String,
}

enum Feed {
    Client(ClientEvent),
    Store(StoreChange),
    State(ConnectionState),
    Lagged(u64),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    let client = ChatClient::connect(settings, &args.token)
        .await
        .context("could not connect")?;
    println!("signed in as {}", client.local_user());

    if let Err(err) = client.refresh_conversations().await {
        warn!(error = %err, "client: initial conversation list failed");
    }
    print_conversations(&client).await;

    let events = BroadcastStream::new(client.subscribe_events()).map(|item| match item {
        Ok(event) => Feed::Client(event),
        Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(n)) => Feed::Lagged(n),
    });
    let changes = BroadcastStream::new(client.subscribe_messages()).map(|item| match item {
        Ok(change) => Feed::Store(change),
        Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(n)) => Feed::Lagged(n),
    });
    let states = client
        .watch_connection()
        .context("client has no live connection")?;
    let states = WatchStream::from_changes(states).map(Feed::State);
    let mut feed = Box::pin(events.merge(changes).merge(states));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(err) = run(&client, command).await {
                            println!("! {err:#}");
                        }
                    }
                    Ok(None) => {}
                    Err(message) => println!("! {message}"),
                }
            }
            Some(item) = feed.next() => show_feed(&client, item).await,
        }
    }

    client.disconnect().await;
    Ok(())
}

async fn run(client: &impl ClientHandle, command: Command) -> Result<()> {
    match command {
        Command::List => {
            client.refresh_conversations().await?;
            print_conversations(client).await;
        }
        Command::Open(conversation_id) => {
            if let Some(current) = client.active_conversation().await {
                client.close(&current).await;
            }
            client.open(&conversation_id).await?;
            print_messages(client, &conversation_id).await;
        }
        Command::Close => {
            if let Some(current) = client.active_conversation().await {
                client.close(&current).await;
                println!("closed {current}");
            }
        }
        Command::Direct(peer) => {
            let conversation = client.open_direct(&peer).await?;
            if let Some(current) = client.active_conversation().await {
                client.close(&current).await;
            }
            client.open(&conversation.id).await?;
            print_messages(client, &conversation.id).await;
        }
        Command::Attach { path, caption } => {
            let conversation_id = active(client).await?;
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("could not read {}", path.display()))?;
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("attachment")
                .to_string();
            let file = FileUpload::new(filename, bytes).with_mimetype(guess_mimetype(&path));
            let ticket = client
                .send(OutgoingMessage::text(conversation_id, caption).with_file(file))
                .await?;
            report(ticket);
        }
        Command::Gif { url, caption } => {
            let conversation_id = active(client).await?;
            let ticket = client
                .send(OutgoingMessage::text(conversation_id, caption).with_gif(GifRef::from_url(url)))
                .await?;
            report(ticket);
        }
        Command::Say(body) => {
            let conversation_id = active(client).await?;
            let ticket = client.send(OutgoingMessage::text(conversation_id, body)).await?;
            report(ticket);
        }
        Command::Retry(client_temp_id) => {
            let ticket = client.retry(&client_temp_id).await?;
            report(ticket);
        }
        Command::Discard(client_temp_id) => {
            let dropped = client.discard_failed(&client_temp_id).await?;
            println!("discarded \"{}\"", dropped.body);
        }
        Command::Show => {
            let conversation_id = active(client).await?;
            print_messages(client, &conversation_id).await;
        }
        Command::Status => match client.watch_connection() {
            Some(state) => {
                let state = *state.borrow();
                println!("connection: {}", describe_state(state));
            }
            None => println!("connection: none"),
        },
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
    Ok(())
}

async fn active(client: &impl ClientHandle) -> Result<ConversationId> {
    client
        .active_conversation()
        .await
        .context("no conversation is open; use /open or /dm first")
}

/// Delivery outcomes arrive through the store feed.
fn report(ticket: SendTicket) {
    tokio::spawn(async move {
        let _ = ticket.delivered().await;
    });
}

async fn show_feed(client: &impl ClientHandle, item: Feed) {
    match item {
        Feed::Client(ClientEvent::Connected { reconnected: true }) => println!("* reconnected"),
        Feed::Client(ClientEvent::Connected { .. }) => {}
        Feed::Client(ClientEvent::ConnectionLost { reason, will_reconnect }) => {
            let next = if will_reconnect { "retrying" } else { "offline" };
            println!("* connection lost ({reason}); {next}");
        }
        Feed::Client(ClientEvent::ReconnectAbandoned { attempts }) => {
            println!("* gave up reconnecting after {attempts} attempts");
        }
        Feed::Client(ClientEvent::AuthExpired { reason }) => {
            println!("* session expired: {reason}; restart with a fresh token");
        }
        Feed::Client(ClientEvent::SendFailed {
            client_temp_id,
            reason,
            ..
        }) => println!("! not sent ({reason}); /retry {client_temp_id} or /discard {client_temp_id}"),
        Feed::Client(ClientEvent::Error(message)) => println!("! {message}"),
        Feed::Store(StoreChange::Inserted { message }) => {
            if client.active_conversation().await.as_ref() == Some(&message.conversation_id) {
                println!("{}", render(&message));
            }
        }
        Feed::Store(StoreChange::HistoryMerged {
            conversation_id,
            added,
        }) if added > 0 => println!("* {added} earlier messages loaded in {conversation_id}"),
        Feed::Store(_) => {}
        Feed::State(state @ ConnectionState::Reconnecting { .. }) => {
            println!("* {}", describe_state(state));
        }
        Feed::State(_) => {}
        Feed::Lagged(skipped) => warn!(skipped, "client: console feed lagged"),
    }
}

async fn print_conversations(client: &impl ClientHandle) {
    let conversations = client.conversations().await;
    if conversations.is_empty() {
        println!("no conversations yet; /dm <user> starts one");
        return;
    }
    let me = client.local_user().id;
    for conversation in conversations {
        let peers: Vec<_> = conversation
            .participants
            .iter()
            .filter(|participant| participant.id != me)
            .map(|participant| participant.to_string())
            .collect();
        let preview = conversation
            .last_message
            .map(|preview| format!("{}: {}", preview.sender, preview.snippet))
            .unwrap_or_default();
        println!("{:<24} {:<20} {preview}", conversation.id, peers.join(", "));
    }
}

async fn print_messages(client: &impl ClientHandle, conversation_id: &ConversationId) {
    println!("-- {conversation_id} --");
    for message in client.messages(conversation_id).await {
        println!("{}", render(&message));
    }
}

fn render(message: &Message) -> String {
    let mut line = format!(
        "[{}] {}: {}",
        message.created_at.format("%H:%M"),
        message.sender,
        message.body
    );
    for attachment in &message.attachments {
        line.push_str(&format!(" <{}>", attachment.filename));
    }
    if let Some(gif) = &message.gif {
        line.push_str(&format!(" <gif {}>", gif.url));
    }
    if message.is_pending() {
        line.push_str(" (sending)");
    }
    line
}
