use std::time::Duration;

use shared::domain::{MessageId, MessageStatus};

use super::*;
use crate::test_support::{
    conversation, echo_send_ack, history_ack, sent_message, FakeChannel, FakeConversations, FakeHistory,
    FakeReply, FakeUploader,
};

macro_rules! eventually {
    ($cond:expr) => {{
        let mut held = false;
        for _ in 0..500 {
            if $cond {
                held = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(held, "condition never held: {}", stringify!($cond));
    }};
}

struct Harness {
    client: Arc<ChatClient>,
    channel: Arc<FakeChannel>,
    conversations: Arc<FakeConversations>,
}

fn harness(behaviour: impl Fn(&ClientOp) -> FakeReply + Send + Sync + 'static) -> Harness {
    let channel = FakeChannel::new(behaviour);
    let conversations = FakeConversations::new();
    let client = ChatClient::with_dependencies(
        ClientDependencies {
            channel: channel.clone(),
            history: FakeHistory::new(),
            conversations: conversations.clone(),
            uploader: FakeUploader::new(),
        },
        UserRef::new("alice"),
        &ClientSettings::default(),
    );
    Harness {
        client,
        channel,
        conversations,
    }
}

fn push(conversation_id: &str, message: Message) -> ChannelEvent {
    ChannelEvent::Push(PushEvent::NewMessage {
        conversation_id: ConversationId::from(conversation_id),
        message,
    })
}

#[tokio::test(start_paused = true)]
async fn push_for_open_conversation_reaches_store_and_list() {
    let Harness { client, channel, .. } = harness(echo_send_ack);
    let c1 = ConversationId::from("c1");
    client.open(&c1).await.expect("open");

    channel.emit_event(push("c1", sent_message("c1", "m5", "bob", 50, "hey")));
    channel.emit_event(push("c1", sent_message("c1", "m5", "bob", 50, "hey")));

    eventually!(client.messages(&c1).await.len() == 1);
    eventually!(client
        .conversations()
        .await
        .first()
        .is_some_and(|top| top.id == c1));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.messages(&c1).await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn push_for_other_conversation_only_touches_the_list() {
    let Harness {
        client,
        channel,
        conversations,
    } = harness(echo_send_ack);
    conversations.add_details(conversation("c2", &["alice", "carol"], None));
    client.open(&ConversationId::from("c1")).await.expect("open");

    channel.emit_event(push("c2", sent_message("c2", "m1", "carol", 10, "psst")));

    let c2 = ConversationId::from("c2");
    eventually!(client
        .conversations()
        .await
        .iter()
        .any(|entry| entry.id == c2 && entry.participants.len() == 2));
    assert!(client.messages(&c2).await.is_empty());
    assert_eq!(conversations.detail_calls(), 1);

    let listed = client.conversations().await;
    let entry = listed.iter().find(|entry| entry.id == c2).expect("c2 listed");
    assert_eq!(
        entry.last_message.as_ref().map(|preview| preview.snippet.as_str()),
        Some("psst")
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_rejoins_active_conversation_and_reloads_list() {
    let Harness {
        client,
        channel,
        conversations,
    } = harness(echo_send_ack);
    let c1 = ConversationId::from("c1");
    client.open(&c1).await.expect("open");
    conversations.set_list(vec![
        conversation("c1", &["alice", "bob"], Some(5)),
        conversation("c3", &["alice", "dave"], Some(9)),
    ]);

    channel.emit_event(ChannelEvent::Connected { reconnected: true });

    eventually!(channel.count("join") == 2);
    eventually!(client.conversations().await.len() == 2);
    assert_eq!(client.conversations().await[0].id, ConversationId::from("c3"));
    assert_eq!(client.active_conversation().await, Some(c1));
}

#[tokio::test(start_paused = true)]
async fn channel_lifecycle_is_reported_as_client_events() {
    let Harness { client, channel, .. } = harness(echo_send_ack);
    let mut events = client.subscribe();

    channel.emit_event(ChannelEvent::Disconnected {
        reason: "reset".into(),
        will_reconnect: true,
    });
    channel.emit_event(ChannelEvent::AuthRejected {
        reason: "token expired".into(),
    });

    let first = events.recv().await.expect("first event");
    assert_eq!(
        first,
        ClientEvent::ConnectionLost {
            reason: "reset".into(),
            will_reconnect: true
        }
    );
    let second = events.recv().await.expect("second event");
    assert_eq!(
        second,
        ClientEvent::AuthExpired {
            reason: "token expired".into()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn own_send_updates_list_preview() {
    let Harness { client, .. } = harness(echo_send_ack);
    let c1 = ConversationId::from("c1");
    client.open(&c1).await.expect("open");

    let delivered = client
        .send(OutgoingMessage::text(c1.clone(), "on my way"))
        .await
        .expect("send")
        .delivered()
        .await
        .expect("delivered");

    assert!(delivered.id().is_some());
    eventually!(client
        .conversations()
        .await
        .first()
        .and_then(|entry| entry.last_message.clone())
        .is_some_and(|preview| preview.snippet == "on my way"));
}

#[tokio::test(start_paused = true)]
async fn failed_send_is_reported_and_can_be_discarded() {
    let Harness { client, .. } = harness(|op| match op {
        ClientOp::Send { .. } => FakeReply::reject("blocked"),
        other => echo_send_ack(other),
    });
    let mut events = client.subscribe();
    let c1 = ConversationId::from("c1");
    client.open(&c1).await.expect("open");

    let ticket = client
        .send(OutgoingMessage::text(c1.clone(), "hello?"))
        .await
        .expect("send");
    let temp = ticket.client_temp_id().clone();
    ticket.delivered().await.expect_err("rejected");

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event in time")
        .expect("event");
    assert_eq!(
        event,
        ClientEvent::SendFailed {
            conversation_id: c1.clone(),
            client_temp_id: temp.clone(),
            reason: format!("send {temp} failed: blocked"),
        }
    );
    assert_eq!(client.messages(&c1).await[0].status(), MessageStatus::Failed);

    let discarded = client.discard_failed(&temp).await.expect("discard");
    assert_eq!(discarded.body, "hello?");
    assert!(client.messages(&c1).await.is_empty());
    assert!(matches!(
        client.discard_failed(&temp).await,
        Err(SyncError::UnknownMessage { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn open_direct_lists_the_conversation_and_refuses_self() {
    let Harness { client, .. } = harness(echo_send_ack);

    let err = client
        .open_direct(&UserId::from("alice"))
        .await
        .expect_err("self conversation");
    assert!(matches!(err, SyncError::InvalidPayload(_)));

    let direct = client
        .open_direct(&UserId::from("bob"))
        .await
        .expect("direct conversation");
    assert_eq!(direct.id, ConversationId::from("dm-bob"));
    assert_eq!(client.conversations().await, vec![direct]);
}

#[tokio::test(start_paused = true)]
async fn history_load_refreshes_list_preview() {
    let channel = FakeChannel::new(|op| match op {
        ClientOp::History { .. } => FakeReply::ack(history_ack(&[
            sent_message("c1", "m1", "bob", 1, "first"),
            sent_message("c1", "m2", "bob", 2, "latest"),
        ])),
        other => echo_send_ack(other),
    });
    let conversations = FakeConversations::new();
    conversations.add_details(conversation("c1", &["alice", "bob"], None));
    let client = ChatClient::with_dependencies(
        ClientDependencies {
            channel: channel.clone(),
            history: FakeHistory::new(),
            conversations: conversations.clone(),
            uploader: FakeUploader::new(),
        },
        UserRef::new("alice"),
        &ClientSettings::default(),
    );

    client.open(&ConversationId::from("c1")).await.expect("open");

    eventually!(client
        .conversations()
        .await
        .first()
        .and_then(|entry| entry.last_message.clone())
        .is_some_and(|preview| preview.id == Some(MessageId::from("m2"))));
}

fn surfaced_errors(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<String> {
    let mut errors = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::Error(message) = event {
            errors.push(message);
        }
    }
    errors
}

#[tokio::test(start_paused = true)]
async fn transient_background_failures_are_not_surfaced() {
    let Harness {
        client,
        channel,
        conversations,
    } = harness(echo_send_ack);
    let mut events = client.subscribe_events();
    conversations.fail_details_with(Some(SyncError::Network("connection reset".into())));

    channel.emit_event(push("c2", sent_message("c2", "m1", "carol", 10, "psst")));
    eventually!(conversations.detail_calls() == 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(surfaced_errors(&mut events).is_empty());

    conversations.fail_details_with(None);
    channel.emit_event(push("c3", sent_message("c3", "m2", "dave", 20, "yo")));
    eventually!(conversations.detail_calls() == 2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(surfaced_errors(&mut events).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn store_feed_gap_recomputes_list_previews() {
    let Harness { client, .. } = harness(echo_send_ack);
    let missed = ConversationId::from("c2");
    {
        let mut store = client.store.lock().await;
        store.append(sent_message("c2", "x1", "carol", 5, "missed"));
        for n in 0..1100_i64 {
            store.append(sent_message("c1", &format!("m{n}"), "bob", 10 + n, "flood"));
        }
    }

    eventually!(client.conversations().await.iter().any(|entry| entry.id == missed
        && entry
            .last_message
            .as_ref()
            .is_some_and(|preview| preview.snippet == "missed")));
}

#[tokio::test(start_paused = true)]
async fn clients_without_a_live_connection_expose_no_state_watch() {
    let Harness { client, .. } = harness(echo_send_ack);
    assert!(client.watch_connection().is_none());
    assert_eq!(client.connection_state(), None);
}
