mod support;

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use marketchat::common::protocol::ServerFrame;
use marketchat::server::websocket::ChatWebSocketManager;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::harness;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type Client = WebSocketStream<DuplexStream>;

async fn connect(manager: Arc<ChatWebSocketManager>) -> (Client, JoinHandle<anyhow::Result<()>>) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move {
        let ws = tokio_tungstenite::accept_async(server_io).await?;
        manager.handle_connection(ws).await
    });
    let (client, _response) = tokio_tungstenite::client_async("ws://marketchat.test/", client_io)
        .await
        .expect("client handshake");
    (client, server)
}

async fn send(client: &mut Client, frame: serde_json::Value) {
    client.send(Message::Text(frame.to_string())).await.expect("send frame");
}

async fn recv(client: &mut Client) -> ServerFrame {
    let wait = async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str::<ServerFrame>(&text).expect("server frame"),
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {:?}", other),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait).await.expect("timed out waiting for frame")
}

/// Reads frames until one matches; snapshots and replies may interleave.
async fn recv_until<P>(client: &mut Client, pred: P) -> ServerFrame
where
    P: Fn(&ServerFrame) -> bool,
{
    loop {
        let frame = recv(client).await;
        if pred(&frame) {
            return frame;
        }
    }
}

/// Everything the server sends within `window`.
async fn drain_for(client: &mut Client, window: Duration) -> Vec<ServerFrame> {
    let mut frames = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(Ok(message))) = tokio::time::timeout_at(deadline, client.next()).await {
        if let Message::Text(text) = message {
            frames.push(serde_json::from_str::<ServerFrame>(&text).expect("server frame"));
        }
    }
    frames
}

async fn login(client: &mut Client, token: &str) -> ServerFrame {
    send(client, json!({"type": "auth", "session_token": token})).await;
    recv(client).await
}

#[tokio::test]
async fn authenticated_client_opens_sends_and_sees_snapshots() {
    let h = harness().await;
    let token = h.identity.issue_session("u1", chrono::Duration::hours(1)).await.unwrap();
    let manager = Arc::new(ChatWebSocketManager::new(h.service.clone()));
    let (mut client, server) = connect(manager.clone()).await;

    match login(&mut client, &token).await {
        ServerFrame::AuthResponse { success, user_id, .. } => {
            assert!(success);
            assert_eq!(user_id.as_deref(), Some("u1"));
        }
        other => panic!("unexpected frame {:?}", other),
    }
    assert_eq!(manager.connection_count().await, 1);

    send(&mut client, json!({"type": "open_conversation", "request_id": "r1", "other_user_id": "u2",
        "related_item_id": "svc-9", "related_item_type": "service"})).await;
    let conversation_id = match recv(&mut client).await {
        ServerFrame::ConversationOpened { request_id, conversation } => {
            assert_eq!(request_id, "r1");
            assert_eq!(conversation.related_item_id.as_deref(), Some("svc-9"));
            conversation.conversation_id
        }
        other => panic!("unexpected frame {:?}", other),
    };

    send(&mut client, json!({"type": "subscribe_messages", "request_id": "r2",
        "conversation_id": conversation_id, "read_on_view": false})).await;
    let subscription_id = match recv(&mut client).await {
        ServerFrame::Subscribed { request_id, subscription_id } => {
            assert_eq!(request_id, "r2");
            subscription_id
        }
        other => panic!("unexpected frame {:?}", other),
    };
    match recv(&mut client).await {
        ServerFrame::MessagesSnapshot { messages, .. } => assert!(messages.is_empty()),
        other => panic!("unexpected frame {:?}", other),
    }

    send(&mut client, json!({"type": "send_message", "request_id": "r3", "conversation_id": conversation_id,
        "input": {"text": "Hello", "message_type": "text"}})).await;
    let snapshot = recv_until(&mut client, |f| {
        matches!(f, ServerFrame::MessagesSnapshot { messages, .. } if messages.len() == 1)
    })
    .await;
    if let ServerFrame::MessagesSnapshot { subscription_id: sid, messages, .. } = snapshot {
        assert_eq!(sid, subscription_id);
        assert_eq!(messages[0].text, "Hello");
        assert_eq!(messages[0].sender_id, "u1");
        assert_eq!(messages[0].receiver_id, "u2");
        assert_eq!(messages[0].sender_details.name, "Ugo");
    }

    send(&mut client, json!({"type": "unsubscribe", "request_id": "r4", "subscription_id": subscription_id})).await;
    recv_until(&mut client, |f| matches!(f, ServerFrame::Unsubscribed { request_id, .. } if request_id == "r4")).await;

    // Nothing for the cancelled subscription after its ack
    send(&mut client, json!({"type": "send_message", "request_id": "r5", "conversation_id": conversation_id,
        "input": {"text": "Anyone?", "message_type": "text"}})).await;
    let mut frames = Vec::new();
    loop {
        let frame = recv(&mut client).await;
        let sent = matches!(frame, ServerFrame::MessageSent { .. });
        frames.push(frame);
        if sent {
            break;
        }
    }
    frames.extend(drain_for(&mut client, Duration::from_millis(300)).await);
    assert!(!frames.iter().any(|f| matches!(f, ServerFrame::MessagesSnapshot { subscription_id: sid, .. } if *sid == subscription_id)));

    client.close(None).await.unwrap();
    server.await.unwrap().unwrap();
    assert_eq!(manager.connection_count().await, 0);
}

#[tokio::test]
async fn bad_token_is_refused() {
    let h = harness().await;
    let manager = Arc::new(ChatWebSocketManager::new(h.service.clone()));
    let (mut client, server) = connect(manager.clone()).await;

    match login(&mut client, "not-a-session").await {
        ServerFrame::AuthResponse { success, error, .. } => {
            assert!(!success);
            assert!(error.is_some());
        }
        other => panic!("unexpected frame {:?}", other),
    }
    assert!(server.await.unwrap().is_err());
    assert_eq!(manager.connection_count().await, 0);
}

#[tokio::test]
async fn silent_client_times_out_during_auth() {
    let h = harness().await;
    let manager = Arc::new(ChatWebSocketManager::new(h.service.clone()).with_auth_timeout(Duration::from_millis(100)));
    let (mut client, server) = connect(manager).await;

    match recv(&mut client).await {
        ServerFrame::AuthResponse { success, error, .. } => {
            assert!(!success);
            assert_eq!(error.as_deref(), Some("Authentication timeout"));
        }
        other => panic!("unexpected frame {:?}", other),
    }
    assert!(server.await.unwrap().is_err());
}

#[tokio::test]
async fn request_errors_carry_kind_and_request_id() {
    let h = harness().await;
    let token = h.identity.issue_session("u3", chrono::Duration::hours(1)).await.unwrap();
    let conversation = h.service.open_conversation("u1", "u2", None, None).await.unwrap();
    let manager = Arc::new(ChatWebSocketManager::new(h.service.clone()));
    let (mut client, _server) = connect(manager).await;
    login(&mut client, &token).await;

    // u3 is not part of the u1/u2 conversation
    send(&mut client, json!({"type": "send_message", "request_id": "r1",
        "conversation_id": conversation.conversation_id, "input": {"text": "hey", "message_type": "text"}})).await;
    match recv(&mut client).await {
        ServerFrame::Error { request_id, kind, retryable, .. } => {
            assert_eq!(request_id.as_deref(), Some("r1"));
            assert_eq!(kind, "unauthorized");
            assert!(!retryable);
        }
        other => panic!("unexpected frame {:?}", other),
    }

    send(&mut client, json!({"type": "unsubscribe", "request_id": "r2", "subscription_id": "nope"})).await;
    match recv(&mut client).await {
        ServerFrame::Error { kind, .. } => assert_eq!(kind, "not_found"),
        other => panic!("unexpected frame {:?}", other),
    }

    send(&mut client, json!({"type": "teleport"})).await;
    match recv(&mut client).await {
        ServerFrame::Error { request_id, kind, .. } => {
            assert_eq!(request_id, None);
            assert_eq!(kind, "invalid_input");
        }
        other => panic!("unexpected frame {:?}", other),
    }
}

#[tokio::test]
async fn upload_then_unread_total_follows_sends() {
    let h = harness().await;
    let sender_token = h.identity.issue_session("u1", chrono::Duration::hours(1)).await.unwrap();
    let reader_token = h.identity.issue_session("u2", chrono::Duration::hours(1)).await.unwrap();
    let manager = Arc::new(ChatWebSocketManager::new(h.service.clone()));

    let (mut reader, _reader_server) = connect(manager.clone()).await;
    login(&mut reader, &reader_token).await;
    send(&mut reader, json!({"type": "subscribe_unread_total", "request_id": "t1"})).await;
    recv_until(&mut reader, |f| matches!(f, ServerFrame::Subscribed { .. })).await;
    recv_until(&mut reader, |f| matches!(f, ServerFrame::UnreadTotal { total: 0, .. })).await;

    let (mut sender, _sender_server) = connect(manager.clone()).await;
    login(&mut sender, &sender_token).await;
    send(&mut sender, json!({"type": "open_conversation", "request_id": "o1", "other_user_id": "u2"})).await;
    let conversation_id = match recv(&mut sender).await {
        ServerFrame::ConversationOpened { conversation, .. } => conversation.conversation_id,
        other => panic!("unexpected frame {:?}", other),
    };

    let data = base64::engine::general_purpose::STANDARD.encode(b"%PDF-1.7 invoice");
    send(&mut sender, json!({"type": "upload_attachment", "request_id": "up1", "conversation_id": conversation_id,
        "kind": "document", "file_name": "invoice.pdf", "data_base64": data})).await;
    let attachment = match recv(&mut sender).await {
        ServerFrame::AttachmentUploaded { attachment, .. } => attachment,
        other => panic!("unexpected frame {:?}", other),
    };
    assert_eq!(attachment.mime_type, "application/pdf");
    assert_eq!(attachment.file_size, 16);

    send(&mut sender, json!({"type": "send_message", "request_id": "s1", "conversation_id": conversation_id,
        "input": {"text": "", "message_type": "document", "media_url": attachment.url,
                  "file_name": attachment.file_name, "file_size": attachment.file_size,
                  "mime_type": attachment.mime_type}})).await;
    recv_until(&mut sender, |f| matches!(f, ServerFrame::MessageSent { .. })).await;
    recv_until(&mut reader, |f| matches!(f, ServerFrame::UnreadTotal { total: 1, .. })).await;

    send(&mut reader, json!({"type": "mark_read", "request_id": "m1", "conversation_id": conversation_id})).await;
    // The reply and the refreshed total race each other
    let (mut marked, mut cleared) = (false, false);
    while !(marked && cleared) {
        match recv(&mut reader).await {
            ServerFrame::MarkedRead { changed, .. } => {
                assert!(changed);
                marked = true;
            }
            ServerFrame::UnreadTotal { total: 0, .. } => cleared = true,
            _ => {}
        }
    }

    let _ = tokio::fs::remove_dir_all(&h.blob_root).await;
}
