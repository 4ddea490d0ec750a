// WebSocket transport: JSON frames in, ServerFrames and live snapshots out
use crate::common::error::{ChatError, ChatResult};
use crate::common::protocol::{ClientFrame, ServerFrame};
use crate::server::feed::{ReadPolicy, Subscription};
use crate::server::service::ChatService;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use uuid::Uuid;

pub type ClientId = String;

const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WebSocketConnection {
    pub client_id: ClientId,
    pub user_id: String,
    pub sender: UnboundedSender<Message>,
}

pub struct ChatWebSocketManager {
    service: Arc<ChatService>,
    // client_id -> connection
    connections: Arc<Mutex<HashMap<ClientId, WebSocketConnection>>>,
    auth_timeout: Duration,
}

fn encode(frame: &ServerFrame) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            error!("[WS:SEND] Cannot encode frame: {}", e);
            None
        }
    }
}

/// Queues a frame for the connection's writer; false once the client is gone.
fn push(tx: &UnboundedSender<Message>, frame: &ServerFrame) -> bool {
    match encode(frame) {
        Some(message) => tx.send(message).is_ok(),
        None => true,
    }
}

/// Pumps a subscription's snapshots to the client until either side stops.
fn forward<T, F>(mut subscription: Subscription<T>, tx: UnboundedSender<Message>, to_frame: F) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(String, T) -> ServerFrame + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(snapshot) = subscription.next().await {
            if !push(&tx, &to_frame(subscription.id().to_string(), snapshot)) {
                break;
            }
        }
    })
}

/// Per-connection state owned by the receive loop.
struct Session {
    user_id: String,
    tx: UnboundedSender<Message>,
    subscriptions: HashMap<String, JoinHandle<()>>,
}

impl Session {
    fn register(&mut self, request_id: String, subscription_id: String, pump: JoinHandle<()>) {
        self.subscriptions.insert(subscription_id, pump);
        debug!("[WS:SUB] {} now has {} subscriptions ({})", self.user_id, self.subscriptions.len(), request_id);
    }

    /// Stops a pump and waits for it, so nothing it produced lands after the caller's next frame.
    async fn stop(pump: JoinHandle<()>) {
        pump.abort();
        let _ = pump.await;
    }

    async fn close(&mut self) {
        for (_, pump) in self.subscriptions.drain() {
            Self::stop(pump).await;
        }
    }
}

impl ChatWebSocketManager {
    pub fn new(service: Arc<ChatService>) -> Self {
        Self {
            service,
            connections: Arc::new(Mutex::new(HashMap::new())),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
        }
    }

    pub fn with_auth_timeout(mut self, auth_timeout: Duration) -> Self {
        self.auth_timeout = auth_timeout;
        self
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Runs a connection to completion. The first frame must be `auth`.
    pub async fn handle_connection<S>(&self, ws_stream: WebSocketStream<S>) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        debug!("[WS:AUTH] Waiting for authentication from client...");
        let first = tokio::time::timeout(self.auth_timeout, ws_receiver.next()).await;
        let session_token = match first {
            Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Auth { session_token }) => session_token,
                Ok(_) => {
                    if let Some(m) = encode(&ServerFrame::auth_failed("Invalid message type, expected 'auth'")) {
                        let _ = ws_sender.send(m).await;
                    }
                    return Err(anyhow::anyhow!("first frame was not auth"));
                }
                Err(e) => {
                    if let Some(m) = encode(&ServerFrame::auth_failed(format!("Invalid JSON: {}", e))) {
                        let _ = ws_sender.send(m).await;
                    }
                    return Err(anyhow::anyhow!("invalid JSON in auth frame"));
                }
            },
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                debug!("[WS:AUTH] Client closed connection during auth");
                return Ok(());
            }
            Ok(Some(Ok(_))) => {
                if let Some(m) = encode(&ServerFrame::auth_failed("Expected text message for authentication")) {
                    let _ = ws_sender.send(m).await;
                }
                return Err(anyhow::anyhow!("unexpected message type during auth"));
            }
            Ok(Some(Err(e))) => return Err(anyhow::anyhow!("websocket error during auth: {}", e)),
            Err(_) => {
                warn!("[WS:AUTH] Authentication timeout");
                if let Some(m) = encode(&ServerFrame::auth_failed("Authentication timeout")) {
                    let _ = ws_sender.send(m).await;
                }
                return Err(anyhow::anyhow!("authentication timeout"));
            }
        };

        let user_id = match self.service.authenticate(&session_token).await {
            Ok(Some(user_id)) => user_id,
            Ok(None) => {
                if let Some(m) = encode(&ServerFrame::auth_failed("Invalid or expired session token")) {
                    let _ = ws_sender.send(m).await;
                }
                return Err(anyhow::anyhow!("authentication failed"));
            }
            Err(e) => {
                if let Some(m) = encode(&ServerFrame::auth_failed(e.to_string())) {
                    let _ = ws_sender.send(m).await;
                }
                return Err(anyhow::anyhow!("authentication failed: {}", e));
            }
        };

        // Registered before the client hears back, so it is counted once it can act
        let client_id = Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        self.connections.lock().await.insert(
            client_id.clone(),
            WebSocketConnection {
                client_id: client_id.clone(),
                user_id: user_id.clone(),
                sender: tx.clone(),
            },
        );

        if let Some(m) = encode(&ServerFrame::AuthResponse {
            success: true,
            user_id: Some(user_id.clone()),
            error: None,
        }) {
            if let Err(e) = ws_sender.send(m).await {
                self.connections.lock().await.remove(&client_id);
                return Err(e.into());
            }
        }
        info!("[WS:AUTH] Authentication successful for user: {}", user_id);

        // Task per inviare messaggi al client
        let mut send_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if ws_sender.send(message).await.is_err() {
                    break;
                }
            }
        });

        let mut session = Session {
            user_id: user_id.clone(),
            tx,
            subscriptions: HashMap::new(),
        };

        let receive = async {
            while let Some(message) = ws_receiver.next().await {
                match message {
                    Ok(Message::Text(text)) => self.handle_text(&mut session, &text).await,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("[WS:RECV] Connection error for {}: {}", session.user_id, e);
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = receive => {},
            _ = &mut send_task => {},
        }

        session.close().await;
        send_task.abort();
        self.connections.lock().await.remove(&client_id);
        info!("[WS:CLEANUP] Connection {} of {} closed", client_id, user_id);
        Ok(())
    }

    async fn handle_text(&self, session: &mut Session, text: &str) {
        let frame = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                push(&session.tx, &ServerFrame::error(None, &ChatError::InvalidInput(format!("bad frame: {}", e))));
                return;
            }
        };
        let request_id = frame.request_id().map(str::to_string);
        if let Err(e) = self.dispatch(session, frame).await {
            debug!("[WS:RECV] Request {:?} of {} failed: {}", request_id, session.user_id, e);
            push(&session.tx, &ServerFrame::error(request_id.as_deref(), &e));
        }
    }

    async fn dispatch(&self, session: &mut Session, frame: ClientFrame) -> ChatResult<()> {
        let user = session.user_id.clone();
        match frame {
            ClientFrame::Auth { .. } => Err(ChatError::InvalidInput("already authenticated".to_string())),

            ClientFrame::OpenConversation { request_id, other_user_id, related_item_id, related_item_type } => {
                let conversation =
                    self.service.open_conversation(&user, &other_user_id, related_item_id, related_item_type).await?;
                push(&session.tx, &ServerFrame::ConversationOpened { request_id, conversation });
                Ok(())
            }

            ClientFrame::SendMessage { request_id, conversation_id, input } => {
                let message = self.service.send_from(&user, &conversation_id, input).await?;
                push(&session.tx, &ServerFrame::MessageSent { request_id, message });
                Ok(())
            }

            ClientFrame::UploadAttachment { request_id, conversation_id, kind, file_name, mime_type, data_base64 } => {
                let payload = base64::engine::general_purpose::STANDARD
                    .decode(data_base64.as_bytes())
                    .map_err(|e| ChatError::InvalidInput(format!("attachment is not valid base64: {}", e)))?;
                let attachment = self
                    .service
                    .upload_attachment(&user, &conversation_id, kind, file_name.as_deref(), mime_type.as_deref(), &payload)
                    .await?;
                push(&session.tx, &ServerFrame::AttachmentUploaded { request_id, attachment });
                Ok(())
            }

            ClientFrame::SubscribeConversations { request_id } => {
                let subscription = self.service.feed().subscribe_conversations(&user).await?;
                let subscription_id = subscription.id().to_string();
                push(&session.tx, &ServerFrame::Subscribed { request_id: request_id.clone(), subscription_id: subscription_id.clone() });
                let pump = forward(subscription, session.tx.clone(), |subscription_id, conversations| {
                    ServerFrame::ConversationsSnapshot { subscription_id, conversations }
                });
                session.register(request_id, subscription_id, pump);
                Ok(())
            }

            ClientFrame::SubscribeMessages { request_id, conversation_id, read_on_view } => {
                let policy = if read_on_view { ReadPolicy::ReadOnView } else { ReadPolicy::Manual };
                let subscription = self.service.feed().subscribe_messages(&conversation_id, &user, policy).await?;
                let subscription_id = subscription.id().to_string();
                push(&session.tx, &ServerFrame::Subscribed { request_id: request_id.clone(), subscription_id: subscription_id.clone() });
                let pump = forward(subscription, session.tx.clone(), move |subscription_id, messages| {
                    ServerFrame::MessagesSnapshot {
                        subscription_id,
                        conversation_id: conversation_id.clone(),
                        messages,
                    }
                });
                session.register(request_id, subscription_id, pump);
                Ok(())
            }

            ClientFrame::SubscribeUnreadTotal { request_id } => {
                let subscription = self.service.feed().subscribe_total_unread(&user).await?;
                let subscription_id = subscription.id().to_string();
                push(&session.tx, &ServerFrame::Subscribed { request_id: request_id.clone(), subscription_id: subscription_id.clone() });
                let pump = forward(subscription, session.tx.clone(), |subscription_id, total| ServerFrame::UnreadTotal {
                    subscription_id,
                    total,
                });
                session.register(request_id, subscription_id, pump);
                Ok(())
            }

            ClientFrame::Unsubscribe { request_id, subscription_id } => {
                let pump = session
                    .subscriptions
                    .remove(&subscription_id)
                    .ok_or_else(|| ChatError::NotFound(format!("subscription {}", subscription_id)))?;
                Session::stop(pump).await;
                push(&session.tx, &ServerFrame::Unsubscribed { request_id, subscription_id });
                Ok(())
            }

            ClientFrame::MarkRead { request_id, conversation_id } => {
                let changed = self.service.mark_read(&user, &conversation_id).await?;
                push(&session.tx, &ServerFrame::MarkedRead { request_id, conversation_id, changed });
                Ok(())
            }

            ClientFrame::Archive { request_id, conversation_id } => {
                self.service.archive(&user, &conversation_id).await?;
                push(&session.tx, &ServerFrame::Archived { request_id, conversation_id });
                Ok(())
            }
        }
    }
}
