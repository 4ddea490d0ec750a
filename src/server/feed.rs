// Live subscription feed: standing queries that push full snapshots on every relevant change
use crate::common::error::{ChatError, ChatResult};
use crate::common::models::*;
use crate::server::delivery::DeliveryCoordinator;
use crate::server::store::{bounded, ChatStore};
use futures_util::future::BoxFuture;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

const BUS_CAPACITY: usize = 1024;
const SNAPSHOT_BUFFER: usize = 16;

/// What changed. Conversation events fan out to both participants' list
/// topics, message events to the conversation's message topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    Conversation {
        conversation_id: ConversationId,
        participants: [UserId; 2],
    },
    Messages {
        conversation_id: ConversationId,
    },
}

impl ChangeEvent {
    pub fn conversation_id(&self) -> &str {
        match self {
            ChangeEvent::Conversation { conversation_id, .. } | ChangeEvent::Messages { conversation_id } => {
                conversation_id
            }
        }
    }

    fn touches_user(&self, user_id: &str) -> bool {
        match self {
            ChangeEvent::Conversation { participants, .. } => participants.iter().any(|p| p == user_id),
            ChangeEvent::Messages { .. } => false,
        }
    }

    fn touches_messages_of(&self, conversation_id: &str) -> bool {
        matches!(self, ChangeEvent::Messages { conversation_id: id } if id == conversation_id)
    }
}

#[derive(Debug, Clone)]
pub struct BusEvent {
    pub event: ChangeEvent,
    /// False for events relayed from another server instance.
    pub local: bool,
}

/// In-process change notification shared by writers and subscriptions.
#[derive(Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<BusEvent>,
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // No receivers simply means nobody is subscribed right now
        let _ = self.tx.send(BusEvent { event, local: true });
    }

    pub fn inject_remote(&self, event: ChangeEvent) {
        let _ = self.tx.send(BusEvent { event, local: false });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPolicy {
    /// Every delivered snapshot with unread messages for the viewer marks them read.
    ReadOnView,
    Manual,
}

/// Handle on a standing query. Dropping or cancelling it stops the feed;
/// no snapshot is observable afterwards.
pub struct Subscription<T> {
    id: String,
    rx: mpsc::Receiver<T>,
    task: JoinHandle<()>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next full snapshot; `None` once the feed has stopped.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn cancel(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.task.abort();
        self.rx.close();
    }
}

/// Waits for the next event the subscription cares about. Queued events are
/// drained since the following recompute covers them. False when the bus is gone.
async fn next_change<M>(changes: &mut broadcast::Receiver<BusEvent>, matches: &M) -> bool
where
    M: Fn(&ChangeEvent) -> bool,
{
    loop {
        match changes.recv().await {
            Ok(bus_event) if matches(&bus_event.event) => {
                while changes.try_recv().is_ok() {}
                return true;
            }
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                debug!("[FEED] Subscription lagged by {} events, recomputing", skipped);
                return true;
            }
            Err(RecvError::Closed) => return false,
        }
    }
}

pub struct LiveFeed {
    store: Arc<dyn ChatStore>,
    bus: ChangeBus,
    delivery: Arc<DeliveryCoordinator>,
    timeout: Duration,
}

impl LiveFeed {
    pub fn new(store: Arc<dyn ChatStore>, bus: ChangeBus, delivery: Arc<DeliveryCoordinator>, timeout: Duration) -> Self {
        Self { store, bus, delivery, timeout }
    }

    /// Starts a standing query. The bus is joined before the first snapshot is
    /// computed so no change between the two is missed; a failure computing the
    /// first snapshot fails the subscription itself.
    async fn start<T, C, Fut, M, H>(&self, label: String, matches: M, compute: C, on_delivered: H) -> ChatResult<Subscription<T>>
    where
        T: Send + 'static,
        C: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ChatResult<T>> + Send + 'static,
        M: Fn(&ChangeEvent) -> bool + Send + Sync + 'static,
        H: Fn(&T) -> Option<BoxFuture<'static, ()>> + Send + Sync + 'static,
    {
        let mut changes = self.bus.subscribe();
        let initial = compute().await?;
        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
        let id = Uuid::new_v4().to_string();
        let task_label = label.clone();

        let task = tokio::spawn(async move {
            let mut snapshot = initial;
            loop {
                let follow_up = on_delivered(&snapshot);
                if tx.send(snapshot).await.is_err() {
                    debug!("[FEED] {} subscriber went away", task_label);
                    return;
                }
                if let Some(follow_up) = follow_up {
                    follow_up.await;
                }

                snapshot = loop {
                    if !next_change(&mut changes, &matches).await {
                        return;
                    }
                    match compute().await {
                        Ok(fresh) => break fresh,
                        Err(e) => warn!("[FEED] {} recompute failed, keeping last snapshot: {}", task_label, e),
                    }
                };
            }
        });

        debug!("[FEED] Started {} ({})", label, id);
        Ok(Subscription { id, rx, task })
    }

    /// Conversations of `user_id`, most recently updated first.
    pub async fn subscribe_conversations(&self, user_id: &str) -> ChatResult<Subscription<Vec<Conversation>>> {
        let user = user_id.to_string();
        let store = self.store.clone();
        let timeout = self.timeout;
        let compute = move || {
            let store = store.clone();
            let user = user.clone();
            async move { bounded(timeout, "conversations_for_user", store.conversations_for_user(&user)).await }
        };
        let user = user_id.to_string();
        self.start(
            format!("conversations of {}", user_id),
            move |event| event.touches_user(&user),
            compute,
            |_| None,
        )
        .await
    }

    /// Messages of a conversation, oldest first. Only participants may subscribe.
    pub async fn subscribe_messages(
        &self,
        conversation_id: &str,
        viewer_id: &str,
        policy: ReadPolicy,
    ) -> ChatResult<Subscription<Vec<Message>>> {
        let conversation = bounded(self.timeout, "load_conversation", self.store.conversation(conversation_id))
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;
        if !conversation.has_participant(viewer_id) {
            return Err(ChatError::Unauthorized(format!(
                "{} is not a participant of conversation {}",
                viewer_id, conversation_id
            )));
        }

        let id = conversation_id.to_string();
        let store = self.store.clone();
        let timeout = self.timeout;
        let compute = move || {
            let store = store.clone();
            let id = id.clone();
            async move { bounded(timeout, "messages_in", store.messages_in(&id)).await }
        };

        let delivery = self.delivery.clone();
        let viewer = viewer_id.to_string();
        let read_target = conversation_id.to_string();
        let on_delivered = move |messages: &Vec<Message>| -> Option<BoxFuture<'static, ()>> {
            if policy != ReadPolicy::ReadOnView {
                return None;
            }
            if !messages.iter().any(|m| m.receiver_id == viewer && !m.is_read) {
                return None;
            }
            let delivery = delivery.clone();
            let viewer = viewer.clone();
            let conversation_id = read_target.clone();
            // Detached so that cancelling the view cannot interrupt a mark-read in flight
            let marking = tokio::spawn(async move {
                if let Err(e) = delivery.mark_read(&conversation_id, &viewer).await {
                    warn!("[FEED] Read-on-view for {} in {} failed: {}", viewer, conversation_id, e);
                }
            });
            Some(Box::pin(async move {
                let _ = marking.await;
            }))
        };

        let topic = conversation_id.to_string();
        self.start(
            format!("messages of {}", conversation_id),
            move |event| event.touches_messages_of(&topic),
            compute,
            on_delivered,
        )
        .await
    }

    /// Sum of the user's unread counters across all their conversations.
    pub async fn subscribe_total_unread(&self, user_id: &str) -> ChatResult<Subscription<u64>> {
        let user = user_id.to_string();
        let store = self.store.clone();
        let timeout = self.timeout;
        let compute = move || {
            let store = store.clone();
            let user = user.clone();
            async move {
                let conversations = bounded(timeout, "conversations_for_user", store.conversations_for_user(&user)).await?;
                Ok(conversations.iter().map(|c| u64::from(c.unread_for(&user))).sum())
            }
        };
        let user = user_id.to_string();
        self.start(
            format!("unread total of {}", user_id),
            move |event| event.touches_user(&user),
            compute,
            |_| None,
        )
        .await
    }
}
