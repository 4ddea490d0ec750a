// Document store seam: the messaging core only talks to persistence through ChatStore
use crate::common::error::{ChatError, ChatResult};
use crate::common::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

/// Conversation as built by the directory; timestamps and counters are set by the store.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub conversation_id: ConversationId,
    pub participants: [UserId; 2],
    pub participant_details: BTreeMap<UserId, ParticipantDetails>,
    pub related_item_id: Option<String>,
    pub related_item_type: Option<RelatedItemType>,
}

/// Message without its ordering timestamp, which only the store assigns.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub text: String,
    pub message_type: MessageType,
    pub media_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub mime_type: Option<String>,
    pub sender_details: SenderDetails,
}

#[derive(Debug, Clone)]
pub enum BatchOp {
    InsertMessage(NewMessage),
    /// Timestamp is the commit time of the batch.
    SetLastMessage {
        conversation_id: ConversationId,
        text: String,
        sender_id: UserId,
        message_type: MessageType,
    },
    IncrementUnread {
        conversation_id: ConversationId,
        user_id: UserId,
        by: u32,
    },
    ResetUnread {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    /// Flags every unread message addressed to `receiver_id`, evaluated inside the batch.
    MarkReadFor {
        conversation_id: ConversationId,
        receiver_id: UserId,
    },
    TouchUpdatedAt {
        conversation_id: ConversationId,
    },
}

/// Set of writes applied together or not at all.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: BatchOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct CommitReceipt {
    pub committed_at: DateTime<Utc>,
    /// Messages inserted by the batch, with their store-assigned timestamps.
    pub messages: Vec<Message>,
    /// Rows actually modified; zero means the batch was a no-op.
    pub rows_changed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub conversations: i64,
    pub active_conversations: i64,
    pub messages: i64,
    pub unread_backlog: i64,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Conversations the user participates in, most recently updated first.
    async fn conversations_for_user(&self, user_id: &str) -> ChatResult<Vec<Conversation>>;

    async fn conversation(&self, conversation_id: &str) -> ChatResult<Option<Conversation>>;

    /// Conditional create keyed by the participant pair. Fails with
    /// `ChatError::AlreadyExists` carrying the id of the active conversation that won.
    async fn create_conversation(&self, draft: NewConversation) -> ChatResult<Conversation>;

    /// Messages of a conversation, oldest first.
    async fn messages_in(&self, conversation_id: &str) -> ChatResult<Vec<Message>>;

    async fn commit(&self, batch: WriteBatch) -> ChatResult<CommitReceipt>;

    /// Rewrites the denormalized details of `user_id` everywhere; returns the touched conversations.
    async fn update_participant_details(
        &self,
        user_id: &str,
        details: &ParticipantDetails,
    ) -> ChatResult<Vec<Conversation>>;

    async fn set_active(&self, conversation_id: &str, active: bool) -> ChatResult<()>;

    /// Deletes inactive conversations last updated before `cutoff`, with their messages.
    async fn purge_inactive(&self, cutoff: DateTime<Utc>) -> ChatResult<Vec<Conversation>>;

    async fn stats(&self) -> ChatResult<StoreStats>;
}

/// Runs a store read under a deadline; an expired deadline is a retryable failure.
pub async fn bounded<T, F>(limit: Duration, op: &'static str, fut: F) -> ChatResult<T>
where
    F: Future<Output = ChatResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!("[STORE] {} exceeded {:?}", op, limit);
            Err(ChatError::Timeout(op))
        }
    }
}

/// Runs a write on its own task: once started it finishes, and its outcome is
/// reported, even if the caller stops waiting. Writes are bounded by the pool's
/// acquire timeout, never by `bounded`.
pub async fn detached<T, F>(op: &'static str, fut: F) -> ChatResult<T>
where
    T: Send + 'static,
    F: Future<Output = ChatResult<T>> + Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| ChatError::Store(format!("{} task failed: {}", op, e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detached_write_finishes_after_the_caller_gives_up() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let write = detached("slow_write", async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = done_tx.send(());
            Ok::<_, ChatError>(())
        });
        assert!(tokio::time::timeout(Duration::from_millis(10), write).await.is_err());
        assert!(tokio::time::timeout(Duration::from_secs(2), done_rx).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn bounded_turns_slow_operations_into_timeouts() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, ChatError>(1)
        };
        let err = bounded(Duration::from_millis(10), "slow_op", slow).await.unwrap_err();
        assert_eq!(err, ChatError::Timeout("slow_op"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn bounded_passes_through_results() {
        let value = bounded(Duration::from_secs(1), "fast_op", async { Ok::<_, ChatError>(7) }).await;
        assert_eq!(value, Ok(7));
    }
}
