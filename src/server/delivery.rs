// Delivery & read-state: every mutation of a conversation's counters goes through one atomic batch
use crate::common::error::{ChatError, ChatResult};
use crate::common::models::*;
use crate::server::config::ServerConfig;
use crate::server::feed::{ChangeBus, ChangeEvent};
use crate::server::identity::IdentityProvider;
use crate::server::store::{bounded, detached, BatchOp, ChatStore, CommitReceipt, NewMessage, WriteBatch};
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Server-side checks on a message body before anything is written.
pub fn validate_input(input: &MessageInput, max_message_length: usize) -> ChatResult<()> {
    if input.text.chars().count() > max_message_length {
        return Err(ChatError::InvalidInput(format!(
            "message longer than {} characters",
            max_message_length
        )));
    }

    let has_media_fields = input.media_url.is_some()
        || input.file_name.is_some()
        || input.file_size.is_some()
        || input.mime_type.is_some();

    match input.message_type {
        MessageType::Text | MessageType::System => {
            if input.text.trim().is_empty() {
                return Err(ChatError::InvalidInput("message text is empty".to_string()));
            }
            if has_media_fields {
                return Err(ChatError::InvalidInput(format!(
                    "media fields are not allowed on {} messages",
                    input.message_type
                )));
            }
        }
        MessageType::Image | MessageType::Document => {
            let has_url = input.media_url.as_deref().map(|u| !u.trim().is_empty()).unwrap_or(false);
            if !has_url {
                return Err(ChatError::InvalidInput(format!(
                    "{} message without media url",
                    input.message_type
                )));
            }
        }
    }
    Ok(())
}

/// Sender and receiver must be exactly the two participants.
fn authorize_pair(conversation: &Conversation, sender_id: &str, receiver_id: &str) -> ChatResult<()> {
    if sender_id == receiver_id {
        return Err(ChatError::Unauthorized("sender and receiver must differ".to_string()));
    }
    if !conversation.has_participant(sender_id) || !conversation.has_participant(receiver_id) {
        return Err(ChatError::Unauthorized(format!(
            "{} -> {} is not the participant pair of conversation {}",
            sender_id, receiver_id, conversation.conversation_id
        )));
    }
    Ok(())
}

pub struct DeliveryCoordinator {
    store: Arc<dyn ChatStore>,
    identity: Arc<dyn IdentityProvider>,
    bus: ChangeBus,
    max_message_length: usize,
    timeout: Duration,
}

impl DeliveryCoordinator {
    pub fn new(
        store: Arc<dyn ChatStore>,
        identity: Arc<dyn IdentityProvider>,
        bus: ChangeBus,
        config: &ServerConfig,
    ) -> Self {
        Self {
            store,
            identity,
            bus,
            max_message_length: config.max_message_length,
            timeout: config.store_timeout,
        }
    }

    async fn load(&self, conversation_id: &str) -> ChatResult<Conversation> {
        bounded(self.timeout, "load_conversation", self.store.conversation(conversation_id))
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))
    }

    /// Commits `batch` and publishes the conversation's change events as one
    /// detached write.
    async fn apply<P>(&self, batch: WriteBatch, conversation: &Conversation, publish_when: P) -> ChatResult<CommitReceipt>
    where
        P: FnOnce(&CommitReceipt) -> bool + Send + 'static,
    {
        let store = self.store.clone();
        let bus = self.bus.clone();
        let conversation_id = conversation.conversation_id.clone();
        let participants = conversation.participants.clone();

        detached("commit", async move {
            let receipt = store.commit(batch).await?;
            if publish_when(&receipt) {
                bus.publish(ChangeEvent::Messages { conversation_id: conversation_id.clone() });
                bus.publish(ChangeEvent::Conversation { conversation_id, participants });
            }
            Ok::<_, ChatError>(receipt)
        })
        .await
    }

    /// Appends a message and updates the conversation summary and the receiver's
    /// unread counter in one batch. Nothing is written if any step fails.
    pub async fn send(
        &self,
        conversation_id: &str,
        sender_id: &str,
        receiver_id: &str,
        input: MessageInput,
    ) -> ChatResult<Message> {
        validate_input(&input, self.max_message_length)?;

        let conversation = self.load(conversation_id).await?;
        authorize_pair(&conversation, sender_id, receiver_id)?;
        if !conversation.is_active {
            return Err(ChatError::InvalidInput(format!("conversation {} is archived", conversation_id)));
        }

        let sender = bounded(self.timeout, "sender_profile", self.identity.profile(sender_id))
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("user {}", sender_id)))?;

        let summary = LastMessage::summary_text(&input);
        let mut batch = WriteBatch::new();
        batch
            .push(BatchOp::InsertMessage(NewMessage {
                message_id: Uuid::new_v4().to_string(),
                conversation_id: conversation_id.to_string(),
                sender_id: sender_id.to_string(),
                receiver_id: receiver_id.to_string(),
                text: input.text,
                message_type: input.message_type,
                media_url: input.media_url,
                file_name: input.file_name,
                file_size: input.file_size,
                mime_type: input.mime_type,
                sender_details: sender.sender_details(),
            }))
            .push(BatchOp::SetLastMessage {
                conversation_id: conversation_id.to_string(),
                text: summary,
                sender_id: sender_id.to_string(),
                message_type: input.message_type,
            })
            .push(BatchOp::IncrementUnread {
                conversation_id: conversation_id.to_string(),
                user_id: receiver_id.to_string(),
                by: 1,
            })
            .push(BatchOp::TouchUpdatedAt { conversation_id: conversation_id.to_string() });

        let receipt = self
            .apply(batch, &conversation, |_| true)
            .await
            .map_err(|e| {
                error!("[DELIVERY] Send in conversation {} failed: {}", conversation_id, e);
                e
            })?;
        let message = receipt
            .messages
            .into_iter()
            .next()
            .ok_or_else(|| ChatError::Store("send batch returned no message".to_string()))?;

        info!(
            "[DELIVERY] {} -> {} in {} ({})",
            sender_id, receiver_id, conversation_id, message.message_type
        );
        Ok(message)
    }

    /// Zeroes `user_id`'s unread counter and flags their unread messages. Returns
    /// whether anything changed; a repeated call is a no-op and publishes nothing.
    pub async fn mark_read(&self, conversation_id: &str, user_id: &str) -> ChatResult<bool> {
        let conversation = self.load(conversation_id).await?;
        if !conversation.has_participant(user_id) {
            return Err(ChatError::Unauthorized(format!(
                "{} is not a participant of conversation {}",
                user_id, conversation_id
            )));
        }

        let mut batch = WriteBatch::new();
        batch
            .push(BatchOp::ResetUnread {
                conversation_id: conversation_id.to_string(),
                user_id: user_id.to_string(),
            })
            .push(BatchOp::MarkReadFor {
                conversation_id: conversation_id.to_string(),
                receiver_id: user_id.to_string(),
            });

        let receipt = self
            .apply(batch, &conversation, |receipt| receipt.rows_changed > 0)
            .await
            .map_err(|e| {
                error!("[DELIVERY] Mark-read in conversation {} failed: {}", conversation_id, e);
                e
            })?;

        let changed = receipt.rows_changed > 0;
        if changed {
            debug!("[DELIVERY] {} read conversation {}", user_id, conversation_id);
        }
        Ok(changed)
    }
}
