// Facade the transports call into; the acting user always comes from the authenticated session
use crate::common::error::{ChatError, ChatResult};
use crate::common::models::*;
use crate::server::attachments::{AttachmentUploader, BlobStore};
use crate::server::config::{ServerConfig, MAX_RETENTION_DAYS};
use crate::server::delivery::DeliveryCoordinator;
use crate::server::directory::ConversationDirectory;
use crate::server::feed::{ChangeBus, LiveFeed};
use crate::server::identity::IdentityProvider;
use crate::server::store::ChatStore;
use chrono::Utc;
use std::sync::Arc;

pub struct ChatService {
    store: Arc<dyn ChatStore>,
    identity: Arc<dyn IdentityProvider>,
    bus: ChangeBus,
    directory: ConversationDirectory,
    delivery: Arc<DeliveryCoordinator>,
    feed: LiveFeed,
    uploader: AttachmentUploader,
    retention: chrono::Duration,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn ChatStore>,
        identity: Arc<dyn IdentityProvider>,
        blobs: Arc<dyn BlobStore>,
        bus: ChangeBus,
        config: &ServerConfig,
    ) -> Self {
        let delivery = Arc::new(DeliveryCoordinator::new(store.clone(), identity.clone(), bus.clone(), config));
        let directory = ConversationDirectory::new(store.clone(), identity.clone(), bus.clone(), config.store_timeout);
        let feed = LiveFeed::new(store.clone(), bus.clone(), delivery.clone(), config.store_timeout);
        let uploader = AttachmentUploader::new(blobs, config.max_upload_bytes);

        Self {
            store,
            identity,
            bus,
            directory,
            delivery,
            feed,
            uploader,
            retention: chrono::Duration::days(config.inactive_retention_days.clamp(1, MAX_RETENTION_DAYS)),
        }
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    pub fn identity(&self) -> &Arc<dyn IdentityProvider> {
        &self.identity
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    pub fn directory(&self) -> &ConversationDirectory {
        &self.directory
    }

    pub fn delivery(&self) -> &DeliveryCoordinator {
        &self.delivery
    }

    pub fn feed(&self) -> &LiveFeed {
        &self.feed
    }

    pub async fn authenticate(&self, session_token: &str) -> ChatResult<Option<UserId>> {
        self.identity.authenticate(session_token).await
    }

    /// Finds or creates the conversation with `other_user_id` and returns it.
    pub async fn open_conversation(
        &self,
        user_id: &str,
        other_user_id: &str,
        related_item_id: Option<String>,
        related_item_type: Option<RelatedItemType>,
    ) -> ChatResult<Conversation> {
        let conversation_id = self
            .directory
            .find_or_create(user_id, other_user_id, related_item_id, related_item_type)
            .await?;
        self.directory.get(&conversation_id, user_id).await
    }

    /// Sends as `user_id`; the receiver is the other participant. System
    /// notices are server-originated and never accepted from a client.
    pub async fn send_from(&self, user_id: &str, conversation_id: &str, input: MessageInput) -> ChatResult<Message> {
        if input.message_type == MessageType::System {
            return Err(ChatError::InvalidInput("system messages cannot be sent by users".to_string()));
        }
        let conversation = self.directory.get(conversation_id, user_id).await?;
        let receiver = conversation
            .other_participant(user_id)
            .cloned()
            .ok_or_else(|| ChatError::Unauthorized(format!("{} has no counterpart in {}", user_id, conversation_id)))?;
        self.delivery.send(conversation_id, user_id, &receiver, input).await
    }

    pub async fn upload_attachment(
        &self,
        user_id: &str,
        conversation_id: &str,
        kind: MessageType,
        file_name: Option<&str>,
        mime_type: Option<&str>,
        payload: &[u8],
    ) -> ChatResult<Attachment> {
        self.directory.get(conversation_id, user_id).await?;
        self.uploader.upload(payload, file_name, mime_type, conversation_id, kind).await
    }

    pub async fn mark_read(&self, user_id: &str, conversation_id: &str) -> ChatResult<bool> {
        self.delivery.mark_read(conversation_id, user_id).await
    }

    pub async fn archive(&self, user_id: &str, conversation_id: &str) -> ChatResult<()> {
        self.directory.archive(conversation_id, user_id).await
    }

    /// Removes archived conversations older than the configured retention.
    pub async fn cleanup_inactive(&self) -> ChatResult<usize> {
        self.directory.purge_inactive(Utc::now() - self.retention).await
    }
}
