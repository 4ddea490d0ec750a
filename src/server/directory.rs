use crate::common::error::{ChatError, ChatResult};
use crate::common::models::*;
use crate::server::feed::{ChangeBus, ChangeEvent};
use crate::server::identity::IdentityProvider;
use crate::server::store::{bounded, detached, ChatStore, NewConversation};
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Finds or creates the single active conversation between two users and owns
/// its metadata (denormalized participant details, archival).
pub struct ConversationDirectory {
    store: Arc<dyn ChatStore>,
    identity: Arc<dyn IdentityProvider>,
    bus: ChangeBus,
    timeout: Duration,
}

impl ConversationDirectory {
    pub fn new(store: Arc<dyn ChatStore>, identity: Arc<dyn IdentityProvider>, bus: ChangeBus, timeout: Duration) -> Self {
        Self { store, identity, bus, timeout }
    }

    async fn profile_of(&self, user_id: &str) -> ChatResult<UserProfile> {
        bounded(self.timeout, "profile", self.identity.profile(user_id))
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("user {}", user_id)))
    }

    pub async fn find_or_create(
        &self,
        current_user_id: &str,
        other_user_id: &str,
        related_item_id: Option<String>,
        related_item_type: Option<RelatedItemType>,
    ) -> ChatResult<ConversationId> {
        if current_user_id == other_user_id {
            return Err(ChatError::InvalidInput("cannot open a conversation with yourself".to_string()));
        }

        // Linear scan over the caller's conversations. Fine for tens to low hundreds
        // of conversations per user; beyond that this lookup needs an index.
        let mine = bounded(self.timeout, "conversations_for_user", self.store.conversations_for_user(current_user_id)).await?;
        if let Some(existing) = mine.iter().find(|c| c.is_active && c.has_participant(other_user_id)) {
            debug!("[DIRECTORY] Reusing conversation {} for {} and {}", existing.conversation_id, current_user_id, other_user_id);
            return Ok(existing.conversation_id.clone());
        }

        let (current, other) = tokio::try_join!(self.profile_of(current_user_id), self.profile_of(other_user_id))?;
        let mut participant_details = BTreeMap::new();
        participant_details.insert(current.user_id.clone(), current.participant_details());
        participant_details.insert(other.user_id.clone(), other.participant_details());

        let draft = NewConversation {
            conversation_id: Uuid::new_v4().to_string(),
            participants: [current_user_id.to_string(), other_user_id.to_string()],
            participant_details,
            related_item_id,
            related_item_type,
        };

        let store = self.store.clone();
        let bus = self.bus.clone();
        let created = detached("create_conversation", async move {
            let created = store.create_conversation(draft).await?;
            bus.publish(ChangeEvent::Conversation {
                conversation_id: created.conversation_id.clone(),
                participants: created.participants.clone(),
            });
            Ok::<_, ChatError>(created)
        })
        .await;

        match created {
            Ok(created) => {
                info!("[DIRECTORY] Created conversation {} between {} and {}", created.conversation_id, current_user_id, other_user_id);
                Ok(created.conversation_id)
            }
            // A concurrent caller created it between our scan and our insert
            Err(ChatError::AlreadyExists(existing)) => {
                info!("[DIRECTORY] Lost create race for {} and {}, using {}", current_user_id, other_user_id, existing);
                Ok(existing)
            }
            Err(e) => Err(e),
        }
    }

    /// Loads a conversation on behalf of one of its participants.
    pub async fn get(&self, conversation_id: &str, viewer_id: &str) -> ChatResult<Conversation> {
        let conversation = bounded(self.timeout, "load_conversation", self.store.conversation(conversation_id))
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;
        if !conversation.has_participant(viewer_id) {
            return Err(ChatError::Unauthorized(format!(
                "{} is not a participant of conversation {}",
                viewer_id, conversation_id
            )));
        }
        Ok(conversation)
    }

    /// Re-snapshots a user's profile into every conversation they take part in.
    /// Call after a profile update; returns how many conversations were touched.
    pub async fn refresh_participant_details(&self, user_id: &str) -> ChatResult<usize> {
        let profile = self.profile_of(user_id).await?;
        let store = self.store.clone();
        let bus = self.bus.clone();
        let user = user_id.to_string();
        let touched = detached("update_participant_details", async move {
            let touched = store.update_participant_details(&user, &profile.participant_details()).await?;
            for conversation in &touched {
                bus.publish(ChangeEvent::Conversation {
                    conversation_id: conversation.conversation_id.clone(),
                    participants: conversation.participants.clone(),
                });
            }
            Ok::<_, ChatError>(touched)
        })
        .await?;
        info!("[DIRECTORY] Refreshed details of {} in {} conversations", user_id, touched.len());
        Ok(touched.len())
    }

    pub async fn archive(&self, conversation_id: &str, acting_user_id: &str) -> ChatResult<()> {
        let conversation = self.get(conversation_id, acting_user_id).await?;
        if !conversation.is_active {
            return Ok(());
        }
        let store = self.store.clone();
        let bus = self.bus.clone();
        detached("set_active", async move {
            store.set_active(&conversation.conversation_id, false).await?;
            bus.publish(ChangeEvent::Conversation {
                conversation_id: conversation.conversation_id,
                participants: conversation.participants,
            });
            Ok::<_, ChatError>(())
        })
        .await?;
        info!("[DIRECTORY] {} archived conversation {}", acting_user_id, conversation_id);
        Ok(())
    }

    /// Deletes archived conversations not updated since `cutoff`.
    pub async fn purge_inactive(&self, cutoff: DateTime<Utc>) -> ChatResult<usize> {
        let store = self.store.clone();
        let bus = self.bus.clone();
        let purged = detached("purge_inactive", async move {
            let purged = store.purge_inactive(cutoff).await?;
            for conversation in &purged {
                bus.publish(ChangeEvent::Conversation {
                    conversation_id: conversation.conversation_id.clone(),
                    participants: conversation.participants.clone(),
                });
            }
            Ok::<_, ChatError>(purged)
        })
        .await?;
        if !purged.is_empty() {
            info!("[DIRECTORY] Cleaned up {} old conversations", purged.len());
        }
        Ok(purged.len())
    }
}
