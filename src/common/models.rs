// Common models shared between the messaging core and its transports
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type UserId = String;
pub type ConversationId = String;
pub type MessageId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Document,
    System,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::Document => "document",
            MessageType::System => "system",
        }
    }

    /// Image and document messages reference an uploaded blob.
    pub fn carries_media(&self) -> bool {
        matches!(self, MessageType::Image | MessageType::Document)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageType::Text),
            "image" => Ok(MessageType::Image),
            "document" => Ok(MessageType::Document),
            "system" => Ok(MessageType::System),
            other => Err(format!("unknown message type '{}'", other)),
        }
    }
}

/// Listing that prompted a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelatedItemType {
    Product,
    Service,
}

impl RelatedItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelatedItemType::Product => "product",
            RelatedItemType::Service => "service",
        }
    }
}

impl FromStr for RelatedItemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "product" => Ok(RelatedItemType::Product),
            "service" => Ok(RelatedItemType::Service),
            other => Err(format!("unknown related item type '{}'", other)),
        }
    }
}

/// Profile record owned by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: UserId,
    pub name: String,
    pub avatar_url: Option<String>,
    pub is_verified: bool,
}

impl UserProfile {
    pub fn participant_details(&self) -> ParticipantDetails {
        ParticipantDetails {
            name: self.name.clone(),
            avatar_url: self.avatar_url.clone(),
            is_verified: self.is_verified,
        }
    }

    pub fn sender_details(&self) -> SenderDetails {
        SenderDetails {
            name: self.name.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

/// Snapshot of a participant taken when the conversation was created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantDetails {
    pub name: String,
    pub avatar_url: Option<String>,
    pub is_verified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SenderDetails {
    pub name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastMessage {
    pub text: String,
    pub sender_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub message_type: MessageType,
}

impl LastMessage {
    pub fn empty(at: DateTime<Utc>) -> Self {
        Self {
            text: String::new(),
            sender_id: String::new(),
            timestamp: at,
            message_type: MessageType::Text,
        }
    }

    /// Summary text for a send; non-text messages without a caption read "Sent image" etc.
    pub fn summary_text(input: &MessageInput) -> String {
        if input.text.is_empty() {
            format!("Sent {}", input.message_type)
        } else {
            input.text.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub conversation_id: ConversationId,
    pub participants: [UserId; 2],
    pub participant_details: BTreeMap<UserId, ParticipantDetails>,
    pub related_item_id: Option<String>,
    pub related_item_type: Option<RelatedItemType>,
    pub last_message: LastMessage,
    pub unread_count: BTreeMap<UserId, u32>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }

    pub fn other_participant(&self, user_id: &str) -> Option<&UserId> {
        match &self.participants {
            [a, b] if a == user_id => Some(b),
            [a, b] if b == user_id => Some(a),
            _ => None,
        }
    }

    pub fn unread_for(&self, user_id: &str) -> u32 {
        self.unread_count.get(user_id).copied().unwrap_or(0)
    }

    pub fn pair_key(&self) -> String {
        pair_key(&self.participants[0], &self.participants[1])
    }
}

/// Canonical key for an unordered participant pair.
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}:{}", a, b)
    } else {
        format!("{}:{}", b, a)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
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
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub sender_details: SenderDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageInput {
    #[serde(default)]
    pub text: String,
    pub message_type: MessageType,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl MessageInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            message_type: MessageType::Text,
            media_url: None,
            file_name: None,
            file_size: None,
            mime_type: None,
        }
    }

    /// Wraps an uploaded attachment; the caption may be empty.
    pub fn attachment(kind: MessageType, attachment: Attachment, caption: impl Into<String>) -> Self {
        Self {
            text: caption.into(),
            message_type: kind,
            media_url: Some(attachment.url),
            file_name: Some(attachment.file_name),
            file_size: Some(attachment.file_size),
            mime_type: Some(attachment.mime_type),
        }
    }
}

/// Result of a blob upload, embedded into a later send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
}
