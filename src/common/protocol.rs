// Frames exchanged over the WebSocket connection, JSON text tagged by "type"
use crate::common::error::ChatError;
use crate::common::models::*;
use serde::{Deserialize, Serialize};

fn default_read_on_view() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Must be the first frame of a connection.
    Auth { session_token: String },

    OpenConversation {
        request_id: String,
        other_user_id: UserId,
        #[serde(default)]
        related_item_id: Option<String>,
        #[serde(default)]
        related_item_type: Option<RelatedItemType>,
    },

    SendMessage {
        request_id: String,
        conversation_id: ConversationId,
        input: MessageInput,
    },

    UploadAttachment {
        request_id: String,
        conversation_id: ConversationId,
        kind: MessageType,
        #[serde(default)]
        file_name: Option<String>,
        #[serde(default)]
        mime_type: Option<String>,
        data_base64: String,
    },

    SubscribeConversations { request_id: String },

    SubscribeMessages {
        request_id: String,
        conversation_id: ConversationId,
        #[serde(default = "default_read_on_view")]
        read_on_view: bool,
    },

    SubscribeUnreadTotal { request_id: String },

    Unsubscribe { request_id: String, subscription_id: String },

    MarkRead { request_id: String, conversation_id: ConversationId },

    Archive { request_id: String, conversation_id: ConversationId },
}

impl ClientFrame {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ClientFrame::Auth { .. } => None,
            ClientFrame::OpenConversation { request_id, .. }
            | ClientFrame::SendMessage { request_id, .. }
            | ClientFrame::UploadAttachment { request_id, .. }
            | ClientFrame::SubscribeConversations { request_id }
            | ClientFrame::SubscribeMessages { request_id, .. }
            | ClientFrame::SubscribeUnreadTotal { request_id }
            | ClientFrame::Unsubscribe { request_id, .. }
            | ClientFrame::MarkRead { request_id, .. }
            | ClientFrame::Archive { request_id, .. } => Some(request_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AuthResponse {
        success: bool,
        user_id: Option<UserId>,
        error: Option<String>,
    },
    ConversationOpened {
        request_id: String,
        conversation: Conversation,
    },
    MessageSent {
        request_id: String,
        message: Message,
    },
    AttachmentUploaded {
        request_id: String,
        attachment: Attachment,
    },
    Subscribed {
        request_id: String,
        subscription_id: String,
    },
    Unsubscribed {
        request_id: String,
        subscription_id: String,
    },
    MarkedRead {
        request_id: String,
        conversation_id: ConversationId,
        changed: bool,
    },
    Archived {
        request_id: String,
        conversation_id: ConversationId,
    },
    ConversationsSnapshot {
        subscription_id: String,
        conversations: Vec<Conversation>,
    },
    MessagesSnapshot {
        subscription_id: String,
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    UnreadTotal {
        subscription_id: String,
        total: u64,
    },
    Error {
        request_id: Option<String>,
        kind: String,
        message: String,
        retryable: bool,
    },
}

impl ServerFrame {
    pub fn error(request_id: Option<&str>, err: &ChatError) -> Self {
        ServerFrame::Error {
            request_id: request_id.map(str::to_string),
            kind: err.kind().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }

    pub fn auth_failed(reason: impl Into<String>) -> Self {
        ServerFrame::AuthResponse {
            success: false,
            user_id: None,
            error: Some(reason.into()),
        }
    }
}
