use crate::common::models::ConversationId;
use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Store unreachable or a write failed; the operation left no partial state.
    #[error("store failure: {0}")]
    Store(String),

    #[error("store operation '{0}' timed out")]
    Timeout(&'static str),

    #[error("upload failed: {0}")]
    Upload(String),

    /// Conditional create lost against an existing active conversation for the pair.
    #[error("conversation already exists: {0}")]
    AlreadyExists(ConversationId),
}

impl ChatError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::Store(_) | ChatError::Timeout(_))
    }

    /// Short machine-readable tag used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::NotFound(_) => "not_found",
            ChatError::Unauthorized(_) => "unauthorized",
            ChatError::InvalidInput(_) => "invalid_input",
            ChatError::Store(_) | ChatError::Timeout(_) => "transient_store_failure",
            ChatError::Upload(_) => "upload_failure",
            ChatError::AlreadyExists(_) => "already_exists",
        }
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => ChatError::NotFound("row".to_string()),
            // Nothing ran: the pool gave no connection before its acquire timeout
            sqlx::Error::PoolTimedOut => ChatError::Timeout("acquire_connection"),
            other => ChatError::Store(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_errors_are_retryable() {
        assert!(ChatError::Store("locked".into()).is_retryable());
        assert!(ChatError::Timeout("commit").is_retryable());
        assert!(!ChatError::Unauthorized("x".into()).is_retryable());
        assert!(!ChatError::Upload("x".into()).is_retryable());
    }

    #[test]
    fn sqlx_row_not_found_maps_to_not_found() {
        let err: ChatError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.kind(), "not_found");
        let err: ChatError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err, ChatError::Timeout("acquire_connection"));
        assert_eq!(err.kind(), "transient_store_failure");
    }
}
