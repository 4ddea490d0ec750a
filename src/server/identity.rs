// Identity provider seam; profiles and sessions are owned by an external service
use crate::common::error::ChatResult;
use crate::common::models::{UserId, UserProfile};
use crate::server::database::Database;
use async_trait::async_trait;
use chrono::Utc;
use log::{info, warn};
use sqlx::Row;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn profile(&self, user_id: &str) -> ChatResult<Option<UserProfile>>;

    /// Resolves a session token to the user it was issued for, if still valid.
    async fn authenticate(&self, session_token: &str) -> ChatResult<Option<UserId>>;
}

/// Identity provider backed by the mirrored `users` and `sessions` tables.
#[derive(Clone)]
pub struct SqliteIdentity {
    db: Arc<Database>,
}

impl SqliteIdentity {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn upsert_profile(&self, profile: &UserProfile) -> ChatResult<()> {
        sqlx::query(
            "INSERT INTO users (id, name, avatar_url, is_verified, created_at) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, avatar_url = excluded.avatar_url, \
             is_verified = excluded.is_verified",
        )
        .bind(&profile.user_id)
        .bind(&profile.name)
        .bind(&profile.avatar_url)
        .bind(profile.is_verified)
        .bind(Utc::now().timestamp())
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    pub async fn issue_session(&self, user_id: &str, ttl: chrono::Duration) -> ChatResult<String> {
        let token = Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        sqlx::query("INSERT INTO sessions (session_token, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)")
            .bind(&token)
            .bind(user_id)
            .bind(now.timestamp())
            .bind((now + ttl).timestamp())
            .execute(&self.db.pool)
            .await?;
        info!("[AUTH] Issued session for user {}", user_id);
        Ok(token)
    }
}

#[async_trait]
impl IdentityProvider for SqliteIdentity {
    async fn profile(&self, user_id: &str) -> ChatResult<Option<UserProfile>> {
        let row = sqlx::query("SELECT id, name, avatar_url, is_verified FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.db.pool)
            .await?;
        match row {
            Some(r) => Ok(Some(UserProfile {
                user_id: r.try_get("id")?,
                name: r.try_get("name")?,
                avatar_url: r.try_get("avatar_url")?,
                is_verified: r.try_get("is_verified")?,
            })),
            None => Ok(None),
        }
    }

    async fn authenticate(&self, session_token: &str) -> ChatResult<Option<UserId>> {
        let now = Utc::now().timestamp();
        let user_id: Option<String> =
            sqlx::query_scalar("SELECT user_id FROM sessions WHERE session_token = ? AND expires_at > ?")
                .bind(session_token)
                .bind(now)
                .fetch_optional(&self.db.pool)
                .await?;
        if user_id.is_none() {
            warn!("[AUTH] Session not found or expired");
        }
        Ok(user_id)
    }
}
