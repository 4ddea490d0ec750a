use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    /// Opens the pool. `acquire_timeout` is the deadline for getting a connection,
    /// which is where writes wait when the store is busy.
    pub async fn connect(database_url: &str, acquire_timeout: Duration) -> Result<Self, sqlx::Error> {
        info!("🔗 Attempting to connect to database: {}", database_url);

        // Extract file path from database URL to create directory if needed
        let file_path = if let Some(path_part) = database_url.strip_prefix("sqlite://") {
            path_part.split('?').next().unwrap_or(path_part)
        } else if let Some(path_part) = database_url.strip_prefix("sqlite:") {
            path_part.split('?').next().unwrap_or(path_part)
        } else {
            database_url
        };

        if let Some(parent) = std::path::Path::new(file_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                debug!("📁 Directory {:?} does not exist, creating...", parent);
                std::fs::create_dir_all(parent).map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(acquire_timeout)
            .connect_with(options)
            .await?;

        info!("✅ Database connection successful!");
        Ok(Self { pool })
    }

    /// Private in-memory database; a single connection that never expires so the data survives.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        // Profiles mirrored from the identity provider
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                avatar_url TEXT,
                is_verified INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Sessions
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Conversations; timestamps are microseconds since the epoch
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                pair_key TEXT NOT NULL,
                related_item_id TEXT,
                related_item_type TEXT,
                last_message_text TEXT NOT NULL DEFAULT '',
                last_message_sender TEXT NOT NULL DEFAULT '',
                last_message_type TEXT NOT NULL DEFAULT 'text',
                last_message_at INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // At most one active conversation per participant pair
        sqlx::query(r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_active_pair
                ON conversations (pair_key) WHERE is_active = 1;
        "#).execute(&self.pool).await?;

        // Participants with their denormalized details and unread counters
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS conversation_participants (
                conversation_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                avatar_url TEXT,
                is_verified INTEGER NOT NULL DEFAULT 0,
                unread_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (conversation_id, user_id)
            );
        "#).execute(&self.pool).await?;

        sqlx::query(r#"
            CREATE INDEX IF NOT EXISTS idx_participants_user
                ON conversation_participants (user_id);
        "#).execute(&self.pool).await?;

        // Messages
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT UNIQUE NOT NULL,
                conversation_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                text TEXT NOT NULL,
                message_type TEXT NOT NULL,
                media_url TEXT,
                file_name TEXT,
                file_size INTEGER,
                mime_type TEXT,
                is_read INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                sender_name TEXT NOT NULL,
                sender_avatar_url TEXT
            );
        "#).execute(&self.pool).await?;

        sqlx::query(r#"
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages (conversation_id, created_at);
        "#).execute(&self.pool).await?;

        sqlx::query(r#"
            CREATE INDEX IF NOT EXISTS idx_messages_unread
                ON messages (conversation_id, receiver_id, is_read);
        "#).execute(&self.pool).await?;

        Ok(())
    }
}
