use crate::common::error::{ChatError, ChatResult};
use crate::common::models::*;
use crate::server::database::Database;
use crate::server::store::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const CONVERSATION_COLUMNS: &str = "c.id, c.related_item_id, c.related_item_type, c.last_message_text, \
    c.last_message_sender, c.last_message_type, c.last_message_at, c.is_active, c.created_at, c.updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, receiver_id, text, message_type, media_url, \
    file_name, file_size, mime_type, is_read, created_at, sender_name, sender_avatar_url";

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(value: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(value).unwrap_or_default()
}

fn parse_message_type(raw: &str) -> ChatResult<MessageType> {
    raw.parse::<MessageType>().map_err(ChatError::Store)
}

struct ParticipantRow {
    conversation_id: String,
    user_id: String,
    details: ParticipantDetails,
    unread_count: u32,
}

impl ParticipantRow {
    fn from_row(row: &SqliteRow) -> ChatResult<Self> {
        let unread: i64 = row.try_get("unread_count")?;
        Ok(Self {
            conversation_id: row.try_get("conversation_id")?,
            user_id: row.try_get("user_id")?,
            details: ParticipantDetails {
                name: row.try_get("name")?,
                avatar_url: row.try_get("avatar_url")?,
                is_verified: row.try_get("is_verified")?,
            },
            unread_count: u32::try_from(unread).unwrap_or(0),
        })
    }
}

fn assemble_conversation(row: &SqliteRow, participants: Vec<ParticipantRow>) -> ChatResult<Conversation> {
    let conversation_id: String = row.try_get("id")?;
    if participants.len() != 2 {
        return Err(ChatError::Store(format!(
            "conversation {} has {} participants",
            conversation_id,
            participants.len()
        )));
    }

    let mut participant_details = BTreeMap::new();
    let mut unread_count = BTreeMap::new();
    let mut ids = Vec::with_capacity(2);
    for p in participants {
        ids.push(p.user_id.clone());
        unread_count.insert(p.user_id.clone(), p.unread_count);
        participant_details.insert(p.user_id, p.details);
    }
    let second = ids.pop().unwrap_or_default();
    let first = ids.pop().unwrap_or_default();

    let related_item_type = match row.try_get::<Option<String>, _>("related_item_type")? {
        Some(raw) => Some(raw.parse::<RelatedItemType>().map_err(ChatError::Store)?),
        None => None,
    };
    let last_type: String = row.try_get("last_message_type")?;

    Ok(Conversation {
        conversation_id,
        participants: [first, second],
        participant_details,
        related_item_id: row.try_get("related_item_id")?,
        related_item_type,
        last_message: LastMessage {
            text: row.try_get("last_message_text")?,
            sender_id: row.try_get("last_message_sender")?,
            timestamp: from_micros(row.try_get("last_message_at")?),
            message_type: parse_message_type(&last_type)?,
        },
        unread_count,
        is_active: row.try_get("is_active")?,
        created_at: from_micros(row.try_get("created_at")?),
        updated_at: from_micros(row.try_get("updated_at")?),
    })
}

fn message_from_row(row: &SqliteRow) -> ChatResult<Message> {
    let message_type: String = row.try_get("message_type")?;
    let file_size: Option<i64> = row.try_get("file_size")?;
    Ok(Message {
        message_id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_id: row.try_get("sender_id")?,
        receiver_id: row.try_get("receiver_id")?,
        text: row.try_get("text")?,
        message_type: parse_message_type(&message_type)?,
        media_url: row.try_get("media_url")?,
        file_name: row.try_get("file_name")?,
        file_size: file_size.and_then(|s| u64::try_from(s).ok()),
        mime_type: row.try_get("mime_type")?,
        is_read: row.try_get("is_read")?,
        created_at: from_micros(row.try_get("created_at")?),
        sender_details: SenderDetails {
            name: row.try_get("sender_name")?,
            avatar_url: row.try_get("sender_avatar_url")?,
        },
    })
}

async fn participants_of<'e, E>(exec: E, conversation_id: &str) -> ChatResult<Vec<ParticipantRow>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT conversation_id, user_id, name, avatar_url, is_verified, unread_count \
         FROM conversation_participants WHERE conversation_id = ? ORDER BY position ASC",
    )
    .bind(conversation_id)
    .fetch_all(exec)
    .await?;
    rows.iter().map(ParticipantRow::from_row).collect()
}

/// SQLite implementation of the document store; one transaction per batch.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Database>,
}

impl SqliteStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn conversations_for_user(&self, user_id: &str) -> ChatResult<Vec<Conversation>> {
        let heads = sqlx::query(&format!(
            "SELECT {} FROM conversations c \
             JOIN conversation_participants p ON p.conversation_id = c.id \
             WHERE p.user_id = ? \
             ORDER BY c.updated_at DESC, c.created_at DESC",
            CONVERSATION_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.db.pool)
        .await?;

        let participant_rows = sqlx::query(
            "SELECT conversation_id, user_id, name, avatar_url, is_verified, unread_count \
             FROM conversation_participants \
             WHERE conversation_id IN (SELECT conversation_id FROM conversation_participants WHERE user_id = ?) \
             ORDER BY conversation_id, position ASC",
        )
        .bind(user_id)
        .fetch_all(&self.db.pool)
        .await?;

        let mut by_conversation: HashMap<String, Vec<ParticipantRow>> = HashMap::new();
        for row in &participant_rows {
            let p = ParticipantRow::from_row(row)?;
            by_conversation.entry(p.conversation_id.clone()).or_default().push(p);
        }

        heads
            .iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                let participants = by_conversation.remove(&id).unwrap_or_default();
                assemble_conversation(row, participants)
            })
            .collect()
    }

    async fn conversation(&self, conversation_id: &str) -> ChatResult<Option<Conversation>> {
        let head = sqlx::query(&format!("SELECT {} FROM conversations c WHERE c.id = ?", CONVERSATION_COLUMNS))
            .bind(conversation_id)
            .fetch_optional(&self.db.pool)
            .await?;
        match head {
            Some(row) => {
                let participants = participants_of(&self.db.pool, conversation_id).await?;
                assemble_conversation(&row, participants).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn create_conversation(&self, draft: NewConversation) -> ChatResult<Conversation> {
        let now = Utc::now();
        let at = micros(now);
        let pair = pair_key(&draft.participants[0], &draft.participants[1]);

        let mut tx = self.db.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO conversations \
             (id, pair_key, related_item_id, related_item_type, last_message_at, is_active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(&draft.conversation_id)
        .bind(&pair)
        .bind(&draft.related_item_id)
        .bind(draft.related_item_type.map(|t| t.as_str()))
        .bind(at)
        .bind(at)
        .bind(at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            let existing: Option<String> =
                sqlx::query_scalar("SELECT id FROM conversations WHERE pair_key = ? AND is_active = 1")
                    .bind(&pair)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return match existing {
                Some(id) => Err(ChatError::AlreadyExists(id)),
                None => Err(ChatError::Store(format!(
                    "conversation {} was not inserted",
                    draft.conversation_id
                ))),
            };
        }

        for (position, user_id) in draft.participants.iter().enumerate() {
            let details = draft
                .participant_details
                .get(user_id)
                .ok_or_else(|| ChatError::InvalidInput(format!("missing details for participant {}", user_id)))?;
            sqlx::query(
                "INSERT INTO conversation_participants \
                 (conversation_id, user_id, position, name, avatar_url, is_verified, unread_count) \
                 VALUES (?, ?, ?, ?, ?, ?, 0)",
            )
            .bind(&draft.conversation_id)
            .bind(user_id)
            .bind(position as i64)
            .bind(&details.name)
            .bind(&details.avatar_url)
            .bind(details.is_verified)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        // Store precision is microseconds
        let stamped = from_micros(at);
        let unread_count = draft.participants.iter().map(|p| (p.clone(), 0)).collect();
        info!("[STORE] Created conversation {} for pair {}", draft.conversation_id, pair);
        Ok(Conversation {
            conversation_id: draft.conversation_id,
            participants: draft.participants,
            participant_details: draft.participant_details,
            related_item_id: draft.related_item_id,
            related_item_type: draft.related_item_type,
            last_message: LastMessage::empty(stamped),
            unread_count,
            is_active: true,
            created_at: stamped,
            updated_at: stamped,
        })
    }

    async fn messages_in(&self, conversation_id: &str) -> ChatResult<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, seq ASC",
            MESSAGE_COLUMNS
        ))
        .bind(conversation_id)
        .fetch_all(&self.db.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn commit(&self, batch: WriteBatch) -> ChatResult<CommitReceipt> {
        let committed_at = Utc::now();
        let stamp = micros(committed_at);
        // Latest message timestamp per conversation written by this batch
        let mut latest: HashMap<ConversationId, i64> = HashMap::new();
        let mut messages = Vec::new();
        let mut rows_changed = 0u64;

        let mut tx = self.db.pool.begin().await?;
        for op in batch.into_ops() {
            match op {
                BatchOp::InsertMessage(m) => {
                    // Strictly increasing within the conversation, assigned here and never by the caller
                    let created_at: Option<i64> = sqlx::query_scalar(
                        "INSERT INTO messages \
                         (id, conversation_id, sender_id, receiver_id, text, message_type, media_url, file_name, \
                          file_size, mime_type, is_read, created_at, sender_name, sender_avatar_url) \
                         SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, \
                                MAX(?, COALESCE((SELECT MAX(created_at) FROM messages WHERE conversation_id = ?), 0) + 1), \
                                ?, ? \
                         WHERE EXISTS (SELECT 1 FROM conversations WHERE id = ? AND is_active = 1) \
                         RETURNING created_at",
                    )
                    .bind(&m.message_id)
                    .bind(&m.conversation_id)
                    .bind(&m.sender_id)
                    .bind(&m.receiver_id)
                    .bind(&m.text)
                    .bind(m.message_type.as_str())
                    .bind(&m.media_url)
                    .bind(&m.file_name)
                    .bind(m.file_size.and_then(|s| i64::try_from(s).ok()))
                    .bind(&m.mime_type)
                    .bind(stamp)
                    .bind(&m.conversation_id)
                    .bind(&m.sender_details.name)
                    .bind(&m.sender_details.avatar_url)
                    .bind(&m.conversation_id)
                    .fetch_optional(&mut *tx)
                    .await?;

                    let created_at = match created_at {
                        Some(created_at) => created_at,
                        None => {
                            // Archived between the caller's check and this insert, or never existed
                            let active: Option<bool> = sqlx::query_scalar("SELECT is_active FROM conversations WHERE id = ?")
                                .bind(&m.conversation_id)
                                .fetch_optional(&mut *tx)
                                .await?;
                            return Err(match active {
                                Some(_) => ChatError::InvalidInput(format!("conversation {} is archived", m.conversation_id)),
                                None => ChatError::NotFound(format!("conversation {}", m.conversation_id)),
                            });
                        }
                    };
                    latest
                        .entry(m.conversation_id.clone())
                        .and_modify(|v| *v = (*v).max(created_at))
                        .or_insert(created_at);
                    rows_changed += 1;
                    messages.push(Message {
                        message_id: m.message_id,
                        conversation_id: m.conversation_id,
                        sender_id: m.sender_id,
                        receiver_id: m.receiver_id,
                        text: m.text,
                        message_type: m.message_type,
                        media_url: m.media_url,
                        file_name: m.file_name,
                        file_size: m.file_size,
                        mime_type: m.mime_type,
                        is_read: false,
                        created_at: from_micros(created_at),
                        sender_details: m.sender_details,
                    });
                }
                BatchOp::SetLastMessage { conversation_id, text, sender_id, message_type } => {
                    let at = latest.get(&conversation_id).copied().unwrap_or(stamp);
                    let affected = sqlx::query(
                        "UPDATE conversations SET last_message_text = ?, last_message_sender = ?, \
                         last_message_type = ?, last_message_at = ? WHERE id = ?",
                    )
                    .bind(&text)
                    .bind(&sender_id)
                    .bind(message_type.as_str())
                    .bind(at)
                    .bind(&conversation_id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                    if affected == 0 {
                        return Err(ChatError::NotFound(format!("conversation {}", conversation_id)));
                    }
                    rows_changed += affected;
                }
                BatchOp::IncrementUnread { conversation_id, user_id, by } => {
                    let affected = sqlx::query(
                        "UPDATE conversation_participants SET unread_count = unread_count + ? \
                         WHERE conversation_id = ? AND user_id = ?",
                    )
                    .bind(i64::from(by))
                    .bind(&conversation_id)
                    .bind(&user_id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                    if affected == 0 {
                        return Err(ChatError::NotFound(format!(
                            "participant {} in conversation {}",
                            user_id, conversation_id
                        )));
                    }
                    rows_changed += affected;
                }
                BatchOp::ResetUnread { conversation_id, user_id } => {
                    rows_changed += sqlx::query(
                        "UPDATE conversation_participants SET unread_count = 0 \
                         WHERE conversation_id = ? AND user_id = ? AND unread_count != 0",
                    )
                    .bind(&conversation_id)
                    .bind(&user_id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                }
                BatchOp::MarkReadFor { conversation_id, receiver_id } => {
                    rows_changed += sqlx::query(
                        "UPDATE messages SET is_read = 1 \
                         WHERE conversation_id = ? AND receiver_id = ? AND is_read = 0",
                    )
                    .bind(&conversation_id)
                    .bind(&receiver_id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                }
                BatchOp::TouchUpdatedAt { conversation_id } => {
                    let at = latest.get(&conversation_id).copied().unwrap_or(stamp);
                    let affected = sqlx::query("UPDATE conversations SET updated_at = MAX(updated_at, ?) WHERE id = ?")
                        .bind(at)
                        .bind(&conversation_id)
                        .execute(&mut *tx)
                        .await?
                        .rows_affected();
                    if affected == 0 {
                        return Err(ChatError::NotFound(format!("conversation {}", conversation_id)));
                    }
                    rows_changed += affected;
                }
            }
        }
        tx.commit().await?;
        debug!("[STORE] Batch committed, {} rows changed", rows_changed);

        Ok(CommitReceipt { committed_at, messages, rows_changed })
    }

    async fn update_participant_details(
        &self,
        user_id: &str,
        details: &ParticipantDetails,
    ) -> ChatResult<Vec<Conversation>> {
        let mut tx = self.db.pool.begin().await?;
        let affected = sqlx::query(
            "UPDATE conversation_participants SET name = ?, avatar_url = ?, is_verified = ? WHERE user_id = ?",
        )
        .bind(&details.name)
        .bind(&details.avatar_url)
        .bind(details.is_verified)
        .bind(user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        if affected == 0 {
            return Ok(Vec::new());
        }
        self.conversations_for_user(user_id).await
    }

    async fn set_active(&self, conversation_id: &str, active: bool) -> ChatResult<()> {
        let affected = sqlx::query("UPDATE conversations SET is_active = ?, updated_at = MAX(updated_at, ?) WHERE id = ?")
            .bind(active)
            .bind(micros(Utc::now()))
            .bind(conversation_id)
            .execute(&self.db.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(ChatError::NotFound(format!("conversation {}", conversation_id)));
        }
        Ok(())
    }

    async fn purge_inactive(&self, cutoff: DateTime<Utc>) -> ChatResult<Vec<Conversation>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM conversations WHERE is_active = 0 AND updated_at < ?")
            .bind(micros(cutoff))
            .fetch_all(&self.db.pool)
            .await?;

        let mut candidates = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(c) = self.conversation(id).await? {
                candidates.push(c);
            }
        }

        let mut purged = Vec::with_capacity(candidates.len());
        let mut tx = self.db.pool.begin().await?;
        for conversation in candidates {
            let deleted = sqlx::query("DELETE FROM conversations WHERE id = ? AND is_active = 0")
                .bind(&conversation.conversation_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if deleted == 0 {
                continue;
            }
            sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
                .bind(&conversation.conversation_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM conversation_participants WHERE conversation_id = ?")
                .bind(&conversation.conversation_id)
                .execute(&mut *tx)
                .await?;
            purged.push(conversation);
        }
        tx.commit().await?;
        Ok(purged)
    }

    async fn stats(&self) -> ChatResult<StoreStats> {
        let conversations = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM conversations")
            .fetch_one(&self.db.pool)
            .await?;
        let active_conversations = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM conversations WHERE is_active = 1")
            .fetch_one(&self.db.pool)
            .await?;
        let messages = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.db.pool)
            .await?;
        let unread_backlog = sqlx::query_scalar::<_, i64>("SELECT COALESCE(SUM(unread_count), 0) FROM conversation_participants")
            .fetch_one(&self.db.pool)
            .await?;
        Ok(StoreStats { conversations, active_conversations, messages, unread_backlog })
    }
}
