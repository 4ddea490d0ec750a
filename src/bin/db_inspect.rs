use marketchat::server::database::Database;
use sqlx::Row;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let db_path = std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:data/marketchat.db".to_string());
    println!("Connecting to {}", db_path);
    let db = Database::connect(&db_path, std::time::Duration::from_secs(5)).await?;

    println!("\n-- conversations --");
    let rows = sqlx::query(
        "SELECT id, pair_key, related_item_id, related_item_type, last_message_text, is_active, updated_at \
         FROM conversations ORDER BY updated_at DESC",
    )
    .fetch_all(&db.pool)
    .await?;
    for r in rows.iter() {
        let id: String = r.try_get("id").unwrap_or_default();
        let pair: String = r.try_get("pair_key").unwrap_or_default();
        let item: Option<String> = r.try_get("related_item_id").unwrap_or(None);
        let item_type: Option<String> = r.try_get("related_item_type").unwrap_or(None);
        let last: String = r.try_get("last_message_text").unwrap_or_default();
        let active: bool = r.try_get("is_active").unwrap_or(false);
        let updated_at: i64 = r.try_get("updated_at").unwrap_or(0);
        println!(
            "id={} pair={} item={}:{} active={} updated_at={} last={:?}",
            id,
            pair,
            item_type.unwrap_or_default(),
            item.unwrap_or_default(),
            active,
            updated_at,
            last
        );
    }

    println!("\n-- conversation_participants --");
    let rows = sqlx::query("SELECT conversation_id, user_id, name, unread_count FROM conversation_participants ORDER BY conversation_id, position")
        .fetch_all(&db.pool)
        .await?;
    for r in rows.iter() {
        let conversation_id: String = r.try_get("conversation_id").unwrap_or_default();
        let user_id: String = r.try_get("user_id").unwrap_or_default();
        let name: String = r.try_get("name").unwrap_or_default();
        let unread: i64 = r.try_get("unread_count").unwrap_or(0);
        println!("conversation_id={} user_id={} name={} unread={}", conversation_id, user_id, name, unread);
    }

    println!("\n-- messages (last 10) --");
    let rows = sqlx::query(
        "SELECT id, conversation_id, sender_id, receiver_id, message_type, text, is_read, created_at \
         FROM messages ORDER BY created_at DESC LIMIT 10",
    )
    .fetch_all(&db.pool)
    .await?;
    for r in rows.iter() {
        let id: String = r.try_get("id").unwrap_or_default();
        let conversation_id: String = r.try_get("conversation_id").unwrap_or_default();
        let sender_id: String = r.try_get("sender_id").unwrap_or_default();
        let receiver_id: String = r.try_get("receiver_id").unwrap_or_default();
        let message_type: String = r.try_get("message_type").unwrap_or_default();
        let text: String = r.try_get("text").unwrap_or_default();
        let is_read: bool = r.try_get("is_read").unwrap_or(false);
        let created_at: i64 = r.try_get("created_at").unwrap_or(0);
        println!(
            "id={} conversation_id={} {} -> {} type={} read={} text_len={} created_at={}",
            id,
            conversation_id,
            sender_id,
            receiver_id,
            message_type,
            is_read,
            text.chars().count(),
            created_at
        );
    }

    Ok(())
}
