use sqlx::{Row, SqlitePool};

use crate::error::AppError;
use crate::models::conversation::ConversationRow;
use crate::snowflake;

fn row_to_conversation(row: sqlx::sqlite::SqliteRow) -> ConversationRow {
    ConversationRow {
        id: row.get("id"),
        kind: row.get("kind"),
        name: row.get("name"),
        owner_id: row.get("owner_id"),
        last_message_id: row.get("last_message_id"),
        created_at: row.get("created_at"),
    }
}

const SELECT_CONVERSATIONS: &str =
    "SELECT id, kind, name, owner_id, last_message_id, created_at FROM conversations";

pub async fn get_conversation(
    pool: &SqlitePool,
    conversation_id: &str,
) -> Result<ConversationRow, AppError> {
    let row = sqlx::query(&format!("{SELECT_CONVERSATIONS} WHERE id = ?"))
        .bind(conversation_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("unknown_conversation".to_string()))?;

    Ok(row_to_conversation(row))
}

/// Durable participant check, used to authorize joins. Distinct from the
/// Hub's in-memory membership, which only tracks live sockets.
pub async fn is_member(
    pool: &SqlitePool,
    conversation_id: &str,
    user_id: &str,
) -> Result<bool, AppError> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM conversation_participants WHERE conversation_id = ? AND user_id = ?",
    )
    .bind(conversation_id)
    .bind(user_id)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

/// Add a participant. No-op if already present.
pub async fn add_participant(
    pool: &SqlitePool,
    conversation_id: &str,
    user_id: &str,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id) VALUES (?, ?)",
    )
    .bind(conversation_id)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Create a conversation with the creator and all recipients as durable
/// participants. Two participants make a "direct" conversation, more make
/// a "group".
pub async fn create_conversation(
    pool: &SqlitePool,
    creator_id: &str,
    name: Option<&str>,
    recipient_ids: &[String],
) -> Result<ConversationRow, AppError> {
    if recipient_ids.is_empty() {
        return Err(AppError::BadRequest(
            "at least one recipient is required".into(),
        ));
    }

    let kind = if recipient_ids.len() == 1 {
        "direct"
    } else {
        "group"
    };

    let id = snowflake::generate();
    sqlx::query("INSERT INTO conversations (id, kind, name, owner_id) VALUES (?, ?, ?, ?)")
        .bind(&id)
        .bind(kind)
        .bind(name)
        .bind(creator_id)
        .execute(pool)
        .await?;

    add_participant(pool, &id, creator_id).await?;
    for rid in recipient_ids {
        add_participant(pool, &id, rid).await?;
    }

    get_conversation(pool, &id).await
}
