use sqlx::{Row, SqlitePool};

use crate::error::AppError;
use crate::models::message::{MessageContent, MessageRow};
use crate::snowflake;

fn row_to_message(row: sqlx::sqlite::SqliteRow) -> MessageRow {
    MessageRow {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        sender_id: row.get("sender_id"),
        text: row.get("text"),
        url: row.get("url"),
        file_name: row.get("file_name"),
        created_at: row.get("created_at"),
    }
}

const SELECT_MESSAGES: &str =
    "SELECT id, conversation_id, sender_id, text, url, file_name, created_at FROM messages";

pub async fn get_message_row(pool: &SqlitePool, message_id: &str) -> Result<MessageRow, AppError> {
    let row = sqlx::query(&format!("{SELECT_MESSAGES} WHERE id = ?"))
        .bind(message_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("unknown_message".to_string()))?;

    Ok(row_to_message(row))
}

/// Persist a message and return its stored form. The returned row carries
/// the server-assigned id and the canonical timestamp.
pub async fn create_message(
    pool: &SqlitePool,
    conversation_id: &str,
    sender_id: &str,
    content: &MessageContent,
) -> Result<MessageRow, AppError> {
    let id = snowflake::generate();
    let created_at = chrono::Utc::now().timestamp_millis();

    sqlx::query(
        "INSERT INTO messages (id, conversation_id, sender_id, text, url, file_name, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(conversation_id)
    .bind(sender_id)
    .bind(&content.text)
    .bind(&content.url)
    .bind(&content.file_name)
    .bind(created_at)
    .execute(pool)
    .await?;

    sqlx::query("UPDATE conversations SET last_message_id = ? WHERE id = ?")
        .bind(&id)
        .bind(conversation_id)
        .execute(pool)
        .await?;

    get_message_row(pool, &id).await
}
