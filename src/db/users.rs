use sqlx::{Row, SqlitePool};

use crate::error::AppError;
use crate::models::user::{CreateUser, User};
use crate::snowflake;

fn row_to_user(row: sqlx::sqlite::SqliteRow) -> User {
    User {
        id: row.get("id"),
        username: row.get("username"),
        display_name: row.get("display_name"),
        is_admin: row.get("is_admin"),
        created_at: row.get("created_at"),
    }
}

const SELECT_USERS: &str =
    "SELECT id, username, display_name, is_admin, created_at FROM users";

pub async fn get_user(pool: &SqlitePool, user_id: &str) -> Result<User, AppError> {
    let row = sqlx::query(&format!("{SELECT_USERS} WHERE id = ?"))
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("unknown_user".to_string()))?;

    Ok(row_to_user(row))
}

pub async fn create_user(pool: &SqlitePool, input: &CreateUser) -> Result<User, AppError> {
    let id = snowflake::generate();
    let display_name = input.display_name.as_deref().unwrap_or(&input.username);

    sqlx::query("INSERT INTO users (id, username, display_name) VALUES (?, ?, ?)")
        .bind(&id)
        .bind(&input.username)
        .bind(display_name)
        .execute(pool)
        .await?;

    get_user(pool, &id).await
}

pub async fn set_admin(pool: &SqlitePool, user_id: &str, is_admin: bool) -> Result<(), AppError> {
    sqlx::query("UPDATE users SET is_admin = ? WHERE id = ?")
        .bind(is_admin)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}
