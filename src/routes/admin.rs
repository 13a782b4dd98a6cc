use axum::extract::{Path, State};
use axum::Json;

use crate::db;
use crate::error::AppError;
use crate::middleware::auth::AuthUser;
use crate::state::AppState;

fn require_admin(auth: &AuthUser) -> Result<(), AppError> {
    if auth.is_admin {
        Ok(())
    } else {
        Err(AppError::Forbidden("admin access required".to_string()))
    }
}

/// Registry-wide counters for operational dashboards.
pub async fn gateway_stats(
    state: State<AppState>,
    auth: AuthUser,
) -> Result<Json<serde_json::Value>, AppError> {
    require_admin(&auth)?;
    let conversations: serde_json::Map<String, serde_json::Value> = state
        .hub
        .conversation_ids()
        .into_iter()
        .map(|id| {
            let members = state.hub.member_count(&id);
            (id, serde_json::json!(members))
        })
        .collect();

    Ok(Json(serde_json::json!({
        "data": {
            "connectedUsers": state.hub.connected_user_count(),
            "connections": state.hub.connection_count(),
            "activeConversations": state.hub.active_conversation_count(),
            "onlineUsers": state.presence.online_users().len(),
            "conversations": conversations,
        }
    })))
}

pub async fn connected_users(
    state: State<AppState>,
    auth: AuthUser,
) -> Result<Json<serde_json::Value>, AppError> {
    require_admin(&auth)?;
    Ok(Json(serde_json::json!({ "data": state.hub.connected_users() })))
}

/// Live members of a conversation. 404s when the conversation does not
/// exist durably; a known conversation with no live members returns `[]`.
pub async fn conversation_members(
    state: State<AppState>,
    auth: AuthUser,
    Path(conversation_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    require_admin(&auth)?;
    db::conversations::get_conversation(&state.db, &conversation_id).await?;
    let members = state.hub.conversation_members(&conversation_id);
    Ok(Json(serde_json::json!({ "data": members })))
}

/// Force every live connection of a user to close.
pub async fn disconnect_user(
    state: State<AppState>,
    auth: AuthUser,
    Path(user_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    require_admin(&auth)?;
    let closed = state.hub.disconnect_user(&user_id);
    if closed == 0 {
        return Err(AppError::NotFound("user has no live connection".to_string()));
    }
    tracing::info!(%user_id, closed, "admin disconnect issued");
    Ok(Json(serde_json::json!({ "data": { "closedConnections": closed } })))
}
