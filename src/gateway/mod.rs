pub mod hub;
pub mod protocol;

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::db;
use crate::error::AppError;
use crate::middleware::auth::{self, AuthUser};
use crate::state::AppState;
use hub::{ClientHandle, Outbound};
use protocol::{Envelope, Inbound};

/// How long a fresh socket gets to present a valid `connect` frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Handshake: the first frame must be a `connect` carrying a valid
    // token. Anything else gets one error envelope and the socket closes
    // without ever touching the hub.
    let handshake_timeout = tokio::time::sleep(HANDSHAKE_TIMEOUT);
    tokio::pin!(handshake_timeout);

    let user: AuthUser = loop {
        tokio::select! {
            _ = &mut handshake_timeout => {
                let err = protocol::new_error("unauthorized", "handshake timed out", None);
                let _ = ws_sink.send(Message::Text(err.to_json().into())).await;
                return;
            }
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match protocol::classify(&text) {
                            Ok(Inbound::Connect(req)) => {
                                match auth::verify_token(&state.db, &req.token).await {
                                    Some(user) => break user,
                                    None => {
                                        let err = protocol::new_error(
                                            "unauthorized",
                                            "invalid or expired token",
                                            None,
                                        );
                                        let _ = ws_sink
                                            .send(Message::Text(err.to_json().into()))
                                            .await;
                                        return;
                                    }
                                }
                            }
                            Ok(_) => {
                                let err = protocol::new_error(
                                    "unauthorized",
                                    "connect must be the first message",
                                    None,
                                );
                                let _ = ws_sink.send(Message::Text(err.to_json().into())).await;
                                return;
                            }
                            Err(perr) => {
                                let err = protocol::new_error(perr.code, &perr.message, None);
                                let _ = ws_sink.send(Message::Text(err.to_json().into())).await;
                                return;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    _ => {}
                }
            }
        }
    };

    let connection_id = uuid::Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    // Registration sends the `connect` acknowledgement through tx, so the
    // client sees it as the first post-handshake frame.
    state.hub.register_client(ClientHandle {
        connection_id: connection_id.clone(),
        user_id: user.user_id.clone(),
        display_name: user.display_name.clone(),
        tx: tx.clone(),
    });

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(Outbound::Frame(frame)) => {
                        if ws_sink.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        // Failures are contained to this connection as an
                        // error envelope; the session keeps running.
                        if let Some(err) = dispatch(&state, &user, &text).await {
                            let _ = tx.send(Outbound::Frame(err.to_json()));
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    state.hub.unregister_client(&user.user_id, &connection_id);
}

/// Classify and execute one inbound frame. Returns the error envelope to
/// send back to the offending connection, or `None` on success.
async fn dispatch(state: &AppState, user: &AuthUser, text: &str) -> Option<Envelope> {
    let inbound = match protocol::classify(text) {
        Ok(inbound) => inbound,
        Err(perr) => return Some(protocol::new_error(perr.code, &perr.message, None)),
    };

    let result = match inbound {
        Inbound::Connect(_) => Err(AppError::BadRequest(
            "connection is already authenticated".to_string(),
        )),
        Inbound::Join(data) => handle_join(state, user, &data).await,
        Inbound::Leave(data) => handle_leave(state, user, &data),
        Inbound::Message(data) => handle_message(state, user, &data).await,
    };

    match result {
        Ok(()) => None,
        Err(err) => {
            tracing::debug!(user_id = %user.user_id, code = err.code(), "frame rejected");
            Some(protocol::error_envelope(&err))
        }
    }
}

/// Joins are authorized against durable participation before the hub's
/// live membership is touched.
async fn handle_join(
    state: &AppState,
    user: &AuthUser,
    data: &protocol::MembershipData,
) -> Result<(), AppError> {
    if data.user_id != user.user_id {
        return Err(AppError::Forbidden(
            "userId must match the authenticated user".to_string(),
        ));
    }
    db::conversations::get_conversation(&state.db, &data.conversation_id).await?;
    if !db::conversations::is_member(&state.db, &data.conversation_id, &user.user_id).await? {
        return Err(AppError::Forbidden(
            "not a participant of this conversation".to_string(),
        ));
    }
    state.hub.join_conversation(&data.conversation_id, &user.user_id)
}

fn handle_leave(
    state: &AppState,
    user: &AuthUser,
    data: &protocol::MembershipData,
) -> Result<(), AppError> {
    if data.user_id != user.user_id {
        return Err(AppError::Forbidden(
            "userId must match the authenticated user".to_string(),
        ));
    }
    state.hub.leave_conversation(&data.conversation_id, &user.user_id);
    Ok(())
}

async fn handle_message(
    state: &AppState,
    user: &AuthUser,
    data: &protocol::ConversationMessageData,
) -> Result<(), AppError> {
    if data.sender_id != user.user_id {
        return Err(AppError::Forbidden(
            "senderId must match the authenticated user".to_string(),
        ));
    }

    let key = format!("user:{}:message", user.user_id);
    let decision = state.rate_limiter.check_and_record(
        &key,
        state.message_rate_limit,
        state.message_rate_window,
    );
    if !decision.allowed {
        return Err(AppError::RateLimited {
            retry_after: decision.retry_after,
        });
    }

    state.hub.handle_conversation_message(data).await?;
    Ok(())
}
