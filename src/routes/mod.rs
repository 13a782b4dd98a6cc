mod admin;
mod health;

use axum::middleware as axum_mw;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::middleware::rate_limit::rate_limit_middleware;
use crate::state::AppState;

/// Build the full application router. Consumes the state so middleware
/// layers that need `State<AppState>` (e.g. rate limiter) can be wired up.
pub fn router(state: AppState) -> Router {
    let api = api_routes(&state);

    Router::new()
        .route("/health", get(health::health))
        .route("/ws", get(crate::gateway::ws_upgrade))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/version", get(health::version))
        // Operational views over live hub state (admin only)
        .route("/admin/gateway/stats", get(admin::gateway_stats))
        .route("/admin/users/connected", get(admin::connected_users))
        .route(
            "/admin/conversations/{conversation_id}/members",
            get(admin::conversation_members),
        )
        .route(
            "/admin/users/{user_id}/disconnect",
            post(admin::disconnect_user),
        )
        // Rate limit on all API routes
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
}
