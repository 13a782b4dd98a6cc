#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use http::{Method, Request};
use sqlx::SqlitePool;

use parleyserver::db;
use parleyserver::gateway::hub::Hub;
use parleyserver::middleware::auth::{create_token_hash, generate_token};
use parleyserver::middleware::rate_limit::SlidingWindowLimiter;
use parleyserver::models::user::{CreateUser, User};
use parleyserver::presence::PresenceStore;
use parleyserver::routes;
use parleyserver::state::AppState;

/// A user created for testing, bundling the User record with its raw token.
pub struct TestUser {
    pub user: User,
    pub token: String,
}

impl TestUser {
    /// Returns the Authorization header value.
    pub fn auth_header(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

/// Test server that owns an in-memory SQLite pool and full AppState.
/// Each instance is isolated — safe for parallel tests.
pub struct TestServer {
    pub state: AppState,
}

impl TestServer {
    /// Create a new TestServer with an in-memory SQLite database.
    pub async fn new() -> Self {
        Self::with_message_limit(100, Duration::from_secs(60)).await
    }

    /// Same, with a custom per-user message rate limit.
    pub async fn with_message_limit(limit: usize, window: Duration) -> Self {
        let pool = db::create_pool("sqlite::memory:")
            .await
            .expect("failed to create test pool");

        let presence = Arc::new(PresenceStore::default());
        let hub = Arc::new(Hub::new(pool.clone(), presence.clone()));

        let state = AppState {
            db: pool,
            hub,
            presence,
            rate_limiter: Arc::new(SlidingWindowLimiter::new()),
            message_rate_limit: limit,
            message_rate_window: window,
        };

        Self { state }
    }

    /// Returns an Axum Router wired to this server's state for `oneshot()` calls.
    pub fn router(&self) -> axum::Router {
        routes::router(self.state.clone())
    }

    /// Returns a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.state.db
    }

    /// Binds a TCP listener on port 0, spawns the server, and returns the base URL.
    pub async fn spawn(&self) -> String {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://127.0.0.1:{}", addr.port())
    }

    /// Create a user and insert a bearer token into `user_tokens` with far-future expiry.
    pub async fn create_user_with_token(&self, username: &str) -> TestUser {
        let user = db::users::create_user(
            self.pool(),
            &CreateUser {
                username: username.to_string(),
                display_name: None,
            },
        )
        .await
        .expect("failed to create test user");

        let token = generate_token();
        let token_hash = create_token_hash(&token);

        sqlx::query(
            "INSERT INTO user_tokens (token_hash, user_id, expires_at) VALUES (?, ?, '2099-12-31T23:59:59')",
        )
        .bind(&token_hash)
        .bind(&user.id)
        .execute(self.pool())
        .await
        .expect("failed to insert test token");

        TestUser { user, token }
    }

    /// Create an admin user with a token. Sets `is_admin = true` on the user.
    pub async fn create_admin_with_token(&self, username: &str) -> TestUser {
        let test_user = self.create_user_with_token(username).await;
        db::users::set_admin(self.pool(), &test_user.user.id, true)
            .await
            .expect("failed to set admin flag");
        test_user
    }

    /// Create a conversation with the creator and recipients as durable
    /// participants. Returns the conversation ID.
    pub async fn create_conversation(&self, creator_id: &str, recipient_ids: &[&str]) -> String {
        let recipients: Vec<String> = recipient_ids.iter().map(|s| s.to_string()).collect();
        let conversation =
            db::conversations::create_conversation(self.pool(), creator_id, None, &recipients)
                .await
                .expect("failed to create test conversation");
        conversation.id
    }
}

// ---------------------------------------------------------------------------
// Request builder helpers
// ---------------------------------------------------------------------------

/// Build an authenticated request with no body.
pub fn authenticated_request(method: Method, uri: &str, auth_header: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", auth_header)
        .body(Body::empty())
        .unwrap()
}

/// Build an unauthenticated request with no body.
pub fn plain_request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

/// Parse a response body into a `serde_json::Value`.
pub async fn parse_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
