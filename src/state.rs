use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;

use crate::gateway::hub::Hub;
use crate::middleware::rate_limit::SlidingWindowLimiter;
use crate::presence::PresenceStore;

#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub hub: Arc<Hub>,
    pub presence: Arc<PresenceStore>,
    pub rate_limiter: Arc<SlidingWindowLimiter>,
    /// Maximum conversation messages a user may send per window.
    pub message_rate_limit: usize,
    pub message_rate_window: Duration,
}
