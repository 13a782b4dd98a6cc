use std::time::Duration;

pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub test_mode: bool,
    /// TTL on an online presence record before it lapses without renewal.
    pub presence_online_ttl: Duration,
    /// TTL on an offline record, bounding how long last-seen is kept.
    pub presence_offline_ttl: Duration,
    /// Conversation messages allowed per user per window.
    pub message_rate_limit: usize,
    pub message_rate_window: Duration,
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(39180),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:parley.db?mode=rwc".to_string()),
            test_mode: std::env::var("PARLEY_TEST_MODE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            presence_online_ttl: Duration::from_secs(env_u64("PARLEY_PRESENCE_ONLINE_TTL", 300)),
            presence_offline_ttl: Duration::from_secs(env_u64(
                "PARLEY_PRESENCE_OFFLINE_TTL",
                86_400,
            )),
            message_rate_limit: env_u64("PARLEY_MESSAGE_RATE_LIMIT", 30) as usize,
            message_rate_window: Duration::from_secs(env_u64("PARLEY_MESSAGE_RATE_WINDOW", 60)),
        }
    }
}
