use std::sync::Arc;

use tokio::net::TcpListener;

use parleyserver::config::Config;
use parleyserver::gateway::hub::Hub;
use parleyserver::middleware::rate_limit::SlidingWindowLimiter;
use parleyserver::presence::PresenceStore;
use parleyserver::state::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parleyserver=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env();
    print_banner(&config);

    let db = parleyserver::db::create_pool(&config.database_url)
        .await
        .expect("failed to create database pool");

    let presence = Arc::new(PresenceStore::with_ttls(
        config.presence_online_ttl,
        config.presence_offline_ttl,
    ));
    let hub = Arc::new(Hub::new(db.clone(), presence.clone()));

    let state = AppState {
        db,
        hub,
        presence,
        rate_limiter: Arc::new(SlidingWindowLimiter::new()),
        message_rate_limit: config.message_rate_limit,
        message_rate_window: config.message_rate_window,
    };

    let app = parleyserver::routes::router(state);

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .expect("failed to bind");

    let actual_port = listener
        .local_addr()
        .expect("failed to get local address")
        .port();
    eprintln!("  \x1b[32m→ listening on 0.0.0.0:{actual_port}\x1b[0m");
    eprintln!();

    axum::serve(listener, app).await.expect("server error");
}

fn print_banner(config: &Config) {
    let version = env!("CARGO_PKG_VERSION");

    eprintln!();
    eprintln!("  \x1b[1;36mparley\x1b[0m \x1b[2mv{version}\x1b[0m");
    eprintln!();
    eprintln!("  \x1b[2mport\x1b[0m         {}", config.port);
    eprintln!("  \x1b[2mdatabase\x1b[0m     {}", config.database_url);
    eprintln!(
        "  \x1b[2mmsg limit\x1b[0m    {} per {}s",
        config.message_rate_limit,
        config.message_rate_window.as_secs()
    );

    if config.test_mode {
        eprintln!();
        eprintln!("  \x1b[33m! test mode enabled\x1b[0m");
    }

    eprintln!();
}
