use std::sync::Arc;

use log::{error, info};

use pollstream::config::Config;
use pollstream::db::Database;
use pollstream::engine::Engine;
use pollstream::{gateway, tasks};

#[tokio::main]
async fn main() {
    // Initialize logging
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = Config::load();

    // Initialize database
    let database = match Database::new().await {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            return;
        }
    };

    let engine = Arc::new(Engine::new(database));

    // --- Start Background Task for Ending Polls ---
    let sweeper = Arc::clone(&engine);
    let sweep_interval = config.sweep_interval_seconds;
    tokio::spawn(async move {
        tasks::poll_ender::check_expired_polls_task(sweeper, sweep_interval).await;
    });
    // --- End Background Task ---

    let app = gateway::router(Arc::clone(&engine), config.outbound_queue_capacity);
    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", config.bind_addr, e);
            return;
        }
    };
    info!("Gateway listening on {}", config.bind_addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
    }
}
