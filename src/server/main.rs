// src/server/main.rs
// Entry point for the marketchat WebSocket server
use log::{error, info, warn};
use marketchat::server::attachments::LocalBlobStore;
use marketchat::server::config::ServerConfig;
use marketchat::server::database::Database;
use marketchat::server::feed::ChangeBus;
use marketchat::server::identity::SqliteIdentity;
use marketchat::server::redis_relay::RedisRelay;
use marketchat::server::service::ChatService;
use marketchat::server::sqlite_store::SqliteStore;
use marketchat::server::websocket::ChatWebSocketManager;
use marketchat::utils::stats;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    std::env::set_var("RUST_LOG", &config.log_level);
    env_logger::init();

    let database = Arc::new(Database::connect(&config.database_url, config.store_timeout).await?);
    info!("🗄️ Running database migrations...");
    database.migrate().await.map_err(|e| {
        error!("Database migration failed: {}", e);
        e
    })?;
    info!("✅ Database migrations completed successfully");

    let store = Arc::new(SqliteStore::new(database.clone()));
    let identity = Arc::new(SqliteIdentity::new(database.clone()));
    let blobs = Arc::new(LocalBlobStore::new(&config.blob_root, &config.blob_public_url)?);
    let bus = ChangeBus::new();
    let service = Arc::new(ChatService::new(store.clone(), identity, blobs, bus.clone(), &config));
    let ws_manager = Arc::new(ChatWebSocketManager::new(service.clone()));

    // Cross-instance fan-out only when Redis is configured
    if let Some(redis_url) = &config.redis_url {
        match RedisRelay::connect(redis_url).await {
            Ok(relay) => {
                relay.start(bus.clone());
            }
            Err(e) => warn!("Redis relay disabled, running single-instance: {}", e),
        }
    }

    let stats_store = store.clone();
    let stats_manager = ws_manager.clone();
    let stats_path = config.stats_log_path.clone();
    let stats_interval = config.stats_interval;
    tokio::spawn(async move {
        info!("📊 Starting stats logger - every {:?} to: {}", stats_interval, stats_path);
        stats::start_stats_logger(stats_store, stats_manager, &stats_path, stats_interval).await;
    });

    let cleanup_service = service.clone();
    let cleanup_interval = config.cleanup_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cleanup_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = cleanup_service.cleanup_inactive().await {
                warn!("Inactive conversation cleanup failed: {}", e);
            }
        }
    });

    start_websocket_server(&config.bind_addr(), ws_manager).await
}

async fn start_websocket_server(addr: &str, ws_manager: Arc<ChatWebSocketManager>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket server listening on {}", addr);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept failed: {}", e);
                continue;
            }
        };
        info!("New WebSocket connection from {}", peer);
        let ws_manager = ws_manager.clone();

        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws_stream) => {
                    if let Err(e) = ws_manager.handle_connection(ws_stream).await {
                        error!("Error handling WebSocket connection from {}: {}", peer, e);
                    }
                }
                Err(e) => {
                    error!("Error during WebSocket handshake: {}", e);
                }
            }
        });
    }
}
