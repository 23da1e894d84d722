//! Entry point: load config, wire dependencies, and run the server.

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use unitask_chat::config::Config;
use unitask_chat::db::{self, ChatStore, MemoryStore, PgChatStore};
use unitask_chat::{create_app, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("config: {}", e))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store: Arc<dyn ChatStore> = match &config.database_url {
        Some(url) => {
            let pool = db::create_pool(url, config.persist_timeout).await?;
            Arc::new(PgChatStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, messages are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let state = AppState::new(&config, store);
    let app = create_app(state);

    tracing::info!(addr = %config.server_addr, "listening");
    let listener = tokio::net::TcpListener::bind(config.server_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
