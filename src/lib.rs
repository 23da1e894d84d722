//! Real-time chat core for UniTask, built with Rust.
//!
//! Socket connections are bound to a session user, join per-conversation rooms,
//! and exchange messages, typing indicators and read receipts. Presence is tracked
//! per user across all of their connections. The `client` module holds the
//! reconnecting client controller.

pub mod auth;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;

pub use config::Config;
pub use error::AppError;
pub use handlers::http::AppState;
pub use services::presence::PresenceService;

use axum::routing::get;
use handlers::http;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Build the router (ws, health, presence). Used by main and by integration tests.
pub fn create_app(state: AppState) -> axum::Router {
    let presence_routes = axum::Router::new()
        .route("/online", get(http::online_users))
        .route("/:user_id", get(http::user_presence));

    axum::Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route("/health", get(http::health))
        .nest("/api/presence", presence_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
