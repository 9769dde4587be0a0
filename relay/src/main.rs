mod assets;
mod config;
mod handlers;
mod registry;

use axum::{extract::State, routing::get, Router};
use axum_embed::ServeEmbed;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

use crate::assets::Assets;
use crate::registry::Registry;

async fn debug_sessions(State(registry): State<Registry>) -> String {
    format!("Active sessions: {}", registry.session_count())
}

/// Periodic sweep dropping unpaired sessions whose deadline has passed.
async fn run_reaper(registry: Registry) {
    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        ticker.tick().await;
        let reaped = registry.reap();
        if !reaped.is_empty() {
            info!(count = reaped.len(), codes = ?reaped, "reaped expired unpaired sessions");
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let port = config::port();
    let registry = Registry::new();

    tokio::spawn(run_reaper(registry.clone()));

    let serve_assets = ServeEmbed::<Assets>::with_parameters(
        Some("index.html".to_owned()),
        axum_embed::FallbackBehavior::Ok,
        None,
    );

    let app = Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route("/debug/sessions", get(debug_sessions))
        .fallback_service(serve_assets)
        .with_state(registry);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("relay server starting on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind relay listener");
    axum::serve(listener, app).await.expect("relay server crashed");
}
