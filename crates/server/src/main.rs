mod config;
mod error;
mod persistence;
mod presence;
mod room;
mod routes;
mod state;
mod transport;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

use config::Config;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    let bind_addr = config.bind_addr;

    let app_state = state::AppState::new(config)
        .await
        .expect("failed to initialize application state");

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", routes::api_router())
        .route("/ws", axum::routing::get(transport::ws_handler))
        .layer(cors)
        .with_state(app_state);

    tracing::info!("listening on {bind_addr}");

    let listener = tokio::net::TcpListener::bind(bind_addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
