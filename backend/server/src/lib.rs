//! Feature request voting service.
//!
//! Clients (the admin console and the mobile app) create feature requests and vote on them.
//! Everything here is a thin layer over the tally core in [`engine`], which is the only
//! code allowed to move a vote count.
//!
//!
//!
//! # Request Flow
//! - Client calls an HTTP route in [`routes`]
//! - Route validates the payload shape and hands off to [`engine::TallyEngine`]
//! - Engine checks the vote ledger for duplicates and commits through [`store::TallyStore`]
//! - Response carries the authoritative tally, clients never predict it locally
//!
//!
//!
//! # Routes
//! - `GET /features`: all features in creation order, `?offset=&limit=` to page
//! - `POST /features`: `{title, description?}`, returns 201 with the feature
//! - `GET /features/{id}`
//! - `POST /features/{id}/upvote`: voter identity in the `X-Voter-Key` header
//! - `GET /features/{id}/voters/{voter_key}`: whether that voter already upvoted
//! - `POST /admin/features/{id}/votes`: `{delta?, actor?}`, requires an `Idempotency-Key` header
//! - `POST /admin/features/{id}/recount`: rebuild the tally from the ledger
//! - `GET /admin/features/{id}/events`: the feature's ledger
//!
//!
//!
//! # Storage
//! Set `REDIS_URL` (or point `REDIS_URL_FILE` at a file holding it, `/run/secrets/REDIS_URL`
//! by default) to keep votes in Redis, see [`database`]. Without it votes live in process memory, see [`memory`].
//!
//!
//!
//! # Setup
//!
//! Run the server.
//! ```sh
//! RUST_LOG=info REDIS_URL=redis://127.0.0.1/ cargo run --bin tally-server
//! ```
//!
//! Hammer it with concurrent votes.
//! ```sh
//! cargo run --bin tally-tester -- --voters 200 --repeats 3
//! ```
use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    Router,
    http::{HeaderName, Method, header::CONTENT_TYPE},
    routing::{get, post},
};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
use tokio::{net::TcpListener, signal::ctrl_c};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod memory;
pub mod models;
pub mod routes;
pub mod state;
pub mod store;
pub mod utils;

use config::Config;
use routes::{
    add_votes_handler, create_handler, events_handler, get_handler, health_handler, list_handler,
    recount_handler, upvote_handler, voter_handler,
};
use state::AppState;
use utils::{IDEMPOTENCY_KEY_HEADER, VOTER_KEY_HEADER};

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            HeaderName::from_static(VOTER_KEY_HEADER),
            HeaderName::from_static(IDEMPOTENCY_KEY_HEADER),
        ])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/health", get(health_handler))
        .route("/features", get(list_handler).post(create_handler))
        .route("/features/{id}", get(get_handler))
        .route("/features/{id}/upvote", post(upvote_handler))
        .route("/features/{id}/voters/{voter_key}", get(voter_handler))
        .route("/admin/features/{id}/votes", post(add_votes_handler))
        .route("/admin/features/{id}/recount", post(recount_handler))
        .route("/admin/features/{id}/events", get(events_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Loading config...");
    let config = Config::load()?;

    info!("Initializing state...");
    let state = AppState::new(config).await?;

    info!("Starting server...");

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address).await?;
    info!("Server running on {address}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install terminate handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
