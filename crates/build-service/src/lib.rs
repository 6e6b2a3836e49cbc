//! Fatbuildr build service
//!
//! Builds native packages in isolated environments, applies the patch queue
//! of each artifact before the build, then signs and publishes the
//! resulting artifacts in the registry.

pub mod cancel;
pub mod config;
pub mod container;
pub mod dispatcher;
pub mod executor;
pub mod handlers;
pub mod images;
pub mod logstream;
pub mod models;
pub mod patches;
pub mod source;
pub mod storage;
pub mod worker;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::{Config, Settings};
pub use handlers::AppState;
pub use models::{BuildRequest, BuildTrigger, SubmitResponse};
pub use storage::{JobStore, MemoryJobStore, RedisJobStore};
pub use worker::{BuildService, ServiceParts};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/api/stats", get(handlers::get_stats_handler))
        .route(
            "/api/builds",
            post(handlers::submit_build_handler).get(handlers::list_builds_handler),
        )
        .route("/api/builds/{id}", get(handlers::get_build_handler))
        .route("/api/builds/{id}/log", get(handlers::get_build_log_handler))
        .route(
            "/api/builds/{id}/log/stream",
            get(handlers::stream_build_log_handler),
        )
        .route(
            "/api/builds/{id}/cancel",
            post(handlers::cancel_build_handler),
        )
        .route(
            "/api/builds/{id}/publish",
            post(handlers::publish_build_handler),
        )
        .route(
            "/api/registry/{format}/{distribution}/{artifact}",
            get(handlers::registry_lookup_handler),
        )
        .route(
            "/api/registry/{format}/{distribution}/{artifact}/{version}/{entry}/{file}",
            get(handlers::registry_file_handler),
        )
        .route("/api/patches/{artifact}", get(handlers::list_patches_handler))
        .route(
            "/api/patches/{artifact}/archive",
            get(handlers::patches_archive_handler),
        )
        .route(
            "/api/tokens",
            post(handlers::issue_token_handler).get(handlers::list_tokens_handler),
        )
        .route("/api/tokens/{id}", delete(handlers::revoke_token_handler))
        .route(
            "/api/environments",
            get(handlers::list_environments_handler),
        )
        .route(
            "/api/environments/{distribution}/{architecture}",
            delete(handlers::remove_environment_handler),
        )
        .route(
            "/api/keyring",
            get(handlers::get_keyring_handler).post(handlers::create_key_handler),
        )
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
