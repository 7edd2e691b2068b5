use crate::{AppState, handlers};
use axum::{Router, routing::get};

/// Public Router Module
///
/// Endpoints reachable without a bearer token. Only the liveness probe lives here; every
/// permission endpoint reveals something about the caller and is authenticated.
pub fn public_routes() -> Router<AppState> {
    Router::new()
        // GET /health
        // Used by load balancers and container orchestration.
        .route("/health", get(handlers::health_check))
}
