use crate::{AppState, handlers};
use axum::{
    Router,
    routing::{get, post},
};

/// Authenticated Router Module
///
/// Permission reads for the calling user. Every handler resolves the caller through the
/// `ResolutionCache`, so none of them touches the ledger on a warm entry.
///
/// Access Control Strategy:
/// The router is wrapped by `auth_middleware`; handlers additionally take `AuthUser` to
/// learn who is asking.
pub fn authenticated_routes() -> Router<AppState> {
    Router::<AppState>::new()
        // --- Fine-grained (action level) checks ---
        // GET /permissions/page-actions?pageId=&pagePath=
        .route("/permissions/page-actions", get(handlers::get_page_actions))
        // POST /permissions/batch-check
        // Fail-closed: unknown codes answer false.
        .route("/permissions/batch-check", post(handlers::batch_check))
        // --- Navigation and resolution ---
        .route(
            "/api/permissions/dynamic-routes",
            get(handlers::get_dynamic_routes),
        )
        .route(
            "/api/permissions/user-permissions",
            get(handlers::get_user_permissions),
        )
        .route(
            "/api/permissions/check-permission",
            post(handlers::check_permission),
        )
        .route("/api/permissions/check-page", post(handlers::check_page))
        .route("/api/permissions/my-pages", get(handlers::get_my_pages))
        .route("/api/permissions/user-info", get(handlers::get_user_info))
}
