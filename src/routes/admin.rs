use crate::{AppState, handlers};
use axum::{
    Router,
    routing::{delete, get, post, put},
};

/// Admin Router Module
///
/// Catalog administration, role-permission assignment and the setup bootstrap.
///
/// Access Control:
/// Mounted behind `auth_middleware` like the authenticated routes. Each handler then calls
/// `require_permission` with `PERMISSION_MANAGE` or `ROLE_PERMISSION_MANAGE`; superuser
/// roles always pass.
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        // --- Catalog ---
        .route("/api/permissions", get(handlers::list_permission_nodes))
        // GET /api/permissions/{id}
        // Static siblings such as /api/permissions/user-info take priority.
        .route("/api/permissions/{id}", get(handlers::get_permission_node))
        // GET /api/permissions/all-routes
        // The full tree, unfiltered by the caller's own grants.
        .route("/api/permissions/all-routes", get(handlers::get_all_routes))
        .route("/api/permissions/cache/clear", post(handlers::clear_cache))
        .route("/api/permissions/cache/stats", get(handlers::get_cache_stats))
        .route(
            "/api/permissions/nodes",
            post(handlers::create_permission_node),
        )
        .route(
            "/api/permissions/nodes/{id}",
            put(handlers::update_permission_node).delete(handlers::delete_permission_node),
        )
        // --- Role ↔ permission edges ---
        // GET/PUT /api/permissions/role/{roleId}
        // Module/page view of a role's grants; PUT replaces that set.
        .route(
            "/api/permissions/role/{roleId}",
            get(handlers::get_role_page_permissions).put(handlers::update_role_page_permissions),
        )
        // POST /api/role-permissions
        // Idempotent single grant.
        .route("/api/role-permissions", post(handlers::assign_role_permission))
        .route(
            "/api/role-permissions/{roleId}/{permissionId}",
            delete(handlers::revoke_role_permission),
        )
        .route(
            "/api/role-permissions/by-role/{roleId}",
            get(handlers::get_role_permissions),
        )
        .route(
            "/api/role-permissions/roles/{roleId}/permissions",
            post(handlers::assign_role_permissions),
        )
        // POST /setup/assign-role-permissions
        // Bootstrap of the default role plan. Safe to re-run.
        .route(
            "/setup/assign-role-permissions",
            post(handlers::setup_role_permissions),
        )
}
