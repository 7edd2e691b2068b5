use axum::{
    Router,
    extract::{FromRef, Request},
    http::HeaderName,
    middleware::{self, Next},
    response::Response,
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{Level, Span};

// --- Module Structure ---

// Storage, resolution and caching core.
pub mod assignment;
pub mod batch;
pub mod cache;
pub mod memory;
pub mod models;
pub mod repository;
pub mod resolver;
pub mod route_tree;
pub mod setup;

// HTTP surface and ambient services.
pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;

// Module for routing segregation (Public, Authenticated, Admin).
pub mod routes;
use auth::AuthUser;
use routes::{admin, authenticated, public};

// --- Public Re-exports ---

pub use assignment::AssignmentService;
pub use cache::{CacheLookup, CacheState, ResolutionCache};
pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use memory::InMemoryRepository;
pub use repository::{
    AssignmentLedger, CatalogState, DirectoryState, LedgerState, PermissionCatalog,
    PostgresRepository, RoleDirectory,
};
pub use resolver::{ResolvedPermissionSet, Resolver};

/// ApiDoc
///
/// Generated OpenAPI document, served at `/api-docs/openapi.json`. Doubles as the registry
/// of every route, verb and typed request/response contract.
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health_check, handlers::get_page_actions, handlers::batch_check,
        handlers::get_dynamic_routes, handlers::get_user_permissions, handlers::check_permission,
        handlers::check_page, handlers::get_my_pages, handlers::get_user_info,
        handlers::get_all_routes, handlers::list_permission_nodes, handlers::get_permission_node,
        handlers::clear_cache, handlers::get_cache_stats, handlers::create_permission_node,
        handlers::update_permission_node, handlers::delete_permission_node,
        handlers::assign_role_permission, handlers::revoke_role_permission,
        handlers::get_role_permissions, handlers::get_role_page_permissions,
        handlers::update_role_page_permissions, handlers::assign_role_permissions,
        handlers::setup_role_permissions
    ),
    components(
        schemas(
            models::NodeType, models::PermissionNode, models::Role, models::RolePermissionEdge,
            models::NewPermissionNode, models::UpdatePermissionNode, models::ResponseMeta,
            models::BatchCheckRequest, models::BatchCheckResponse, models::BatchSummary,
            models::CheckPermissionRequest, models::CheckPermissionResponse,
            models::CheckPageRequest, models::CheckPageResponse, models::UserInfoResponse,
            models::RouteNode, models::PageActionsResponse, models::PageActionsSummary,
            models::AssignPermissionRequest, models::AssignPermissionResponse,
            models::AssignManyRequest, models::AssignManyResponse, models::RevokeResponse,
            models::SetupRequest, models::SetupResponse, models::CacheClearResponse,
            models::CacheStats, models::RolePagesRequest, models::RolePagePermissions,
            models::RolePagesUpdateResponse, resolver::TypeSummary,
        )
    ),
    tags(
        (name = "permissions", description = "Permission resolution and caching API")
    )
)]
pub struct ApiDoc;

/// AppState
///
/// The single shared container handed to every handler. Storage handles are trait
/// objects so the same router runs over Postgres or the in-memory store.
#[derive(Clone)]
pub struct AppState {
    pub catalog: CatalogState,
    pub ledger: LedgerState,
    pub directory: DirectoryState,
    /// Process-wide resolution cache. Created once here, never reached through a global.
    pub cache: Arc<ResolutionCache>,
    pub assignments: Arc<AssignmentService>,
    pub config: AppConfig,
}

impl AppState {
    /// Wires the resolver, the cache and the assignment service over the given storage.
    pub fn new(
        catalog: CatalogState,
        ledger: LedgerState,
        directory: DirectoryState,
        config: AppConfig,
    ) -> Self {
        let resolver = Arc::new(Resolver::new(
            catalog.clone(),
            ledger.clone(),
            directory.clone(),
            &config,
        ));
        let cache = Arc::new(ResolutionCache::new(resolver, config.cache_ttl));
        let assignments = Arc::new(AssignmentService::new(ledger.clone(), cache.clone()));
        Self {
            catalog,
            ledger,
            directory,
            cache,
            assignments,
            config,
        }
    }
}

// --- Axum FromRef Extractor Implementations ---

impl FromRef<AppState> for AppConfig {
    fn from_ref(app_state: &AppState) -> AppConfig {
        app_state.config.clone()
    }
}

/// auth_middleware
///
/// Rejects the request with 401 unless `AuthUser` can be extracted. Runs before any
/// handler logic on the authenticated and admin routers.
async fn auth_middleware(_auth_user: AuthUser, request: Request, next: Next) -> Response {
    next.run(request).await
}

/// create_router
///
/// Assembles the routes, scopes the authentication layer and adds the observability stack.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    let x_request_id = HeaderName::from_static("x-request-id");

    let protected = authenticated::authenticated_routes()
        .merge(admin::admin_routes())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let base_router = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(public::public_routes())
        .merge(protected)
        .with_state(state);

    base_router
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(trace_span_logger)
                        .on_response(
                            DefaultOnResponse::new()
                                .level(Level::INFO)
                                .latency_unit(tower_http::LatencyUnit::Millis),
                        ),
                )
                .layer(PropagateRequestIdLayer::new(x_request_id)),
        )
        .layer(cors)
}

/// trace_span_logger
///
/// Span factory for `TraceLayer`: correlates every log line of a request by its
/// `x-request-id`.
fn trace_span_logger(request: &axum::http::Request<axum::body::Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");

    tracing::info_span!(
        "http_request",
        method = ?request.method(),
        uri = ?request.uri(),
        req_id = %request_id,
    )
}
