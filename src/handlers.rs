use crate::{
    AppState,
    auth::{AuthUser, PERMISSION_MANAGE, ROLE_PERMISSION_MANAGE, require_permission},
    batch,
    error::{AppError, AppResult},
    models::{
        ApiResponse, AssignManyRequest, AssignManyResponse, AssignPermissionRequest,
        AssignPermissionResponse, BatchCheckRequest, BatchCheckResponse, CacheClearResponse,
        CacheStats, CheckPageRequest, CheckPageResponse, CheckPermissionRequest,
        CheckPermissionResponse, NewPermissionNode, NodeType, PageActionsQuery,
        PageActionsResponse, PermissionNode, ResponseMeta, RevokeResponse, RolePagePermissions,
        RolePagesRequest, RolePagesUpdateResponse, RolePermissionEdge, RouteNode, SetupRequest,
        SetupResponse, UpdatePermissionNode, UserInfoResponse,
    },
    route_tree,
    setup::{self, BootstrapPlan},
};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State, rejection::JsonRejection},
};
use std::time::Instant;

/// Level reported by the fine-grained (action level) endpoints.
const ACTION_LEVEL: u8 = 3;

fn meta(started: Instant, from_cache: Option<bool>, level: Option<u8>) -> ResponseMeta {
    ResponseMeta {
        from_cache,
        response_time: started.elapsed().as_millis() as u64,
        level,
    }
}

// --- Public ---

/// health_check
///
/// [Public Route] Liveness probe for load balancers.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = String))
)]
pub async fn health_check() -> &'static str {
    "ok"
}

// --- Permission Reads ---

/// get_page_actions
///
/// [Authenticated Route] Action-level permissions the caller holds on one page.
/// `pageId` selects a single page, `pagePath` every page whose path starts with it.
/// An unmatched page yields an empty result, not an error.
#[utoipa::path(
    get,
    path = "/permissions/page-actions",
    params(PageActionsQuery),
    responses(
        (status = 200, description = "Granted actions, flat and grouped by page", body = PageActionsResponse),
        (status = 400, description = "Neither pageId nor pagePath supplied"),
        (status = 401, description = "Missing or invalid bearer token")
    )
)]
pub async fn get_page_actions(
    user: AuthUser,
    State(state): State<AppState>,
    Query(query): Query<PageActionsQuery>,
) -> AppResult<Json<ApiResponse<PageActionsResponse>>> {
    let started = Instant::now();
    let page_path = query.page_path.as_deref().map(str::trim).filter(|p| !p.is_empty());
    if query.page_id.is_none() && page_path.is_none() {
        return Err(AppError::missing_field("pageId or pagePath"));
    }

    let lookup = state.cache.get(user.id).await?;
    let data = match (query.page_id, page_path) {
        (Some(page_id), _) => {
            route_tree::find_by_page_id(&state.catalog, page_id, &lookup.resolution).await?
        }
        (None, Some(prefix)) => {
            route_tree::find_by_page_path(&state.catalog, prefix, &lookup.resolution).await?
        }
        (None, None) => PageActionsResponse::default(),
    };

    Ok(Json(ApiResponse::ok(data).with_meta(meta(
        started,
        Some(lookup.from_cache),
        Some(ACTION_LEVEL),
    ))))
}

/// batch_check
///
/// [Authenticated Route] Checks many permission codes at once. Fail-closed: unknown codes
/// come back `false`. An empty or missing `permissions` list is rejected with 400.
#[utoipa::path(
    post,
    path = "/permissions/batch-check",
    request_body = BatchCheckRequest,
    responses(
        (status = 200, description = "Per-code results and summary", body = BatchCheckResponse),
        (status = 400, description = "permissions missing or empty")
    )
)]
pub async fn batch_check(
    user: AuthUser,
    State(state): State<AppState>,
    payload: Result<Json<BatchCheckRequest>, JsonRejection>,
) -> AppResult<Json<ApiResponse<BatchCheckResponse>>> {
    let started = Instant::now();
    let Json(payload) = payload?;
    let codes = payload
        .permissions
        .ok_or_else(|| AppError::missing_field("permissions"))?;

    let lookup = state.cache.get(user.id).await?;
    let data = batch::check_batch(&lookup.resolution, &codes)?;

    Ok(Json(ApiResponse::ok(data).with_meta(meta(
        started,
        None,
        Some(ACTION_LEVEL),
    ))))
}

/// get_dynamic_routes
///
/// [Authenticated Route] Navigation tree built from the caller's resolution. Nodes whose
/// parent is not granted are pruned.
#[utoipa::path(
    get,
    path = "/api/permissions/dynamic-routes",
    responses((status = 200, description = "Route tree", body = [RouteNode]))
)]
pub async fn get_dynamic_routes(
    user: AuthUser,
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<Vec<RouteNode>>>> {
    let started = Instant::now();
    let lookup = state.cache.get(user.id).await?;
    let tree = route_tree::build_resolved_tree(&lookup.resolution);
    Ok(Json(
        ApiResponse::ok(tree).with_meta(meta(started, Some(lookup.from_cache), None)),
    ))
}

/// get_user_permissions
///
/// [Authenticated Route] Flat list of every permission node the caller holds.
#[utoipa::path(
    get,
    path = "/api/permissions/user-permissions",
    responses((status = 200, description = "Granted permission nodes", body = [PermissionNode]))
)]
pub async fn get_user_permissions(
    user: AuthUser,
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<Vec<PermissionNode>>>> {
    let started = Instant::now();
    let lookup = state.cache.get(user.id).await?;
    let permissions = lookup.resolution.permissions.clone();
    Ok(Json(
        ApiResponse::ok(permissions).with_meta(meta(started, Some(lookup.from_cache), None)),
    ))
}

/// check_permission
///
/// [Authenticated Route] Single-code check.
#[utoipa::path(
    post,
    path = "/api/permissions/check-permission",
    request_body = CheckPermissionRequest,
    responses(
        (status = 200, description = "Whether the code is granted", body = CheckPermissionResponse),
        (status = 400, description = "permission missing")
    )
)]
pub async fn check_permission(
    user: AuthUser,
    State(state): State<AppState>,
    payload: Result<Json<CheckPermissionRequest>, JsonRejection>,
) -> AppResult<Json<ApiResponse<CheckPermissionResponse>>> {
    let started = Instant::now();
    let Json(payload) = payload?;
    let code = payload
        .permission
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| AppError::missing_field("permission"))?;

    let lookup = state.cache.get(user.id).await?;
    let data = batch::check_one(&lookup.resolution, &code);
    Ok(Json(
        ApiResponse::ok(data).with_meta(meta(started, Some(lookup.from_cache), None)),
    ))
}

/// check_page
///
/// [Authenticated Route] Whether the caller may open the page or module routed at
/// exactly `pagePath`.
#[utoipa::path(
    post,
    path = "/api/permissions/check-page",
    request_body = CheckPageRequest,
    responses(
        (status = 200, description = "Page access", body = CheckPageResponse),
        (status = 400, description = "pagePath missing")
    )
)]
pub async fn check_page(
    user: AuthUser,
    State(state): State<AppState>,
    payload: Result<Json<CheckPageRequest>, JsonRejection>,
) -> AppResult<Json<ApiResponse<CheckPageResponse>>> {
    let Json(payload) = payload?;
    let page_path = payload
        .page_path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| AppError::missing_field("pagePath"))?;

    let lookup = state.cache.get(user.id).await?;
    let has_permission = lookup
        .resolution
        .permissions
        .iter()
        .any(|n| n.node_type != NodeType::Action && n.path.as_deref() == Some(page_path.as_str()));

    Ok(Json(ApiResponse::ok(CheckPageResponse {
        page_path,
        has_permission,
    })))
}

/// get_my_pages
///
/// [Authenticated Route] Granted `page` nodes in display order.
#[utoipa::path(
    get,
    path = "/api/permissions/my-pages",
    responses((status = 200, description = "Granted pages", body = [PermissionNode]))
)]
pub async fn get_my_pages(
    user: AuthUser,
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<Vec<PermissionNode>>>> {
    let lookup = state.cache.get(user.id).await?;
    let pages = lookup
        .resolution
        .permissions
        .iter()
        .filter(|n| n.node_type == NodeType::Page)
        .cloned()
        .collect();
    Ok(Json(ApiResponse::ok(pages)))
}

/// get_user_info
///
/// [Authenticated Route] The caller's role codes, granted codes and superuser flag.
#[utoipa::path(
    get,
    path = "/api/permissions/user-info",
    responses((status = 200, description = "Permission summary", body = UserInfoResponse))
)]
pub async fn get_user_info(
    user: AuthUser,
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<UserInfoResponse>>> {
    let started = Instant::now();
    let lookup = state.cache.get(user.id).await?;
    let resolved = &lookup.resolution;
    let data = UserInfoResponse {
        permissions: resolved.permissions.iter().map(|n| n.code.clone()).collect(),
        roles: resolved.role_codes.clone(),
        is_superuser: resolved.is_superuser,
    };
    Ok(Json(
        ApiResponse::ok(data).with_meta(meta(started, Some(lookup.from_cache), None)),
    ))
}

// --- Administration ---

/// get_all_routes
///
/// [Admin Route] The whole catalog as a tree, unfiltered by the caller's resolution.
/// Requires `PERMISSION_MANAGE`.
#[utoipa::path(
    get,
    path = "/api/permissions/all-routes",
    responses(
        (status = 200, description = "Full catalog tree", body = [RouteNode]),
        (status = 403, description = "Missing PERMISSION_MANAGE")
    )
)]
pub async fn get_all_routes(
    user: AuthUser,
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<Vec<RouteNode>>>> {
    require_permission(&state.cache, &user, PERMISSION_MANAGE).await?;
    let nodes = state.catalog.list_nodes().await?;
    Ok(Json(ApiResponse::ok(route_tree::build_tree(&nodes))))
}

/// list_permission_nodes
///
/// [Admin Route] Every catalog node, flat, ordered by `(sort_order, id)`.
#[utoipa::path(
    get,
    path = "/api/permissions",
    responses(
        (status = 200, description = "All catalog nodes", body = [PermissionNode]),
        (status = 403, description = "Missing PERMISSION_MANAGE")
    )
)]
pub async fn list_permission_nodes(
    user: AuthUser,
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<Vec<PermissionNode>>>> {
    require_permission(&state.cache, &user, PERMISSION_MANAGE).await?;
    let mut nodes = state.catalog.list_nodes().await?;
    nodes.sort_by_key(|n| (n.sort_order, n.id));
    Ok(Json(ApiResponse::ok(nodes)))
}

/// get_permission_node
#[utoipa::path(
    get,
    path = "/api/permissions/{id}",
    params(("id" = i64, Path, description = "Permission node id")),
    responses(
        (status = 200, description = "The node", body = PermissionNode),
        (status = 404, description = "Node not found")
    )
)]
pub async fn get_permission_node(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<ApiResponse<PermissionNode>>> {
    require_permission(&state.cache, &user, PERMISSION_MANAGE).await?;
    let node = state
        .catalog
        .get_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("permission {id} does not exist")))?;
    Ok(Json(ApiResponse::ok(node)))
}

/// clear_cache
///
/// [Admin Route] Marks every cached resolution stale.
#[utoipa::path(
    post,
    path = "/api/permissions/cache/clear",
    responses((status = 200, description = "Entries invalidated", body = CacheClearResponse))
)]
pub async fn clear_cache(
    user: AuthUser,
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<CacheClearResponse>>> {
    require_permission(&state.cache, &user, PERMISSION_MANAGE).await?;
    let invalidated = state.cache.invalidate_all();
    tracing::info!(user_id = %user.id, invalidated, "permission cache cleared");
    Ok(Json(ApiResponse::ok(CacheClearResponse { invalidated })))
}

/// get_cache_stats
///
/// [Admin Route] Hit/miss counters and the number of cached slots.
#[utoipa::path(
    get,
    path = "/api/permissions/cache/stats",
    responses(
        (status = 200, description = "Cache counters", body = CacheStats),
        (status = 403, description = "Missing PERMISSION_MANAGE")
    )
)]
pub async fn get_cache_stats(
    user: AuthUser,
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<CacheStats>>> {
    require_permission(&state.cache, &user, PERMISSION_MANAGE).await?;
    Ok(Json(ApiResponse::ok(state.cache.stats())))
}

/// create_permission_node
///
/// [Admin Route] Adds a node to the catalog. The parent must exist and fit the
/// module → page → action shape.
#[utoipa::path(
    post,
    path = "/api/permissions/nodes",
    request_body = NewPermissionNode,
    responses(
        (status = 200, description = "Created node", body = PermissionNode),
        (status = 400, description = "Shape or field validation failed"),
        (status = 404, description = "Parent does not exist"),
        (status = 409, description = "Code already in use")
    )
)]
pub async fn create_permission_node(
    user: AuthUser,
    State(state): State<AppState>,
    payload: Result<Json<NewPermissionNode>, JsonRejection>,
) -> AppResult<Json<ApiResponse<PermissionNode>>> {
    require_permission(&state.cache, &user, PERMISSION_MANAGE).await?;
    let Json(payload) = payload?;
    let node = state.catalog.create_node(payload).await?;
    // Superuser resolutions cover the whole active catalog.
    state.cache.invalidate_all();
    tracing::info!(id = node.id, code = %node.code, "permission node created");
    Ok(Json(ApiResponse::ok(node)))
}

/// update_permission_node
///
/// [Admin Route] Partial update. `code` may only change while no role references the node.
/// Deactivating a node removes it from every resolution once caches refresh, so all
/// entries are invalidated.
#[utoipa::path(
    put,
    path = "/api/permissions/nodes/{id}",
    params(("id" = i64, Path, description = "Permission node id")),
    request_body = UpdatePermissionNode,
    responses(
        (status = 200, description = "Updated node", body = PermissionNode),
        (status = 404, description = "Node not found"),
        (status = 409, description = "Code is referenced or taken")
    )
)]
pub async fn update_permission_node(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<UpdatePermissionNode>, JsonRejection>,
) -> AppResult<Json<ApiResponse<PermissionNode>>> {
    require_permission(&state.cache, &user, PERMISSION_MANAGE).await?;
    let Json(payload) = payload?;
    let node = state.catalog.update_node(id, payload).await?;
    state.cache.invalidate_all();
    tracing::info!(id, code = %node.code, "permission node updated");
    Ok(Json(ApiResponse::ok(node)))
}

/// delete_permission_node
///
/// [Admin Route] Removes a node that has neither edges nor children.
#[utoipa::path(
    delete,
    path = "/api/permissions/nodes/{id}",
    params(("id" = i64, Path, description = "Permission node id")),
    responses(
        (status = 200, description = "Deleted node id", body = i64),
        (status = 404, description = "Node not found"),
        (status = 409, description = "Node still referenced or has children")
    )
)]
pub async fn delete_permission_node(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<ApiResponse<i64>>> {
    require_permission(&state.cache, &user, PERMISSION_MANAGE).await?;
    state.catalog.delete_node(id).await?;
    state.cache.invalidate_all();
    tracing::info!(id, "permission node deleted");
    Ok(Json(
        ApiResponse::ok(id).with_message("permission node deleted"),
    ))
}

/// assign_role_permission
///
/// [Admin Route] Grants one permission to one role. Idempotent: a repeat grant returns the
/// existing edge with `created = false` and leaves `grantorId`/`createdAt` untouched.
/// `assignedBy` defaults to the caller.
#[utoipa::path(
    post,
    path = "/api/role-permissions",
    request_body = AssignPermissionRequest,
    responses(
        (status = 200, description = "Created or confirmed edge", body = AssignPermissionResponse),
        (status = 400, description = "roleId or permissionId missing"),
        (status = 404, description = "Role or permission does not exist")
    )
)]
pub async fn assign_role_permission(
    user: AuthUser,
    State(state): State<AppState>,
    payload: Result<Json<AssignPermissionRequest>, JsonRejection>,
) -> AppResult<Json<ApiResponse<AssignPermissionResponse>>> {
    require_permission(&state.cache, &user, ROLE_PERMISSION_MANAGE).await?;
    let Json(payload) = payload?;
    let role_id = payload.role_id.ok_or_else(|| AppError::missing_field("roleId"))?;
    let permission_id = payload
        .permission_id
        .ok_or_else(|| AppError::missing_field("permissionId"))?;

    let outcome = state
        .assignments
        .grant(
            role_id,
            permission_id,
            payload.assigned_by.or(Some(user.id)),
            payload.notes,
        )
        .await?;

    let message = if outcome.created {
        "permission assigned"
    } else {
        "permission already assigned"
    };
    Ok(Json(
        ApiResponse::ok(AssignPermissionResponse {
            edge: outcome.edge,
            created: outcome.created,
        })
        .with_message(message),
    ))
}

/// revoke_role_permission
///
/// [Admin Route] Removes a role's grant. Revoking an absent edge is a no-op.
#[utoipa::path(
    delete,
    path = "/api/role-permissions/{roleId}/{permissionId}",
    params(
        ("roleId" = i64, Path, description = "Role id"),
        ("permissionId" = i64, Path, description = "Permission node id")
    ),
    responses(
        (status = 200, description = "Whether an edge was removed", body = RevokeResponse),
        (status = 404, description = "Role or permission does not exist")
    )
)]
pub async fn revoke_role_permission(
    user: AuthUser,
    State(state): State<AppState>,
    Path((role_id, permission_id)): Path<(i64, i64)>,
) -> AppResult<Json<ApiResponse<RevokeResponse>>> {
    require_permission(&state.cache, &user, ROLE_PERMISSION_MANAGE).await?;
    let removed = state.assignments.revoke(role_id, permission_id).await?;
    Ok(Json(ApiResponse::ok(RevokeResponse { removed })))
}

/// get_role_permissions
///
/// [Admin Route] Edges held by one role.
#[utoipa::path(
    get,
    path = "/api/role-permissions/by-role/{roleId}",
    params(("roleId" = i64, Path, description = "Role id")),
    responses(
        (status = 200, description = "Role edges", body = [RolePermissionEdge]),
        (status = 404, description = "Role not found")
    )
)]
pub async fn get_role_permissions(
    user: AuthUser,
    State(state): State<AppState>,
    Path(role_id): Path<i64>,
) -> AppResult<Json<ApiResponse<Vec<RolePermissionEdge>>>> {
    require_permission(&state.cache, &user, ROLE_PERMISSION_MANAGE).await?;
    let edges = state.assignments.edges_for_role(role_id).await?;
    Ok(Json(ApiResponse::ok(edges)))
}

/// get_role_page_permissions
///
/// [Admin Route] Module and page nodes granted to one role.
#[utoipa::path(
    get,
    path = "/api/permissions/role/{roleId}",
    params(("roleId" = i64, Path, description = "Role id")),
    responses(
        (status = 200, description = "Granted modules and pages", body = RolePagePermissions),
        (status = 404, description = "Role not found")
    )
)]
pub async fn get_role_page_permissions(
    user: AuthUser,
    State(state): State<AppState>,
    Path(role_id): Path<i64>,
) -> AppResult<Json<ApiResponse<RolePagePermissions>>> {
    require_permission(&state.cache, &user, ROLE_PERMISSION_MANAGE).await?;
    let permissions = state.assignments.page_grants(&state.catalog, role_id).await?;
    Ok(Json(ApiResponse::ok(RolePagePermissions {
        role_id,
        permissions,
    })))
}

/// update_role_page_permissions
///
/// [Admin Route] Replaces a role's module/page grants with `permissionIds`. An empty list
/// removes them all. Action grants are kept.
#[utoipa::path(
    put,
    path = "/api/permissions/role/{roleId}",
    params(("roleId" = i64, Path, description = "Role id")),
    request_body = RolePagesRequest,
    responses(
        (status = 200, description = "Resulting page set", body = RolePagesUpdateResponse),
        (status = 400, description = "permissionIds missing or names an action"),
        (status = 404, description = "Role or a permission does not exist")
    )
)]
pub async fn update_role_page_permissions(
    user: AuthUser,
    State(state): State<AppState>,
    Path(role_id): Path<i64>,
    payload: Result<Json<RolePagesRequest>, JsonRejection>,
) -> AppResult<Json<ApiResponse<RolePagesUpdateResponse>>> {
    require_permission(&state.cache, &user, ROLE_PERMISSION_MANAGE).await?;
    let Json(payload) = payload?;
    let ids = payload
        .permission_ids
        .ok_or_else(|| AppError::missing_field("permissionIds"))?;

    let summary = state
        .assignments
        .replace_page_grants(&state.catalog, role_id, &ids, Some(user.id))
        .await?;
    Ok(Json(
        ApiResponse::ok(summary).with_message("role page permissions updated"),
    ))
}

/// assign_role_permissions
///
/// [Admin Route] Grants several permissions to a role in one transaction. Any unknown id
/// rejects the whole request. `totalAssigned` counts only newly created edges.
#[utoipa::path(
    post,
    path = "/api/role-permissions/roles/{roleId}/permissions",
    params(("roleId" = i64, Path, description = "Role id")),
    request_body = AssignManyRequest,
    responses(
        (status = 200, description = "Assignment summary", body = AssignManyResponse),
        (status = 400, description = "permissionIds missing or empty"),
        (status = 404, description = "Role or a permission does not exist")
    )
)]
pub async fn assign_role_permissions(
    user: AuthUser,
    State(state): State<AppState>,
    Path(role_id): Path<i64>,
    payload: Result<Json<AssignManyRequest>, JsonRejection>,
) -> AppResult<Json<ApiResponse<AssignManyResponse>>> {
    require_permission(&state.cache, &user, ROLE_PERMISSION_MANAGE).await?;
    let Json(payload) = payload?;
    let ids = payload
        .permission_ids
        .ok_or_else(|| AppError::missing_field("permissionIds"))?;

    let summary = state
        .assignments
        .assign_many(
            role_id,
            &ids,
            payload.assigned_by.or(Some(user.id)),
            payload.notes,
        )
        .await?;
    Ok(Json(ApiResponse::ok(summary)))
}

/// setup_role_permissions
///
/// [Admin Route] Bootstrap: grants the default role → permission plan (or the `mapping`
/// supplied in the body) to every known role the plan names. Safe to re-run.
#[utoipa::path(
    post,
    path = "/setup/assign-role-permissions",
    request_body(content = SetupRequest, description = "Optional plan override"),
    responses(
        (status = 200, description = "Bootstrap summary", body = SetupResponse),
        (status = 400, description = "Malformed body")
    )
)]
pub async fn setup_role_permissions(
    user: AuthUser,
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Json<ApiResponse<SetupResponse>>> {
    require_permission(&state.cache, &user, PERMISSION_MANAGE).await?;

    let request: SetupRequest = if body.is_empty() {
        SetupRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::Validation(format!("invalid setup body: {e}")))?
    };
    let plan = request.mapping.map(BootstrapPlan::from).unwrap_or_default();

    let summary = setup::run_bootstrap(
        &state.directory,
        &state.catalog,
        &state.assignments,
        &plan,
    )
    .await?;
    Ok(Json(
        ApiResponse::ok(summary).with_message("role permissions assigned"),
    ))
}
