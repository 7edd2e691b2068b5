use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use ts_rs::TS;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

// --- Catalog Schemas (Mapped to Database) ---

/// NodeType
///
/// The three levels of the permission catalog. Stored as lowercase text in the
/// `permissions.type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS, ToSchema)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum NodeType {
    Module,
    Page,
    Action,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Module => "module",
            NodeType::Page => "page",
            NodeType::Action => "action",
        }
    }

    /// Whether a node of this type may hang under a parent of `parent` type.
    /// Modules are always roots, pages sit at the root or under a module,
    /// actions always sit under a page.
    pub fn accepts_parent(&self, parent: Option<NodeType>) -> bool {
        matches!(
            (self, parent),
            (NodeType::Module, None)
                | (NodeType::Page, None)
                | (NodeType::Page, Some(NodeType::Module))
                | (NodeType::Action, Some(NodeType::Page))
        )
    }

    /// Modules and pages are navigable and must carry a route path.
    pub fn requires_path(&self) -> bool {
        !matches!(self, NodeType::Action)
    }
}

impl TryFrom<String> for NodeType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "module" => Ok(NodeType::Module),
            "page" => Ok(NodeType::Page),
            "action" => Ok(NodeType::Action),
            other => Err(format!("unknown permission node type '{other}'")),
        }
    }
}

/// PermissionNode
///
/// A single authorizable unit of the catalog (`public.permissions`).
/// `code` is globally unique and becomes immutable once an edge references it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema, FromRow)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct PermissionNode {
    pub id: i64,
    pub code: String,
    pub name: String,
    // 'type' is a reserved keyword in Rust.
    #[serde(rename = "type")]
    #[sqlx(rename = "type", try_from = "String")]
    pub node_type: NodeType,
    pub path: Option<String>,
    pub parent_id: Option<i64>,
    pub sort_order: i32,
    // Inactive nodes stay in the catalog but never resolve.
    pub active: bool,
}

/// Role
///
/// Owned by the external role-management collaborator. The core only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema, FromRow, Default)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Role {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
}

/// RolePermissionEdge
///
/// One row of `public.role_permissions`. `(role_id, permission_id)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema, FromRow)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct RolePermissionEdge {
    pub id: i64,
    pub role_id: i64,
    pub permission_id: i64,
    pub grantor_id: Option<Uuid>,
    pub notes: Option<String>,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "string")]
    pub updated_at: DateTime<Utc>,
}

/// GrantOutcome
///
/// Result of a single grant: the stored edge and whether this call created it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct GrantOutcome {
    pub edge: RolePermissionEdge,
    pub created: bool,
}

/// --- Catalog Administration Payloads ---

/// NewPermissionNode
///
/// Input payload for creating a catalog node (POST /api/permissions/nodes).
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct NewPermissionNode {
    pub code: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// UpdatePermissionNode
///
/// Partial update for a catalog node. Type and parent are structural and cannot change.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct UpdatePermissionNode {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

/// validate_new_node
///
/// Checks a creation request against the catalog shape rules. `parent` is the
/// already-fetched parent row when `parent_id` is set. Shared by every catalog backend.
pub fn validate_new_node(req: &NewPermissionNode, parent: Option<&PermissionNode>) -> AppResult<()> {
    if req.code.trim().is_empty() {
        return Err(AppError::Validation("code must not be empty".into()));
    }
    if req.name.trim().is_empty() {
        return Err(AppError::Validation("name must not be empty".into()));
    }
    if req.node_type.requires_path() && req.path.as_deref().is_none_or(|p| p.trim().is_empty()) {
        return Err(AppError::Validation(format!(
            "path is required for {} nodes",
            req.node_type.as_str()
        )));
    }
    if req.parent_id.is_some() && parent.is_none() {
        return Err(AppError::ReferentialIntegrity(format!(
            "parent permission {} does not exist",
            req.parent_id.unwrap_or_default()
        )));
    }
    if !req.node_type.accepts_parent(parent.map(|p| p.node_type)) {
        return Err(AppError::Validation(format!(
            "a {} cannot be placed under {}",
            req.node_type.as_str(),
            parent.map_or("the root", |p| p.node_type.as_str())
        )));
    }
    Ok(())
}

// --- Response Envelope ---

/// ResponseMeta
///
/// Cache and timing metadata attached to permission read responses.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_cache: Option<bool>,
    /// Milliseconds spent inside the handler.
    pub response_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
}

/// ApiResponse
///
/// The `{success, data, message?, meta?}` envelope shared by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            message: None,
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: ResponseMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

// --- Request Payloads (Input Schemas) ---

/// PageActionsQuery
///
/// Query for GET /permissions/page-actions. Exactly one of the two is expected;
/// `pageId` wins when both are supplied.
#[derive(Debug, Clone, Deserialize, utoipa::IntoParams, Default)]
#[serde(rename_all = "camelCase")]
#[into_params(rename_all = "camelCase", parameter_in = Query)]
pub struct PageActionsQuery {
    pub page_id: Option<i64>,
    /// Prefix match against page paths, e.g. `/students`.
    pub page_path: Option<String>,
}

/// BatchCheckRequest
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct BatchCheckRequest {
    #[schema(example = json!(["VIEW_STUDENT", "EDIT_STUDENT"]))]
    pub permissions: Option<Vec<String>>,
}

/// CheckPermissionRequest
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct CheckPermissionRequest {
    #[schema(example = "EDIT_STUDENT")]
    pub permission: Option<String>,
}

/// CheckPageRequest
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct CheckPageRequest {
    #[schema(example = "/students")]
    pub page_path: Option<String>,
}

/// AssignPermissionRequest
///
/// Input payload for POST /api/role-permissions. Ids are optional at the serde level so
/// a missing field surfaces as a validation error naming it.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct AssignPermissionRequest {
    pub role_id: Option<i64>,
    pub permission_id: Option<i64>,
    pub assigned_by: Option<Uuid>,
    pub notes: Option<String>,
}

/// AssignManyRequest
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct AssignManyRequest {
    pub permission_ids: Option<Vec<i64>>,
    pub assigned_by: Option<Uuid>,
    pub notes: Option<String>,
}

/// RolePagesRequest
///
/// The complete set of module/page ids a role should hold after the update.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct RolePagesRequest {
    pub permission_ids: Option<Vec<i64>>,
}

/// SetupRequest
///
/// Optional override of the bootstrap plan: role code -> permission codes.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SetupRequest {
    pub mapping: Option<BTreeMap<String, Vec<String>>>,
}

// --- Output Schemas ---

/// BatchSummary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct BatchSummary {
    pub total: usize,
    pub granted: usize,
    pub denied: usize,
}

/// BatchCheckResponse
///
/// One entry per distinct requested code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct BatchCheckResponse {
    pub results: BTreeMap<String, bool>,
    pub summary: BatchSummary,
}

/// CheckPermissionResponse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct CheckPermissionResponse {
    pub permission: String,
    pub granted: bool,
}

/// CheckPageResponse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct CheckPageResponse {
    pub page_path: String,
    pub has_permission: bool,
}

/// UserInfoResponse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct UserInfoResponse {
    pub permissions: Vec<String>,
    pub roles: Vec<String>,
    pub is_superuser: bool,
}

/// RouteNode
///
/// One node of the navigation tree returned by the dynamic-routes endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct RouteNode {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub path: Option<String>,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub sort_order: i32,
    #[schema(no_recursion)]
    pub children: Vec<RouteNode>,
}

/// PageActionsSummary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct PageActionsSummary {
    /// Number of granted actions returned.
    pub total: usize,
    /// Number of catalog pages the query matched.
    pub pages: usize,
}

/// PageActionsResponse
///
/// Granted action nodes for the matched page(s), flat and grouped by page code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct PageActionsResponse {
    pub permissions: Vec<PermissionNode>,
    pub grouped: BTreeMap<String, Vec<PermissionNode>>,
    pub summary: PageActionsSummary,
}

/// AssignPermissionResponse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct AssignPermissionResponse {
    pub edge: RolePermissionEdge,
    pub created: bool,
}

/// AssignManyResponse
///
/// `total_assigned` counts newly created edges only; `already_present` counts no-ops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema, Default)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct AssignManyResponse {
    pub role_id: i64,
    pub total_assigned: usize,
    pub already_present: usize,
    pub permission_ids: Vec<i64>,
}

/// RevokeResponse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct RevokeResponse {
    pub removed: bool,
}

/// SetupResponse
///
/// Output of the bootstrap assignment. `role_permission_mapping` lists, per role code,
/// every plan code that now holds an edge for that role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema, Default)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SetupResponse {
    pub total_assigned: usize,
    pub role_permission_mapping: BTreeMap<String, Vec<String>>,
    pub missing_permissions: Vec<String>,
    pub skipped_roles: Vec<String>,
}

/// CacheClearResponse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct CacheClearResponse {
    pub invalidated: usize,
}

/// CacheStats
///
/// Counters since startup. `entries` includes stale slots not yet pruned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// RolePagePermissions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct RolePagePermissions {
    pub role_id: i64,
    pub permissions: Vec<PermissionNode>,
}

/// RolePagesUpdateResponse
///
/// `updated_permissions` is the role's module/page set after the update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema, Default)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct RolePagesUpdateResponse {
    pub role_id: i64,
    pub updated_permissions: Vec<i64>,
    pub added: usize,
    pub removed: usize,
}
