use crate::{
    config::AppConfig,
    error::AppResult,
    models::{NodeType, PermissionNode, Role},
    repository::{CatalogState, DirectoryState, LedgerState},
};
use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use ts_rs::TS;
use utoipa::ToSchema;
use uuid::Uuid;

/// TypeSummary
///
/// Granted node counts by catalog level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct TypeSummary {
    pub modules: usize,
    pub pages: usize,
    pub actions: usize,
    pub total: usize,
}

/// ResolvedPermissionSet
///
/// Everything a user can reach through the roles they hold. Derived, never persisted.
/// `permissions` is ordered by `(sort_order, id)`; `grouped` maps the code of each node's
/// nearest module/page ancestor (a module groups under its own code) to member codes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ResolvedPermissionSet {
    pub user_id: Uuid,
    pub role_ids: Vec<i64>,
    pub role_codes: Vec<String>,
    pub is_superuser: bool,
    pub permissions: Vec<PermissionNode>,
    pub grouped: BTreeMap<String, Vec<String>>,
    pub summary: TypeSummary,
}

impl ResolvedPermissionSet {
    /// The resolution of a user without roles.
    pub fn empty(user_id: Uuid) -> Self {
        Self {
            user_id,
            role_ids: Vec::new(),
            role_codes: Vec::new(),
            is_superuser: false,
            permissions: Vec::new(),
            grouped: BTreeMap::new(),
            summary: TypeSummary::default(),
        }
    }

    fn build(
        user_id: Uuid,
        roles: &[Role],
        is_superuser: bool,
        mut granted: Vec<PermissionNode>,
        index: &CatalogIndex,
    ) -> Self {
        granted.sort_by_key(|n| (n.sort_order, n.id));

        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut summary = TypeSummary::default();
        for node in &granted {
            match node.node_type {
                NodeType::Module => summary.modules += 1,
                NodeType::Page => summary.pages += 1,
                NodeType::Action => summary.actions += 1,
            }
            let group = index
                .nearest_container(node)
                .map_or_else(|| node.code.clone(), |c| c.code.clone());
            grouped.entry(group).or_default().push(node.code.clone());
        }
        summary.total = granted.len();

        Self {
            user_id,
            role_ids: roles.iter().map(|r| r.id).collect(),
            role_codes: roles.iter().map(|r| r.code.clone()).collect(),
            is_superuser,
            permissions: granted,
            grouped,
            summary,
        }
    }

    /// Exact code membership. This is the only rule that yields a grant.
    pub fn contains_code(&self, code: &str) -> bool {
        self.permissions.iter().any(|n| n.code == code)
    }

    pub fn codes(&self) -> HashSet<&str> {
        self.permissions.iter().map(|n| n.code.as_str()).collect()
    }

    pub fn ids(&self) -> HashSet<i64> {
        self.permissions.iter().map(|n| n.id).collect()
    }

    pub fn holds_role(&self, role_id: i64) -> bool {
        self.role_ids.contains(&role_id)
    }
}

/// CatalogIndex
///
/// An id-keyed snapshot of the catalog used for parent lookups during resolution.
pub struct CatalogIndex {
    nodes: HashMap<i64, PermissionNode>,
}

impl CatalogIndex {
    pub fn new(nodes: Vec<PermissionNode>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.id, n)).collect(),
        }
    }

    pub fn get(&self, id: i64) -> Option<&PermissionNode> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &PermissionNode> {
        self.nodes.values()
    }

    /// The node's parent when that parent is a module or a page.
    pub fn nearest_container(&self, node: &PermissionNode) -> Option<&PermissionNode> {
        node.parent_id
            .and_then(|id| self.get(id))
            .filter(|p| matches!(p.node_type, NodeType::Module | NodeType::Page))
    }
}

#[derive(Clone)]
struct RoleGrants {
    permission_ids: Arc<Vec<i64>>,
    loaded_at: Instant,
}

/// Memo generation of one role: the global epoch plus the role's own counter.
type Generation = (u64, u64);

/// Resolver
///
/// Computes the union of permission nodes reachable through a user's roles. Per-role
/// id sets are memoized since edges change far less often than users resolve. A memo
/// entry never outlives the resolution TTL, and a load that races an invalidation of
/// its role is returned to the caller but not memoized.
pub struct Resolver {
    catalog: CatalogState,
    ledger: LedgerState,
    directory: DirectoryState,
    superuser_roles: HashSet<String>,
    role_ttl: Duration,
    role_cache: DashMap<i64, RoleGrants>,
    role_generations: DashMap<i64, u64>,
    epoch: AtomicU64,
}

impl Resolver {
    pub fn new(
        catalog: CatalogState,
        ledger: LedgerState,
        directory: DirectoryState,
        config: &AppConfig,
    ) -> Self {
        Self {
            catalog,
            ledger,
            directory,
            superuser_roles: config.superuser_roles.iter().cloned().collect(),
            role_ttl: config.role_cache_ttl.min(config.cache_ttl),
            role_cache: DashMap::new(),
            role_generations: DashMap::new(),
            epoch: AtomicU64::new(0),
        }
    }

    /// resolve
    ///
    /// Fetches the user's roles from the directory and resolves them. A user with no
    /// roles or no edges resolves to the empty set.
    pub async fn resolve(&self, user_id: Uuid) -> AppResult<ResolvedPermissionSet> {
        Ok(self.resolve_as_of(user_id).await?.0)
    }

    /// Like `resolve`, plus the instant of the oldest storage read the result rests on.
    /// Cached copies age from that instant, not from when they were stored.
    pub async fn resolve_as_of(
        &self,
        user_id: Uuid,
    ) -> AppResult<(ResolvedPermissionSet, Instant)> {
        let started = Instant::now();
        let roles = self.directory.roles_of_user(user_id).await?;
        self.resolve_roles_inner(user_id, &roles, started).await
    }

    /// resolve_roles
    ///
    /// Resolution for an explicit role set. Membership is binary, so duplicates across
    /// roles collapse without any tie-break. Inactive nodes never resolve.
    pub async fn resolve_roles(
        &self,
        user_id: Uuid,
        roles: &[Role],
    ) -> AppResult<ResolvedPermissionSet> {
        Ok(self
            .resolve_roles_inner(user_id, roles, Instant::now())
            .await?
            .0)
    }

    async fn resolve_roles_inner(
        &self,
        user_id: Uuid,
        roles: &[Role],
        started: Instant,
    ) -> AppResult<(ResolvedPermissionSet, Instant)> {
        if roles.is_empty() {
            tracing::debug!(%user_id, "user holds no roles");
            return Ok((ResolvedPermissionSet::empty(user_id), started));
        }

        let index = CatalogIndex::new(self.catalog.list_nodes().await?);
        let is_superuser = roles.iter().any(|r| self.superuser_roles.contains(&r.code));

        let mut as_of = started;
        let granted_ids: BTreeSet<i64> = if is_superuser {
            index.nodes().map(|n| n.id).collect()
        } else {
            let mut ids = BTreeSet::new();
            for role in roles {
                let (role_ids, loaded_at) = self.role_permission_ids(role.id).await?;
                as_of = as_of.min(loaded_at);
                ids.extend(role_ids.iter().copied());
            }
            ids
        };

        let granted: Vec<PermissionNode> = granted_ids
            .iter()
            .filter_map(|id| index.get(*id))
            .filter(|n| n.active)
            .cloned()
            .collect();

        tracing::debug!(
            %user_id,
            roles = roles.len(),
            granted = granted.len(),
            is_superuser,
            "resolved permissions"
        );
        let resolution = ResolvedPermissionSet::build(user_id, roles, is_superuser, granted, &index);
        Ok((resolution, as_of))
    }

    fn generation(&self, role_id: i64) -> Generation {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let role = self.role_generations.get(&role_id).map_or(0, |g| *g);
        (epoch, role)
    }

    async fn role_permission_ids(&self, role_id: i64) -> AppResult<(Arc<Vec<i64>>, Instant)> {
        // Clone out of the map so no shard lock is held across the await below.
        let cached = self.role_cache.get(&role_id).map(|entry| entry.clone());
        if let Some(grants) = cached {
            if grants.loaded_at.elapsed() < self.role_ttl {
                return Ok((grants.permission_ids, grants.loaded_at));
            }
        }

        let seen = self.generation(role_id);
        let loaded_at = Instant::now();
        let ids = Arc::new(self.ledger.permission_ids_for_role(role_id).await?);

        // Checked under the shard lock: `invalidate_role` bumps the generation before it
        // removes, so a bump that misses this check still removes the insert.
        let grants = RoleGrants {
            permission_ids: ids.clone(),
            loaded_at,
        };
        match self.role_cache.entry(role_id) {
            _ if self.generation(role_id) != seen => {
                tracing::debug!(role_id, "role invalidated during load, not memoized");
            }
            Entry::Occupied(mut slot) => {
                slot.insert(grants);
            }
            Entry::Vacant(slot) => {
                slot.insert(grants);
            }
        }
        Ok((ids, loaded_at))
    }

    /// Drops the memoized edge set of one role, including any load still in flight.
    pub fn invalidate_role(&self, role_id: i64) {
        *self.role_generations.entry(role_id).or_insert(0) += 1;
        self.role_cache.remove(&role_id);
    }

    pub fn invalidate_all_roles(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.role_cache.clear();
    }
}
