use crate::{
    cache::ResolutionCache,
    error::{AppError, AppResult},
    models::{
        AssignManyResponse, GrantOutcome, NodeType, PermissionNode, RolePermissionEdge,
        RolePagesUpdateResponse,
    },
    repository::{CatalogState, LedgerState},
};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

/// AssignmentService
///
/// Write side of the role ↔ permission ledger. Every successful write marks the cached
/// resolutions of the role's holders stale once the ledger call has returned.
pub struct AssignmentService {
    ledger: LedgerState,
    cache: Arc<ResolutionCache>,
}

impl AssignmentService {
    pub fn new(ledger: LedgerState, cache: Arc<ResolutionCache>) -> Self {
        Self { ledger, cache }
    }

    /// grant
    ///
    /// Idempotent. A repeat grant returns the existing edge with `created = false`.
    pub async fn grant(
        &self,
        role_id: i64,
        permission_id: i64,
        grantor_id: Option<Uuid>,
        notes: Option<String>,
    ) -> AppResult<GrantOutcome> {
        let outcome = self
            .ledger
            .grant_many(role_id, &[permission_id], grantor_id, notes)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Internal("ledger returned no edge for grant".into()))?;

        tracing::info!(
            role_id,
            permission_id,
            created = outcome.created,
            "role permission granted"
        );
        self.cache.invalidate_users_of_role(role_id);
        Ok(outcome)
    }

    /// revoke
    ///
    /// Removes the edge when present. Returns whether anything was removed.
    pub async fn revoke(&self, role_id: i64, permission_id: i64) -> AppResult<bool> {
        let removed = self.ledger.revoke(role_id, permission_id).await?;
        tracing::info!(role_id, permission_id, removed, "role permission revoked");
        if removed {
            self.cache.invalidate_users_of_role(role_id);
        }
        Ok(removed)
    }

    /// assign_many
    ///
    /// Grants every id in one ledger transaction. The response separates newly created
    /// edges from ones that already existed.
    pub async fn assign_many(
        &self,
        role_id: i64,
        permission_ids: &[i64],
        grantor_id: Option<Uuid>,
        notes: Option<String>,
    ) -> AppResult<AssignManyResponse> {
        if permission_ids.is_empty() {
            return Err(AppError::Validation(
                "permissionIds must be a non-empty list".into(),
            ));
        }

        let outcomes = self
            .ledger
            .grant_many(role_id, permission_ids, grantor_id, notes)
            .await?;
        let total_assigned = outcomes.iter().filter(|o| o.created).count();

        tracing::info!(
            role_id,
            requested = permission_ids.len(),
            total_assigned,
            "bulk role permission assignment"
        );
        self.cache.invalidate_users_of_role(role_id);

        Ok(AssignManyResponse {
            role_id,
            total_assigned,
            already_present: outcomes.len() - total_assigned,
            permission_ids: outcomes.iter().map(|o| o.edge.permission_id).collect(),
        })
    }

    pub async fn edges_for_role(&self, role_id: i64) -> AppResult<Vec<RolePermissionEdge>> {
        self.ensure_role(role_id).await?;
        self.ledger.edges_for_role(role_id).await
    }

    async fn ensure_role(&self, role_id: i64) -> AppResult<()> {
        if !self.ledger.role_exists(role_id).await? {
            return Err(AppError::NotFound(format!("role {role_id} does not exist")));
        }
        Ok(())
    }

    /// page_grants
    ///
    /// The module and page nodes a role holds, ordered by `(sort_order, id)`. Action
    /// grants are left out.
    pub async fn page_grants(
        &self,
        catalog: &CatalogState,
        role_id: i64,
    ) -> AppResult<Vec<PermissionNode>> {
        self.ensure_role(role_id).await?;
        let held: BTreeSet<i64> = self
            .ledger
            .permission_ids_for_role(role_id)
            .await?
            .into_iter()
            .collect();

        let mut pages: Vec<PermissionNode> = catalog
            .list_nodes()
            .await?
            .into_iter()
            .filter(|n| n.node_type != NodeType::Action && held.contains(&n.id))
            .collect();
        pages.sort_by_key(|n| (n.sort_order, n.id));
        Ok(pages)
    }

    /// replace_page_grants
    ///
    /// Makes the role's module/page grants equal `permission_ids`: missing ones are
    /// granted in one ledger transaction, extra ones revoked. Action grants are untouched.
    /// Every id must name an existing module or page; nothing is written otherwise.
    pub async fn replace_page_grants(
        &self,
        catalog: &CatalogState,
        role_id: i64,
        permission_ids: &[i64],
        grantor_id: Option<Uuid>,
    ) -> AppResult<RolePagesUpdateResponse> {
        let current: BTreeSet<i64> = self
            .page_grants(catalog, role_id)
            .await?
            .into_iter()
            .map(|n| n.id)
            .collect();

        let desired: BTreeSet<i64> = permission_ids.iter().copied().collect();
        for id in &desired {
            match catalog.get_by_id(*id).await? {
                None => {
                    return Err(AppError::ReferentialIntegrity(format!(
                        "permission {id} does not exist"
                    )));
                }
                Some(node) if node.node_type == NodeType::Action => {
                    return Err(AppError::Validation(format!(
                        "permission {id} is an action, not a module or page"
                    )));
                }
                Some(_) => {}
            }
        }

        let to_add: Vec<i64> = desired.difference(&current).copied().collect();
        let to_remove: Vec<i64> = current.difference(&desired).copied().collect();

        if !to_add.is_empty() {
            self.ledger
                .grant_many(role_id, &to_add, grantor_id, None)
                .await?;
        }
        let mut removed = 0;
        for id in &to_remove {
            if self.ledger.revoke(role_id, *id).await? {
                removed += 1;
            }
        }

        tracing::info!(
            role_id,
            added = to_add.len(),
            removed,
            "role page permissions replaced"
        );
        if !to_add.is_empty() || removed > 0 {
            self.cache.invalidate_users_of_role(role_id);
        }

        Ok(RolePagesUpdateResponse {
            role_id,
            updated_permissions: desired.into_iter().collect(),
            added: to_add.len(),
            removed,
        })
    }
}
