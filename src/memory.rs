use crate::{
    error::{AppError, AppResult},
    models::{
        GrantOutcome, NewPermissionNode, PermissionNode, Role, RolePermissionEdge,
        UpdatePermissionNode, validate_new_node,
    },
    repository::{AssignmentLedger, PermissionCatalog, RoleDirectory, distinct_ids},
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    nodes: BTreeMap<i64, PermissionNode>,
    roles: BTreeMap<i64, Role>,
    user_roles: HashMap<Uuid, BTreeSet<i64>>,
    edges: BTreeMap<(i64, i64), RolePermissionEdge>,
    next_node_id: i64,
    next_edge_id: i64,
}

impl MemoryState {
    fn sorted(&self, mut nodes: Vec<PermissionNode>) -> Vec<PermissionNode> {
        nodes.sort_by_key(|n| (n.sort_order, n.id));
        nodes
    }

    fn edge_count(&self, permission_id: i64) -> usize {
        self.edges.keys().filter(|(_, p)| *p == permission_id).count()
    }
}

/// InMemoryRepository
///
/// A process-local implementation of the catalog, the ledger and the role directory.
/// Used by the test suites and for running the service without Postgres. Every write
/// validates fully before touching state, which gives the same all-or-nothing behaviour
/// as the transactional backend.
#[derive(Default)]
pub struct InMemoryRepository {
    state: RwLock<MemoryState>,
    // When set, every call fails as if the backing store were unreachable.
    unavailable: AtomicBool,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage of the backing store.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn read(&self) -> AppResult<RwLockReadGuard<'_, MemoryState>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Internal("memory store unavailable".into()));
        }
        self.state
            .read()
            .map_err(|_| AppError::Internal("memory store lock poisoned".into()))
    }

    fn write(&self) -> AppResult<RwLockWriteGuard<'_, MemoryState>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Internal("memory store unavailable".into()));
        }
        self.state
            .write()
            .map_err(|_| AppError::Internal("memory store lock poisoned".into()))
    }

    // --- Seeding helpers ---

    /// Inserts a node with a caller-chosen id, applying the same shape rules as `create_node`.
    pub fn seed_node(&self, node: PermissionNode) -> AppResult<PermissionNode> {
        let mut state = self.write()?;
        if state.nodes.contains_key(&node.id) {
            return Err(AppError::Conflict(format!("permission {} already exists", node.id)));
        }
        if state.nodes.values().any(|n| n.code == node.code) {
            return Err(AppError::Conflict(format!("permission code {} already exists", node.code)));
        }
        let parent = node.parent_id.and_then(|id| state.nodes.get(&id));
        let req = NewPermissionNode {
            code: node.code.clone(),
            name: node.name.clone(),
            node_type: node.node_type,
            path: node.path.clone(),
            parent_id: node.parent_id,
            sort_order: node.sort_order,
            active: node.active,
        };
        validate_new_node(&req, parent)?;
        state.next_node_id = state.next_node_id.max(node.id);
        state.nodes.insert(node.id, node.clone());
        Ok(node)
    }

    pub fn seed_role(&self, role: Role) -> AppResult<()> {
        self.write()?.roles.insert(role.id, role);
        Ok(())
    }

    /// Changes the external user ↔ role association. Callers are expected to invalidate
    /// the user's cached resolution afterwards.
    pub fn assign_user_role(&self, user_id: Uuid, role_id: i64) -> AppResult<()> {
        let mut state = self.write()?;
        if !state.roles.contains_key(&role_id) {
            return Err(AppError::ReferentialIntegrity(format!("role {role_id} does not exist")));
        }
        state.user_roles.entry(user_id).or_default().insert(role_id);
        Ok(())
    }

    pub fn remove_user_role(&self, user_id: Uuid, role_id: i64) -> AppResult<bool> {
        let mut state = self.write()?;
        Ok(state
            .user_roles
            .get_mut(&user_id)
            .is_some_and(|roles| roles.remove(&role_id)))
    }

    pub fn edge_count(&self) -> AppResult<usize> {
        Ok(self.read()?.edges.len())
    }
}

#[async_trait]
impl PermissionCatalog for InMemoryRepository {
    async fn get_by_id(&self, id: i64) -> AppResult<Option<PermissionNode>> {
        Ok(self.read()?.nodes.get(&id).cloned())
    }

    async fn get_by_code(&self, code: &str) -> AppResult<Option<PermissionNode>> {
        Ok(self.read()?.nodes.values().find(|n| n.code == code).cloned())
    }

    async fn find_by_path(&self, prefix: &str) -> AppResult<Vec<PermissionNode>> {
        let state = self.read()?;
        let found = state
            .nodes
            .values()
            .filter(|n| n.path.as_deref().is_some_and(|p| p.starts_with(prefix)))
            .cloned()
            .collect();
        Ok(state.sorted(found))
    }

    async fn children_of(&self, id: i64) -> AppResult<Vec<PermissionNode>> {
        let state = self.read()?;
        let found = state
            .nodes
            .values()
            .filter(|n| n.parent_id == Some(id))
            .cloned()
            .collect();
        Ok(state.sorted(found))
    }

    async fn ancestors_of(&self, id: i64) -> AppResult<Vec<PermissionNode>> {
        let state = self.read()?;
        let mut chain = Vec::new();
        let mut cursor = state.nodes.get(&id).and_then(|n| n.parent_id);
        while let Some(parent_id) = cursor {
            let Some(parent) = state.nodes.get(&parent_id) else {
                break;
            };
            // Guards against a corrupted parent chain.
            if chain.iter().any(|n: &PermissionNode| n.id == parent.id) {
                break;
            }
            chain.push(parent.clone());
            cursor = parent.parent_id;
        }
        Ok(chain)
    }

    async fn list_nodes(&self) -> AppResult<Vec<PermissionNode>> {
        let state = self.read()?;
        let all = state.nodes.values().cloned().collect();
        Ok(state.sorted(all))
    }

    async fn create_node(&self, req: NewPermissionNode) -> AppResult<PermissionNode> {
        let mut state = self.write()?;
        let parent = req.parent_id.and_then(|id| state.nodes.get(&id));
        validate_new_node(&req, parent)?;
        if state.nodes.values().any(|n| n.code == req.code) {
            return Err(AppError::Conflict(format!("permission code {} already exists", req.code)));
        }

        state.next_node_id += 1;
        let node = PermissionNode {
            id: state.next_node_id,
            code: req.code,
            name: req.name,
            node_type: req.node_type,
            path: req.path,
            parent_id: req.parent_id,
            sort_order: req.sort_order,
            active: req.active,
        };
        state.nodes.insert(node.id, node.clone());
        Ok(node)
    }

    async fn update_node(&self, id: i64, req: UpdatePermissionNode) -> AppResult<PermissionNode> {
        let mut state = self.write()?;
        let current = state
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("permission {id} not found")))?;

        if let Some(code) = req.code.as_deref().filter(|c| *c != current.code) {
            if code.trim().is_empty() {
                return Err(AppError::Validation("code must not be empty".into()));
            }
            if state.edge_count(id) > 0 {
                return Err(AppError::Conflict(format!(
                    "code of permission {id} is referenced by role assignments and cannot change"
                )));
            }
            if state.nodes.values().any(|n| n.code == code) {
                return Err(AppError::Conflict(format!("permission code {code} already exists")));
            }
        }
        if current.node_type.requires_path()
            && req.path.as_deref().is_some_and(|p| p.trim().is_empty())
        {
            return Err(AppError::Validation(format!(
                "path is required for {} nodes",
                current.node_type.as_str()
            )));
        }

        let updated = PermissionNode {
            code: req.code.unwrap_or(current.code),
            name: req.name.unwrap_or(current.name),
            path: req.path.or(current.path),
            sort_order: req.sort_order.unwrap_or(current.sort_order),
            active: req.active.unwrap_or(current.active),
            ..current
        };
        state.nodes.insert(id, updated.clone());
        Ok(updated)
    }

    async fn delete_node(&self, id: i64) -> AppResult<()> {
        let mut state = self.write()?;
        if !state.nodes.contains_key(&id) {
            return Err(AppError::NotFound(format!("permission {id} not found")));
        }
        if state.edge_count(id) > 0 {
            return Err(AppError::Conflict(format!(
                "permission {id} is still assigned to roles"
            )));
        }
        if state.nodes.values().any(|n| n.parent_id == Some(id)) {
            return Err(AppError::Conflict(format!("permission {id} still has children")));
        }
        state.nodes.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl AssignmentLedger for InMemoryRepository {
    async fn role_exists(&self, role_id: i64) -> AppResult<bool> {
        Ok(self.read()?.roles.contains_key(&role_id))
    }

    async fn permission_ids_for_role(&self, role_id: i64) -> AppResult<Vec<i64>> {
        Ok(self
            .read()?
            .edges
            .keys()
            .filter(|(r, _)| *r == role_id)
            .map(|(_, p)| *p)
            .collect())
    }

    async fn edges_for_role(&self, role_id: i64) -> AppResult<Vec<RolePermissionEdge>> {
        Ok(self
            .read()?
            .edges
            .iter()
            .filter(|((r, _), _)| *r == role_id)
            .map(|(_, edge)| edge.clone())
            .collect())
    }

    async fn grant_many(
        &self,
        role_id: i64,
        permission_ids: &[i64],
        grantor_id: Option<Uuid>,
        notes: Option<String>,
    ) -> AppResult<Vec<GrantOutcome>> {
        let ids = distinct_ids(permission_ids);
        let mut state = self.write()?;

        if !state.roles.contains_key(&role_id) {
            return Err(AppError::ReferentialIntegrity(format!("role {role_id} does not exist")));
        }
        if let Some(missing) = ids.iter().find(|id| !state.nodes.contains_key(*id)) {
            return Err(AppError::ReferentialIntegrity(format!(
                "permission {missing} does not exist"
            )));
        }

        let now = Utc::now();
        let mut outcomes = Vec::with_capacity(ids.len());
        for permission_id in ids {
            if let Some(edge) = state.edges.get_mut(&(role_id, permission_id)) {
                edge.updated_at = now;
                if notes.is_some() {
                    edge.notes = notes.clone();
                }
                outcomes.push(GrantOutcome {
                    edge: edge.clone(),
                    created: false,
                });
                continue;
            }

            state.next_edge_id += 1;
            let edge = RolePermissionEdge {
                id: state.next_edge_id,
                role_id,
                permission_id,
                grantor_id,
                notes: notes.clone(),
                created_at: now,
                updated_at: now,
            };
            state.edges.insert((role_id, permission_id), edge.clone());
            outcomes.push(GrantOutcome {
                edge,
                created: true,
            });
        }
        Ok(outcomes)
    }

    async fn revoke(&self, role_id: i64, permission_id: i64) -> AppResult<bool> {
        let mut state = self.write()?;
        if !state.roles.contains_key(&role_id) {
            return Err(AppError::ReferentialIntegrity(format!("role {role_id} does not exist")));
        }
        if !state.nodes.contains_key(&permission_id) {
            return Err(AppError::ReferentialIntegrity(format!(
                "permission {permission_id} does not exist"
            )));
        }
        Ok(state.edges.remove(&(role_id, permission_id)).is_some())
    }
}

#[async_trait]
impl RoleDirectory for InMemoryRepository {
    async fn roles_of_user(&self, user_id: Uuid) -> AppResult<Vec<Role>> {
        let state = self.read()?;
        Ok(state
            .user_roles
            .get(&user_id)
            .map(|ids| ids.iter().filter_map(|id| state.roles.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    async fn list_roles(&self) -> AppResult<Vec<Role>> {
        Ok(self.read()?.roles.values().cloned().collect())
    }
}
