use crate::{
    error::{AppError, AppResult},
    models::{
        GrantOutcome, NewPermissionNode, PermissionNode, Role, RolePermissionEdge,
        UpdatePermissionNode, validate_new_node,
    },
};
use async_trait::async_trait;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

/// PermissionCatalog
///
/// Read-mostly access to the module → page → action tree. Structural mutations
/// enforce the shape rules in code so every backend behaves the same way.
#[async_trait]
pub trait PermissionCatalog: Send + Sync {
    async fn get_by_id(&self, id: i64) -> AppResult<Option<PermissionNode>>;
    async fn get_by_code(&self, code: &str) -> AppResult<Option<PermissionNode>>;
    /// Nodes whose `path` starts with `prefix`, ordered by `(sort_order, id)`.
    async fn find_by_path(&self, prefix: &str) -> AppResult<Vec<PermissionNode>>;
    async fn children_of(&self, id: i64) -> AppResult<Vec<PermissionNode>>;
    /// Ancestors of `id`, nearest first. Empty for roots and unknown ids.
    async fn ancestors_of(&self, id: i64) -> AppResult<Vec<PermissionNode>>;
    async fn list_nodes(&self) -> AppResult<Vec<PermissionNode>>;

    // --- Administrative mutations ---
    async fn create_node(&self, req: NewPermissionNode) -> AppResult<PermissionNode>;
    /// `code` may only change while no edge references the node.
    async fn update_node(&self, id: i64, req: UpdatePermissionNode) -> AppResult<PermissionNode>;
    /// Fails with `Conflict` when the node still has edges or children.
    async fn delete_node(&self, id: i64) -> AppResult<()>;
}

/// AssignmentLedger
///
/// The role ↔ permission edge table. Writes are transactional and integrity-checked.
#[async_trait]
pub trait AssignmentLedger: Send + Sync {
    async fn role_exists(&self, role_id: i64) -> AppResult<bool>;
    async fn permission_ids_for_role(&self, role_id: i64) -> AppResult<Vec<i64>>;
    async fn edges_for_role(&self, role_id: i64) -> AppResult<Vec<RolePermissionEdge>>;
    /// Inserts or refreshes one edge per distinct id, all-or-nothing. An existing edge keeps
    /// its `grantor_id` and `created_at`; only `updated_at` (and `notes`, when given) move.
    async fn grant_many(
        &self,
        role_id: i64,
        permission_ids: &[i64],
        grantor_id: Option<Uuid>,
        notes: Option<String>,
    ) -> AppResult<Vec<GrantOutcome>>;
    /// Returns whether an edge was removed. Unknown role or permission ids are errors.
    async fn revoke(&self, role_id: i64, permission_id: i64) -> AppResult<bool>;
}

/// RoleDirectory
///
/// The external user ↔ role capability. Consumed, never mutated, by the core.
#[async_trait]
pub trait RoleDirectory: Send + Sync {
    /// Active roles held by the user. An unknown user has no roles.
    async fn roles_of_user(&self, user_id: Uuid) -> AppResult<Vec<Role>>;
    async fn list_roles(&self) -> AppResult<Vec<Role>>;
}

pub type CatalogState = Arc<dyn PermissionCatalog>;
pub type LedgerState = Arc<dyn AssignmentLedger>;
pub type DirectoryState = Arc<dyn RoleDirectory>;

/// Keeps the first occurrence of every id.
pub(crate) fn distinct_ids(ids: &[i64]) -> Vec<i64> {
    let mut seen = BTreeSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

const NODE_COLUMNS: &str = "id, code, name, type, path, parent_id, sort_order, active";
const EDGE_COLUMNS: &str = "id, role_id, permission_id, grantor_id, notes, created_at, updated_at";

/// Edge row plus the Postgres `xmax = 0` marker telling inserts apart from conflict updates.
#[derive(FromRow)]
struct UpsertedEdge {
    #[sqlx(flatten)]
    edge: RolePermissionEdge,
    inserted: bool,
}

/// PostgresRepository
///
/// Implements the catalog, the ledger and the role directory on top of one pool.
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn node_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
    ) -> AppResult<Option<PermissionNode>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM permissions WHERE id = $1 FOR UPDATE");
        Ok(sqlx::query_as::<_, PermissionNode>(&sql)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?)
    }

    async fn edge_count_in_tx(tx: &mut Transaction<'_, Postgres>, id: i64) -> AppResult<i64> {
        Ok(
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM role_permissions WHERE permission_id = $1")
                .bind(id)
                .fetch_one(&mut **tx)
                .await?,
        )
    }
}

#[async_trait]
impl PermissionCatalog for PostgresRepository {
    async fn get_by_id(&self, id: i64) -> AppResult<Option<PermissionNode>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM permissions WHERE id = $1");
        Ok(sqlx::query_as::<_, PermissionNode>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn get_by_code(&self, code: &str) -> AppResult<Option<PermissionNode>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM permissions WHERE code = $1");
        Ok(sqlx::query_as::<_, PermissionNode>(&sql)
            .bind(code)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// find_by_path
    ///
    /// Uses `starts_with` rather than `LIKE` so `%` and `_` in user input stay literal.
    async fn find_by_path(&self, prefix: &str) -> AppResult<Vec<PermissionNode>> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM permissions \
             WHERE path IS NOT NULL AND starts_with(path, $1) \
             ORDER BY sort_order, id"
        );
        Ok(sqlx::query_as::<_, PermissionNode>(&sql)
            .bind(prefix)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn children_of(&self, id: i64) -> AppResult<Vec<PermissionNode>> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM permissions WHERE parent_id = $1 ORDER BY sort_order, id"
        );
        Ok(sqlx::query_as::<_, PermissionNode>(&sql)
            .bind(id)
            .fetch_all(&self.pool)
            .await?)
    }

    /// ancestors_of
    ///
    /// Walks `parent_id` upwards with a recursive CTE; `depth` keeps the nearest ancestor first.
    async fn ancestors_of(&self, id: i64) -> AppResult<Vec<PermissionNode>> {
        let sql = format!(
            r#"
            WITH RECURSIVE chain AS (
                SELECT p.*, 0 AS depth
                FROM permissions p
                WHERE p.id = (SELECT parent_id FROM permissions WHERE id = $1)
                UNION ALL
                SELECT p.*, c.depth + 1
                FROM permissions p
                JOIN chain c ON p.id = c.parent_id
                WHERE c.depth < 16
            )
            SELECT {NODE_COLUMNS} FROM chain ORDER BY depth
            "#
        );
        Ok(sqlx::query_as::<_, PermissionNode>(&sql)
            .bind(id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn list_nodes(&self) -> AppResult<Vec<PermissionNode>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM permissions ORDER BY sort_order, id");
        Ok(sqlx::query_as::<_, PermissionNode>(&sql)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn create_node(&self, req: NewPermissionNode) -> AppResult<PermissionNode> {
        let mut tx = self.pool.begin().await?;

        let parent = match req.parent_id {
            Some(parent_id) => Self::node_in_tx(&mut tx, parent_id).await?,
            None => None,
        };
        validate_new_node(&req, parent.as_ref())?;

        let taken: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM permissions WHERE code = $1)")
            .bind(&req.code)
            .fetch_one(&mut *tx)
            .await?;
        if taken {
            return Err(AppError::Conflict(format!("permission code {} already exists", req.code)));
        }

        let sql = format!(
            "INSERT INTO permissions (code, name, type, path, parent_id, sort_order, active) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {NODE_COLUMNS}"
        );
        let node = sqlx::query_as::<_, PermissionNode>(&sql)
            .bind(&req.code)
            .bind(&req.name)
            .bind(req.node_type.as_str())
            .bind(&req.path)
            .bind(req.parent_id)
            .bind(req.sort_order)
            .bind(req.active)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::info!(permission_id = node.id, code = %node.code, "catalog node created");
        Ok(node)
    }

    async fn update_node(&self, id: i64, req: UpdatePermissionNode) -> AppResult<PermissionNode> {
        let mut tx = self.pool.begin().await?;

        let current = Self::node_in_tx(&mut tx, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("permission {id} not found")))?;

        if let Some(code) = req.code.as_deref().filter(|c| *c != current.code) {
            if code.trim().is_empty() {
                return Err(AppError::Validation("code must not be empty".into()));
            }
            if Self::edge_count_in_tx(&mut tx, id).await? > 0 {
                return Err(AppError::Conflict(format!(
                    "code of permission {id} is referenced by role assignments and cannot change"
                )));
            }
            let taken: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM permissions WHERE code = $1)")
                    .bind(code)
                    .fetch_one(&mut *tx)
                    .await?;
            if taken {
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

        let sql = format!(
            r#"
            UPDATE permissions
            SET code = COALESCE($2, code),
                name = COALESCE($3, name),
                path = COALESCE($4, path),
                sort_order = COALESCE($5, sort_order),
                active = COALESCE($6, active)
            WHERE id = $1
            RETURNING {NODE_COLUMNS}
            "#
        );
        let node = sqlx::query_as::<_, PermissionNode>(&sql)
            .bind(id)
            .bind(req.code)
            .bind(req.name)
            .bind(req.path)
            .bind(req.sort_order)
            .bind(req.active)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(node)
    }

    async fn delete_node(&self, id: i64) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        if Self::node_in_tx(&mut tx, id).await?.is_none() {
            return Err(AppError::NotFound(format!("permission {id} not found")));
        }
        if Self::edge_count_in_tx(&mut tx, id).await? > 0 {
            return Err(AppError::Conflict(format!(
                "permission {id} is still assigned to roles"
            )));
        }
        let children: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM permissions WHERE parent_id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        if children > 0 {
            return Err(AppError::Conflict(format!("permission {id} still has children")));
        }

        sqlx::query("DELETE FROM permissions WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!(permission_id = id, "catalog node deleted");
        Ok(())
    }
}

#[async_trait]
impl AssignmentLedger for PostgresRepository {
    async fn role_exists(&self, role_id: i64) -> AppResult<bool> {
        Ok(sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM roles WHERE id = $1)")
            .bind(role_id)
            .fetch_one(&self.pool)
            .await?)
    }

    async fn permission_ids_for_role(&self, role_id: i64) -> AppResult<Vec<i64>> {
        Ok(sqlx::query_scalar(
            "SELECT permission_id FROM role_permissions WHERE role_id = $1 ORDER BY permission_id",
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn edges_for_role(&self, role_id: i64) -> AppResult<Vec<RolePermissionEdge>> {
        let sql = format!(
            "SELECT {EDGE_COLUMNS} FROM role_permissions WHERE role_id = $1 ORDER BY permission_id"
        );
        Ok(sqlx::query_as::<_, RolePermissionEdge>(&sql)
            .bind(role_id)
            .fetch_all(&self.pool)
            .await?)
    }

    /// grant_many
    ///
    /// Validates every reference inside the transaction before writing, then upserts with
    /// `ON CONFLICT DO UPDATE` so a repeated grant refreshes rather than duplicates.
    async fn grant_many(
        &self,
        role_id: i64,
        permission_ids: &[i64],
        grantor_id: Option<Uuid>,
        notes: Option<String>,
    ) -> AppResult<Vec<GrantOutcome>> {
        let ids = distinct_ids(permission_ids);
        let mut tx = self.pool.begin().await?;

        let role_found: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM roles WHERE id = $1)")
            .bind(role_id)
            .fetch_one(&mut *tx)
            .await?;
        if !role_found {
            return Err(AppError::ReferentialIntegrity(format!("role {role_id} does not exist")));
        }

        let known: Vec<i64> = sqlx::query_scalar("SELECT id FROM permissions WHERE id = ANY($1)")
            .bind(ids.clone())
            .fetch_all(&mut *tx)
            .await?;
        if let Some(missing) = ids.iter().find(|id| !known.contains(*id)) {
            return Err(AppError::ReferentialIntegrity(format!(
                "permission {missing} does not exist"
            )));
        }

        let sql = format!(
            r#"
            INSERT INTO role_permissions (role_id, permission_id, grantor_id, notes, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            ON CONFLICT (role_id, permission_id) DO UPDATE
            SET updated_at = NOW(),
                notes = COALESCE(EXCLUDED.notes, role_permissions.notes)
            RETURNING {EDGE_COLUMNS}, (xmax = 0) AS inserted
            "#
        );
        let mut outcomes = Vec::with_capacity(ids.len());
        for permission_id in ids {
            let row = sqlx::query_as::<_, UpsertedEdge>(&sql)
                .bind(role_id)
                .bind(permission_id)
                .bind(grantor_id)
                .bind(&notes)
                .fetch_one(&mut *tx)
                .await?;
            outcomes.push(GrantOutcome {
                edge: row.edge,
                created: row.inserted,
            });
        }

        tx.commit().await?;
        Ok(outcomes)
    }

    async fn revoke(&self, role_id: i64, permission_id: i64) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;

        let role_found: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM roles WHERE id = $1)")
            .bind(role_id)
            .fetch_one(&mut *tx)
            .await?;
        if !role_found {
            return Err(AppError::ReferentialIntegrity(format!("role {role_id} does not exist")));
        }
        let permission_found: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM permissions WHERE id = $1)")
                .bind(permission_id)
                .fetch_one(&mut *tx)
                .await?;
        if !permission_found {
            return Err(AppError::ReferentialIntegrity(format!(
                "permission {permission_id} does not exist"
            )));
        }

        let res = sqlx::query("DELETE FROM role_permissions WHERE role_id = $1 AND permission_id = $2")
            .bind(role_id)
            .bind(permission_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(res.rows_affected() > 0)
    }
}

#[async_trait]
impl RoleDirectory for PostgresRepository {
    async fn roles_of_user(&self, user_id: Uuid) -> AppResult<Vec<Role>> {
        Ok(sqlx::query_as::<_, Role>(
            r#"
            SELECT r.id, r.code, r.name, r.description
            FROM roles r
            JOIN user_roles ur ON ur.role_id = r.id
            WHERE ur.user_id = $1 AND r.status = 1
            ORDER BY r.id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn list_roles(&self) -> AppResult<Vec<Role>> {
        Ok(sqlx::query_as::<_, Role>(
            "SELECT id, code, name, description FROM roles WHERE status = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::distinct_ids;

    #[test]
    fn distinct_ids_keeps_first_occurrence_order() {
        assert_eq!(distinct_ids(&[3, 1, 3, 2, 1]), vec![3, 1, 2]);
    }
}
