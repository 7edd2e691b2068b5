#![allow(dead_code)]

use permission_service::{
    AppConfig, AppState, AssignmentLedger, CatalogState, DirectoryState, InMemoryRepository,
    LedgerState,
    auth::AuthUser,
    models::{NodeType, PermissionNode, Role},
};
use std::sync::Arc;
use uuid::Uuid;

// --- Catalog ids ---
pub const STUDENT_MODULE: i64 = 1;
pub const STUDENT_PAGE: i64 = 2;
pub const VIEW_STUDENT: i64 = 3;
pub const EDIT_STUDENT: i64 = 4;
pub const DELETE_STUDENT: i64 = 5;
pub const REPORTS_PAGE: i64 = 20;
pub const EXPORT_REPORT: i64 = 21;
pub const SYSTEM_CENTER: i64 = 10;
pub const PERMISSION_PAGE: i64 = 11;
pub const PERMISSION_MANAGE: i64 = 12;
pub const ROLE_PERMISSION_MANAGE: i64 = 13;

// --- Role ids ---
pub const TEACHER: i64 = 1;
pub const ADMIN: i64 = 2;
pub const PARENT: i64 = 3;
pub const MANAGER: i64 = 4;

pub fn node(
    id: i64,
    code: &str,
    node_type: NodeType,
    path: Option<&str>,
    parent_id: Option<i64>,
    sort_order: i32,
) -> PermissionNode {
    PermissionNode {
        id,
        code: code.to_string(),
        name: code.to_lowercase().replace('_', " "),
        node_type,
        path: path.map(str::to_string),
        parent_id,
        sort_order,
        active: true,
    }
}

pub fn role(id: i64, code: &str) -> Role {
    Role {
        id,
        code: code.to_string(),
        name: code.to_string(),
        description: None,
    }
}

/// Fixture
///
/// A seeded in-memory store plus the state wired over it.
///
/// Catalog:
///   STUDENT_MODULE(1, /student-center)
///     STUDENT_PAGE(2, /students): VIEW_STUDENT(3), EDIT_STUDENT(4), DELETE_STUDENT(5)
///     REPORTS_PAGE(20, /students/reports): EXPORT_REPORT(21)
///   SYSTEM_CENTER(10, /system)
///     PERMISSION_PAGE(11, /system/permissions): PERMISSION_MANAGE(12), ROLE_PERMISSION_MANAGE(13)
///
/// Grants: teacher {3, 4}; parent {1, 2, 3}; manager {10, 11, 12, 13}; admin is a superuser.
pub struct Fixture {
    pub repo: Arc<InMemoryRepository>,
    pub state: AppState,
    pub teacher_user: Uuid,
    pub parent_user: Uuid,
    pub admin_user: Uuid,
    pub manager_user: Uuid,
    pub multi_role_user: Uuid,
    pub no_role_user: Uuid,
}

impl Fixture {
    pub fn user(&self, id: Uuid) -> AuthUser {
        AuthUser { id }
    }
}

pub fn seed_catalog(repo: &InMemoryRepository) {
    let nodes = [
        node(STUDENT_MODULE, "STUDENT_MODULE", NodeType::Module, Some("/student-center"), None, 1),
        node(STUDENT_PAGE, "STUDENT_PAGE", NodeType::Page, Some("/students"), Some(STUDENT_MODULE), 1),
        node(VIEW_STUDENT, "VIEW_STUDENT", NodeType::Action, None, Some(STUDENT_PAGE), 1),
        node(EDIT_STUDENT, "EDIT_STUDENT", NodeType::Action, None, Some(STUDENT_PAGE), 2),
        node(DELETE_STUDENT, "DELETE_STUDENT", NodeType::Action, None, Some(STUDENT_PAGE), 3),
        node(SYSTEM_CENTER, "SYSTEM_CENTER", NodeType::Module, Some("/system"), None, 9),
        node(PERMISSION_PAGE, "PERMISSION_PAGE", NodeType::Page, Some("/system/permissions"), Some(SYSTEM_CENTER), 1),
        node(PERMISSION_MANAGE, "PERMISSION_MANAGE", NodeType::Action, None, Some(PERMISSION_PAGE), 1),
        node(ROLE_PERMISSION_MANAGE, "ROLE_PERMISSION_MANAGE", NodeType::Action, None, Some(PERMISSION_PAGE), 2),
        node(REPORTS_PAGE, "REPORTS_PAGE", NodeType::Page, Some("/students/reports"), Some(STUDENT_MODULE), 2),
        node(EXPORT_REPORT, "EXPORT_REPORT", NodeType::Action, None, Some(REPORTS_PAGE), 1),
    ];
    for n in nodes {
        repo.seed_node(n).expect("seed node");
    }
    for r in [
        role(TEACHER, "teacher"),
        role(ADMIN, "admin"),
        role(PARENT, "parent"),
        role(MANAGER, "manager"),
    ] {
        repo.seed_role(r).expect("seed role");
    }
}

pub async fn seed_edges(repo: &InMemoryRepository) {
    repo.grant_many(TEACHER, &[VIEW_STUDENT, EDIT_STUDENT], None, None)
        .await
        .expect("teacher edges");
    repo.grant_many(PARENT, &[STUDENT_MODULE, STUDENT_PAGE, VIEW_STUDENT], None, None)
        .await
        .expect("parent edges");
    repo.grant_many(
        MANAGER,
        &[SYSTEM_CENTER, PERMISSION_PAGE, PERMISSION_MANAGE, ROLE_PERMISSION_MANAGE],
        None,
        None,
    )
    .await
    .expect("manager edges");
}

pub fn state_over(repo: &Arc<InMemoryRepository>, config: AppConfig) -> AppState {
    AppState::new(
        repo.clone() as CatalogState,
        repo.clone() as LedgerState,
        repo.clone() as DirectoryState,
        config,
    )
}

pub async fn seeded_with(config: AppConfig) -> Fixture {
    let repo = Arc::new(InMemoryRepository::new());
    seed_catalog(&repo);
    seed_edges(&repo).await;

    let teacher_user = Uuid::new_v4();
    let parent_user = Uuid::new_v4();
    let admin_user = Uuid::new_v4();
    let manager_user = Uuid::new_v4();
    let multi_role_user = Uuid::new_v4();
    let no_role_user = Uuid::new_v4();

    repo.assign_user_role(teacher_user, TEACHER).expect("assign");
    repo.assign_user_role(parent_user, PARENT).expect("assign");
    repo.assign_user_role(admin_user, ADMIN).expect("assign");
    repo.assign_user_role(manager_user, MANAGER).expect("assign");
    repo.assign_user_role(multi_role_user, TEACHER).expect("assign");
    repo.assign_user_role(multi_role_user, PARENT).expect("assign");

    let state = state_over(&repo, config);
    Fixture {
        repo,
        state,
        teacher_user,
        parent_user,
        admin_user,
        manager_user,
        multi_role_user,
        no_role_user,
    }
}

pub async fn seeded() -> Fixture {
    seeded_with(AppConfig::default()).await
}

pub fn codes(nodes: &[PermissionNode]) -> Vec<&str> {
    nodes.iter().map(|n| n.code.as_str()).collect()
}
