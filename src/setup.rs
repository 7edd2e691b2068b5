use crate::{
    assignment::AssignmentService,
    error::AppResult,
    models::SetupResponse,
    repository::{CatalogState, DirectoryState},
};
use std::collections::{BTreeMap, BTreeSet};

const CENTER_MODULES: [&str; 11] = [
    "DASHBOARD_CENTER",
    "PERSONNEL_CENTER",
    "ACTIVITY_CENTER",
    "ENROLLMENT_CENTER",
    "MARKETING_CENTER",
    "AI_CENTER",
    "SYSTEM_CENTER",
    "FINANCE_CENTER",
    "TASK_CENTER_CATEGORY",
    "CUSTOMER_POOL_CENTER",
    "ANALYTICS_CENTER",
];

const CENTER_PAGES: [&str; 6] = [
    "DASHBOARD_CENTER_PAGE",
    "PERSONNEL_CENTER_PAGE",
    "ACTIVITY_CENTER_PAGE",
    "ENROLLMENT_CENTER_PAGE",
    "MARKETING_CENTER_PAGE",
    "AI_CENTER_PAGE",
];

/// BootstrapPlan
///
/// Role code -> permission codes granted by the setup endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPlan(pub BTreeMap<String, Vec<String>>);

impl BootstrapPlan {
    fn owned(codes: impl IntoIterator<Item = &'static str>) -> Vec<String> {
        codes.into_iter().map(str::to_string).collect()
    }
}

impl Default for BootstrapPlan {
    fn default() -> Self {
        let admin = Self::owned(CENTER_MODULES.into_iter().chain(CENTER_PAGES));
        let principal = Self::owned(
            CENTER_MODULES
                .into_iter()
                .filter(|c| *c != "SYSTEM_CENTER")
                .chain(CENTER_PAGES),
        );
        let teacher = Self::owned([
            "DASHBOARD_CENTER",
            "PERSONNEL_CENTER",
            "ACTIVITY_CENTER",
            "ENROLLMENT_CENTER",
            "TASK_CENTER_CATEGORY",
            "ANALYTICS_CENTER",
            "DASHBOARD_CENTER_PAGE",
            "PERSONNEL_CENTER_PAGE",
            "ACTIVITY_CENTER_PAGE",
            "ENROLLMENT_CENTER_PAGE",
        ]);
        let parent = Self::owned([
            "ACTIVITY_CENTER",
            "ENROLLMENT_CENTER",
            "ACTIVITY_CENTER_PAGE",
            "ENROLLMENT_CENTER_PAGE",
        ]);

        Self(BTreeMap::from([
            ("admin".to_string(), admin),
            ("principal".to_string(), principal),
            ("teacher".to_string(), teacher),
            ("parent".to_string(), parent),
        ]))
    }
}

impl From<BTreeMap<String, Vec<String>>> for BootstrapPlan {
    fn from(mapping: BTreeMap<String, Vec<String>>) -> Self {
        Self(mapping)
    }
}

/// run_bootstrap
///
/// Grants the plan to every directory role whose code it names. Plan codes absent from
/// the catalog are reported in `missing_permissions`, plan roles absent from the directory
/// in `skipped_roles`. Each role is granted in its own ledger transaction.
pub async fn run_bootstrap(
    directory: &DirectoryState,
    catalog: &CatalogState,
    assignments: &AssignmentService,
    plan: &BootstrapPlan,
) -> AppResult<SetupResponse> {
    let roles = directory.list_roles().await?;
    let mut response = SetupResponse::default();
    let mut missing = BTreeSet::new();

    for role in &roles {
        let Some(codes) = plan.0.get(&role.code) else {
            continue;
        };

        let mut ids = Vec::new();
        let mut granted_codes = Vec::new();
        for code in codes {
            match catalog.get_by_code(code).await? {
                Some(node) => {
                    ids.push(node.id);
                    granted_codes.push(node.code);
                }
                None => {
                    missing.insert(code.clone());
                }
            }
        }

        if !ids.is_empty() {
            let outcome = assignments
                .assign_many(role.id, &ids, None, Some("bootstrap".to_string()))
                .await?;
            response.total_assigned += outcome.total_assigned;
        }
        response
            .role_permission_mapping
            .insert(role.code.clone(), granted_codes);
    }

    let known: BTreeSet<&str> = roles.iter().map(|r| r.code.as_str()).collect();
    response.skipped_roles = plan
        .0
        .keys()
        .filter(|code| !known.contains(code.as_str()))
        .cloned()
        .collect();
    response.missing_permissions = missing.into_iter().collect();

    tracing::info!(
        total_assigned = response.total_assigned,
        roles = response.role_permission_mapping.len(),
        missing = response.missing_permissions.len(),
        "role permission bootstrap finished"
    );
    Ok(response)
}
