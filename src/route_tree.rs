use crate::{
    error::AppResult,
    models::{NodeType, PageActionsResponse, PageActionsSummary, PermissionNode, RouteNode},
    repository::CatalogState,
    resolver::ResolvedPermissionSet,
};
use std::collections::{BTreeMap, HashMap, HashSet};

/// build_tree
///
/// Links every node to its parent when the parent is part of `nodes` too. A node whose
/// parent is absent is dropped together with its subtree, never promoted to the root:
/// nobody sees a page or action whose containing module or page they cannot open.
/// Siblings are ordered by `sort_order`, then `id`.
pub fn build_tree(nodes: &[PermissionNode]) -> Vec<RouteNode> {
    let mut children: HashMap<i64, Vec<&PermissionNode>> = HashMap::new();
    let mut roots = Vec::new();
    for node in nodes {
        match node.parent_id {
            None => roots.push(node),
            Some(parent_id) => children.entry(parent_id).or_default().push(node),
        }
    }

    let mut visited = HashSet::new();
    attach(roots, &children, &mut visited)
}

fn attach(
    mut level: Vec<&PermissionNode>,
    children: &HashMap<i64, Vec<&PermissionNode>>,
    visited: &mut HashSet<i64>,
) -> Vec<RouteNode> {
    level.sort_by_key(|n| (n.sort_order, n.id));
    let mut out = Vec::with_capacity(level.len());
    for node in level {
        if !visited.insert(node.id) {
            continue;
        }
        let below = children.get(&node.id).cloned().unwrap_or_default();
        out.push(RouteNode {
            id: node.id,
            code: node.code.clone(),
            name: node.name.clone(),
            path: node.path.clone(),
            node_type: node.node_type,
            sort_order: node.sort_order,
            children: attach(below, children, visited),
        });
    }
    out
}

/// Navigation tree for one resolution.
pub fn build_resolved_tree(resolved: &ResolvedPermissionSet) -> Vec<RouteNode> {
    build_tree(&resolved.permissions)
}

/// collect_page_actions
///
/// Keeps the `action` nodes among `candidates` whose page is one of `pages` and that the
/// resolution grants. Unauthorized matches are dropped silently.
pub fn collect_page_actions(
    pages: &[PermissionNode],
    candidates: Vec<PermissionNode>,
    resolved: &ResolvedPermissionSet,
) -> PageActionsResponse {
    let page_codes: HashMap<i64, &str> = pages
        .iter()
        .filter(|p| p.node_type == NodeType::Page)
        .map(|p| (p.id, p.code.as_str()))
        .collect();
    let granted = resolved.ids();

    let mut permissions: Vec<PermissionNode> = candidates
        .into_iter()
        .filter(|n| n.node_type == NodeType::Action)
        .filter(|n| n.parent_id.is_some_and(|p| page_codes.contains_key(&p)))
        .filter(|n| granted.contains(&n.id))
        .collect();
    permissions.sort_by_key(|n| (n.sort_order, n.id));
    permissions.dedup_by_key(|n| n.id);

    let mut grouped: BTreeMap<String, Vec<PermissionNode>> = BTreeMap::new();
    for action in &permissions {
        if let Some(page_code) = action.parent_id.and_then(|p| page_codes.get(&p)) {
            grouped
                .entry((*page_code).to_string())
                .or_default()
                .push(action.clone());
        }
    }

    PageActionsResponse {
        summary: PageActionsSummary {
            total: permissions.len(),
            pages: page_codes.len(),
        },
        permissions,
        grouped,
    }
}

async fn actions_under(catalog: &CatalogState, pages: &[PermissionNode]) -> AppResult<Vec<PermissionNode>> {
    let mut actions = Vec::new();
    for page in pages {
        actions.extend(catalog.children_of(page.id).await?);
    }
    Ok(actions)
}

/// find_by_page_id
///
/// Granted actions of one page. An id that is unknown or not a page yields an empty result.
pub async fn find_by_page_id(
    catalog: &CatalogState,
    page_id: i64,
    resolved: &ResolvedPermissionSet,
) -> AppResult<PageActionsResponse> {
    let pages: Vec<PermissionNode> = catalog
        .get_by_id(page_id)
        .await?
        .filter(|n| n.node_type == NodeType::Page)
        .into_iter()
        .collect();
    let candidates = actions_under(catalog, &pages).await?;
    Ok(collect_page_actions(&pages, candidates, resolved))
}

/// find_by_page_path
///
/// Granted actions of every page whose path starts with `prefix`.
pub async fn find_by_page_path(
    catalog: &CatalogState,
    prefix: &str,
    resolved: &ResolvedPermissionSet,
) -> AppResult<PageActionsResponse> {
    let pages: Vec<PermissionNode> = catalog
        .find_by_path(prefix)
        .await?
        .into_iter()
        .filter(|n| n.node_type == NodeType::Page)
        .collect();
    let candidates = actions_under(catalog, &pages).await?;
    Ok(collect_page_actions(&pages, candidates, resolved))
}
