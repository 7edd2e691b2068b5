use crate::{
    error::{AppError, AppResult},
    models::{BatchCheckResponse, BatchSummary, CheckPermissionResponse},
    resolver::ResolvedPermissionSet,
};
use std::collections::BTreeMap;

/// check_batch
///
/// Answers every distinct requested code against one resolution. Codes are matched
/// exactly; anything unknown or not granted is `false`. An empty request is rejected.
pub fn check_batch(
    resolved: &ResolvedPermissionSet,
    codes: &[String],
) -> AppResult<BatchCheckResponse> {
    if codes.is_empty() {
        return Err(AppError::Validation(
            "permissions must be a non-empty list".into(),
        ));
    }

    let granted = resolved.codes();
    let results: BTreeMap<String, bool> = codes
        .iter()
        .map(|code| (code.clone(), granted.contains(code.as_str())))
        .collect();
    let allowed = results.values().filter(|g| **g).count();

    Ok(BatchCheckResponse {
        summary: BatchSummary {
            total: results.len(),
            granted: allowed,
            denied: results.len() - allowed,
        },
        results,
    })
}

/// Single-code check.
pub fn check_one(resolved: &ResolvedPermissionSet, code: &str) -> CheckPermissionResponse {
    CheckPermissionResponse {
        permission: code.to_string(),
        granted: resolved.contains_code(code),
    }
}
