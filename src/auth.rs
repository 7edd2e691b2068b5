use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use jsonwebtoken::{DecodingKey, Validation, decode, errors::ErrorKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    cache::ResolutionCache,
    config::{AppConfig, Env},
    error::{AppError, AppResult},
    resolver::ResolvedPermissionSet,
};

/// Grants catalog administration, the setup bootstrap, cache control and the full route tree.
pub const PERMISSION_MANAGE: &str = "PERMISSION_MANAGE";
/// Grants the role-permission assignment endpoints.
pub const ROLE_PERMISSION_MANAGE: &str = "ROLE_PERMISSION_MANAGE";

/// Claims
///
/// Payload expected inside the bearer JWT. Signed with the service secret and checked on
/// every authenticated request.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (sub): the user id the role directory knows the user by.
    pub sub: Uuid,
    /// Expiration time. Tokens past it are rejected.
    pub exp: usize,
    /// Issued at.
    pub iat: usize,
}

/// AuthUser
///
/// The verified identity of a request. Role membership is not carried here: it is
/// resolved (and cached) per request through the `ResolutionCache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub id: Uuid,
}

/// AuthUser Extractor Implementation
///
/// Resolution order:
/// 1. Local bypass: in `Env::Local` a valid UUID in `x-user-id` is accepted as is.
/// 2. Bearer token: `Authorization: Bearer <jwt>`, HS256, `exp` enforced.
///
/// Rejection: `AppError::Unauthenticated` (401) on any failure.
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    AppConfig: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let config = AppConfig::from_ref(state);

        if config.env == Env::Local {
            let bypass = parts
                .headers
                .get("x-user-id")
                .and_then(|value| value.to_str().ok())
                .and_then(|raw| Uuid::parse_str(raw).ok());
            if let Some(id) = bypass {
                return Ok(AuthUser { id });
            }
        }

        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(AppError::Unauthenticated)?;

        let claims = decode_token(token, &config.jwt_secret)?;
        Ok(AuthUser { id: claims.sub })
    }
}

/// Decodes and validates a bearer token against `secret`.
pub fn decode_token(token: &str, secret: &str) -> AppResult<Claims> {
    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    let mut validation = Validation::default();
    validation.validate_exp = true;

    match decode::<Claims>(token, &decoding_key, &validation) {
        Ok(data) => Ok(data.claims),
        Err(e) => {
            match e.kind() {
                ErrorKind::ExpiredSignature => tracing::debug!("rejected expired token"),
                other => tracing::debug!(?other, "rejected invalid token"),
            }
            Err(AppError::Unauthenticated)
        }
    }
}

/// require_permission
///
/// Resolves the caller through the cache and checks that they hold `code`. Superusers
/// always pass. Returns the resolution so the handler can reuse it.
pub async fn require_permission(
    cache: &ResolutionCache,
    user: &AuthUser,
    code: &str,
) -> AppResult<Arc<ResolvedPermissionSet>> {
    let lookup = cache.get(user.id).await?;
    let resolved = lookup.resolution;
    if resolved.is_superuser || resolved.contains_code(code) {
        Ok(resolved)
    } else {
        tracing::warn!(user_id = %user.id, code, "permission denied");
        Err(AppError::Forbidden(code.to_string()))
    }
}
