/// Router Module Index
///
/// Splits the routes by the access check they need. Layers are applied per module in
/// `create_router`, so a route cannot end up exposed by being registered in the wrong place.

/// Routes reachable without authentication.
pub mod public;

/// Routes behind the `AuthUser` extractor middleware.
pub mod authenticated;

/// Routes that also require an administrative permission code.
pub mod admin;
