use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use optia_core::{Caller, CoreError, Role};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

// ============================================================================
// JWT Claims
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: Uuid,
    pub name: String,
    pub role: String,
    pub tenant_id: Option<Uuid>,
    pub branch_id: Option<Uuid>,
    pub exp: usize,
}

/// Sign a token for the given claims. Used by the operator tooling that
/// provisions service accounts, and by the API tests.
pub fn issue_token(secret: &str, claims: &Claims) -> Result<String, jsonwebtoken::errors::Error> {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

// ============================================================================
// Authentication Middleware
// ============================================================================

/// Resolve the caller once at the boundary and inject it into request
/// extensions. A token without a resolvable tenant is treated as
/// unauthenticated; one without a branch claim is authenticated but cannot
/// be given any visibility scope, so it is rejected as forbidden.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    // 1. Extract token from Authorization header
    let auth_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or(AppError(CoreError::Unauthenticated))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(AppError(CoreError::Unauthenticated))?;

    // 2. Decode and validate JWT
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.auth.secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AppError(CoreError::Unauthenticated))?;
    let claims = token_data.claims;

    // 3. Tenant and branch must both be resolvable
    let tenant_id = claims
        .tenant_id
        .ok_or(AppError(CoreError::Unauthenticated))?;
    let branch_id = claims.branch_id.ok_or(AppError(CoreError::Forbidden))?;

    // 4. Inject the resolved caller; no role strings past this point
    let caller = Caller {
        user_id: claims.sub,
        user_name: claims.name.clone(),
        tenant_id,
        branch_id,
        role: Role::from_claim(&claims.role, branch_id),
    };
    req.extensions_mut().insert(caller);

    Ok(next.run(req).await)
}
