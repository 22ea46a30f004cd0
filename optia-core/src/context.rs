use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The caller's role, resolved exactly once per request at the auth boundary.
/// Past that boundary no role-name strings are compared anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Unrestricted: any order, any branch.
    Admin,
    /// Sees only orders staged for dispatch, regardless of branch.
    Courier,
    /// Sees only orders belonging to this branch.
    BranchScoped(Uuid),
}

/// Authenticated caller context threaded explicitly through every core call.
///
/// The tenant id comes from the tenant resolver at the API boundary and is
/// trusted as an implicit filter on every entity the engine touches.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: Uuid,
    pub user_name: String,
    pub tenant_id: Uuid,
    /// The caller's home branch, recorded on audit events and new rows even
    /// for roles whose visibility is not branch-scoped.
    pub branch_id: Uuid,
    pub role: Role,
}

impl Role {
    /// Map a role claim to the closed variant. Unknown role names fall back
    /// to branch scoping, the most restrictive option.
    pub fn from_claim(role: &str, branch_id: Uuid) -> Self {
        match role {
            "Admin" => Role::Admin,
            "Courier" => Role::Courier,
            _ => Role::BranchScoped(branch_id),
        }
    }
}
