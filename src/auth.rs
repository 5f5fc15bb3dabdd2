//! Authentication seam (§6.1).
//!
//! Token verification itself is explicitly out of scope (§1): the core only
//! ever consumes the `(userId, role)` pair a verifier hands back. This module
//! defines that seam plus a development-only verifier so the binary is
//! runnable end-to-end without a real identity provider.

/// A connection's role, as handed back by an [`AuthVerifier`] (§6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    User,
    Viewer,
}

/// The identity attached to a hub connection. Both fields are `None` for an
/// anonymous (no-token) connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    pub user_id: Option<String>,
    pub role: Option<Role>,
}

impl Identity {
    pub const fn anonymous() -> Self {
        Self { user_id: None, role: None }
    }
}

/// Result of verifying a handshake token (§6.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// No token was presented; connection proceeds anonymously.
    Anonymous,
    /// Token verified; carries the resolved identity.
    Authenticated(Identity),
    /// Token was presented but failed verification; handshake must be
    /// rejected with HTTP 401 before the upgrade completes.
    Invalid,
}

/// External collaborator that turns a handshake token into an [`AuthOutcome`]
/// (§1, §6.1). The core never verifies tokens itself.
pub trait AuthVerifier: Send + Sync {
    fn verify(&self, token: Option<&str>) -> AuthOutcome;
}

/// Development/test verifier: any non-empty token is accepted as-is, with the
/// token string itself as `userId`; a `admin:`-prefixed token is granted the
/// `admin` role, everything else `user`. Never wire this into a real
/// deployment — it performs no actual verification.
#[derive(Debug, Clone, Copy, Default)]
pub struct DevAuthVerifier;

impl AuthVerifier for DevAuthVerifier {
    fn verify(&self, token: Option<&str>) -> AuthOutcome {
        match token {
            None => AuthOutcome::Anonymous,
            Some(t) if t.is_empty() => AuthOutcome::Anonymous,
            Some(t) if t.starts_with("admin:") => {
                AuthOutcome::Authenticated(Identity { user_id: Some(t.to_string()), role: Some(Role::Admin) })
            }
            Some(t) => AuthOutcome::Authenticated(Identity { user_id: Some(t.to_string()), role: Some(Role::User) }),
        }
    }
}
