//! Authentication seam.
//!
//! Modules do NOT depend on any specific credential scheme. They only know
//! this trait; the concrete implementation (JWT in the server binary) is
//! injected at startup time.

use axum::http::HeaderMap;

use crate::ServiceError;

/// The authenticated caller. Every task query and mutation is scoped to
/// `owner_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub owner_id: String,
}

/// Pluggable authenticator, called once per request before any
/// classification or storage access.
pub trait Authenticator: Send + Sync + 'static {
    /// Resolve the request headers to a principal, or fail with
    /// [`ServiceError::Unauthorized`].
    fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, ServiceError>;
}

/// An authenticator that denies everything. Used for testing.
pub struct DenyAll;

impl Authenticator for DenyAll {
    fn authenticate(&self, _headers: &HeaderMap) -> Result<Principal, ServiceError> {
        Err(ServiceError::Unauthorized("access denied".into()))
    }
}

/// Treats every request as coming from a single fixed owner.
/// Used for local tooling and tests.
pub struct FixedOwner(pub String);

impl Authenticator for FixedOwner {
    fn authenticate(&self, _headers: &HeaderMap) -> Result<Principal, ServiceError> {
        Ok(Principal {
            owner_id: self.0.clone(),
        })
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
