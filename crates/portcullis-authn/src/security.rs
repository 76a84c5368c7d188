//! The three-gate security check.
//!
//! Runs before any credential is inspected, in fixed order, failing fast:
//!
//! 1. whitelist membership of the addressed webservice,
//! 2. existence of the webservice resource in policy,
//! 3. the requesting role holds `authenticate` on the webservice.
//!
//! Gates 1 and 2 need no identity and are exposed separately for strategies
//! that only learn who is calling from the credential itself; gate 3 then
//! runs once the identity is known. Gate 3 raises the same error whether the
//! role is missing or merely lacks the privilege; distinguishing the two
//! would let callers enumerate valid usernames.

use std::sync::Arc;

use portcullis_store::{PolicyStore, policy::role_id_from_login};

use crate::{
    error::{AuthnError, Result},
    input::AccessRequest,
};

/// The privilege a role must hold on a webservice to use it.
pub const AUTHENTICATE_PRIVILEGE: &str = "authenticate";

/// Enforces the whitelist, service-existence, and role-authorization gates.
pub struct SecurityValidator {
    policy: Arc<dyn PolicyStore>,
}

impl SecurityValidator {
    /// Creates a validator reading from the given policy store.
    pub fn new(policy: Arc<dyn PolicyStore>) -> Self {
        Self { policy }
    }

    /// Runs all three gates. Returns on the first failure; later gates are
    /// never evaluated once an earlier one has failed.
    pub async fn validate(&self, access_request: &AccessRequest) -> Result<()> {
        self.validate_webservice(access_request).await?;
        self.validate_role(access_request).await
    }

    /// Gates 1 and 2: the addressed webservice is whitelisted and defined
    /// in policy. Ignores `user_id`, so it can run before any identity is
    /// known.
    pub async fn validate_webservice(&self, access_request: &AccessRequest) -> Result<()> {
        let webservice = &access_request.webservice;

        // Gate 1: whitelist membership. No I/O.
        if !access_request.whitelisted_webservices.contains(webservice) {
            return Err(AuthnError::NotWhitelisted(webservice.name()));
        }

        // Gate 2: the webservice must exist in policy.
        if self.policy.resource(&webservice.resource_id()).await?.is_none() {
            return Err(AuthnError::ServiceNotDefined(webservice.name()));
        }
        Ok(())
    }

    /// Gate 3: the requesting role exists and holds `authenticate` on the
    /// webservice. Both failure modes produce the identical error.
    pub async fn validate_role(&self, access_request: &AccessRequest) -> Result<()> {
        let webservice = &access_request.webservice;
        let resource_id = webservice.resource_id();
        let role_id = role_id_from_login(webservice.account(), &access_request.user_id);
        let authorized = match self.policy.role(&role_id).await? {
            Some(role) => {
                self.policy
                    .role_allowed_to(&role.role_id, AUTHENTICATE_PRIVILEGE, &resource_id)
                    .await?
            }
            None => false,
        };
        if !authorized {
            return Err(AuthnError::RoleNotAuthorized(access_request.user_id.clone()));
        }

        tracing::debug!(
            webservice = %webservice.name(),
            user_id = %access_request.user_id,
            "Security validation passed"
        );
        Ok(())
    }
}
