//! Policy store interface.
//!
//! The policy tree is owned by the (external) policy engine; the
//! authentication pipeline only ever reads from it. Identifiers follow the
//! `{account}:{kind}:{identifier}` convention, e.g.
//! `cucumber:webservice:conjur/authn-jwt/prod` or `cucumber:host:myapp/api`.

use async_trait::async_trait;

use crate::error::StorageError;

/// A single `name=value` annotation attached to a resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Annotation {
    /// Annotation name, e.g. `authn-jwt/prod/project-id`
    pub name: String,
    /// Annotation value
    pub value: String,
}

/// A policy resource (webservice, variable, host, ...).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resource {
    /// Fully qualified resource id: `{account}:{kind}:{identifier}`
    pub resource_id: String,
}

impl Resource {
    /// The account segment of the resource id.
    pub fn account(&self) -> &str {
        self.resource_id.split(':').next().unwrap_or_default()
    }

    /// The identifier segment (everything after the second colon).
    pub fn identifier(&self) -> &str {
        self.resource_id.splitn(3, ':').nth(2).unwrap_or_default()
    }
}

/// A policy role (user or host).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Role {
    /// Fully qualified role id: `{account}:{kind}:{identifier}`
    pub role_id: String,
}

impl Role {
    /// The account segment of the role id.
    pub fn account(&self) -> &str {
        self.role_id.split(':').next().unwrap_or_default()
    }

    /// The kind segment (`user` or `host`).
    pub fn kind(&self) -> &str {
        self.role_id.splitn(3, ':').nth(1).unwrap_or_default()
    }

    /// The identifier segment (everything after the second colon).
    pub fn identifier(&self) -> &str {
        self.role_id.splitn(3, ':').nth(2).unwrap_or_default()
    }

    /// The login form of the role: `host/{identifier}` for hosts, bare
    /// identifier for users.
    pub fn login(&self) -> String {
        match self.kind() {
            "user" => self.identifier().to_string(),
            kind => format!("{}/{}", kind, self.identifier()),
        }
    }
}

/// Derive a fully qualified role id from an account and a login name.
///
/// Logins of the form `host/{id}` map to `{account}:host:{id}`; anything else
/// maps to `{account}:user:{login}`.
pub fn role_id_from_login(account: &str, login: &str) -> String {
    match login.strip_prefix("host/") {
        Some(host_id) => format!("{}:host:{}", account, host_id),
        None => format!("{}:user:{}", account, login),
    }
}

/// Read-only view of the policy tree.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Look up a resource by fully qualified id. `Ok(None)` means the
    /// resource does not exist in policy.
    async fn resource(&self, resource_id: &str) -> Result<Option<Resource>, StorageError>;

    /// Look up a role by fully qualified id.
    async fn role(&self, role_id: &str) -> Result<Option<Role>, StorageError>;

    /// Whether `role_id` holds `privilege` on `resource_id`.
    async fn role_allowed_to(
        &self,
        role_id: &str,
        privilege: &str,
        resource_id: &str,
    ) -> Result<bool, StorageError>;

    /// All annotations attached to a resource. Empty when the resource has
    /// none or does not exist.
    async fn annotations(&self, resource_id: &str) -> Result<Vec<Annotation>, StorageError>;

    /// Value of the secret variable `{parent_identifier}/{name}` under the
    /// given account, or `Ok(None)` when the variable is absent.
    async fn secret(
        &self,
        account: &str,
        parent_identifier: &str,
        name: &str,
    ) -> Result<Option<String>, StorageError>;

    /// All host roles in `account` whose identifier equals `identifier` or
    /// ends with `/{identifier}`. Ambiguity is the caller's problem: more
    /// than one match must be treated as a hard failure upstream.
    async fn find_hosts_by_identifier(
        &self,
        account: &str,
        identifier: &str,
    ) -> Result<Vec<Role>, StorageError>;
}
