//! In-memory store implementations.
//!
//! Used by tests and by single-node deployments that load their policy tree
//! at startup. All state lives behind `std::sync::RwLock`; reads vastly
//! outnumber writes and no lock is held across an await point.

use std::{
    collections::{HashMap, HashSet},
    sync::RwLock,
};

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use rand_core::OsRng;

use crate::{
    error::StorageError,
    policy::{Annotation, PolicyStore, Resource, Role},
    signing::{SigningKeyPair, SigningKeyStore},
};

#[derive(Default)]
struct PolicyState {
    resources: HashSet<String>,
    roles: HashSet<String>,
    /// (role_id, privilege, resource_id)
    permissions: HashSet<(String, String, String)>,
    annotations: HashMap<String, Vec<Annotation>>,
    /// full variable resource id -> secret value
    secrets: HashMap<String, String>,
}

/// In-memory [`PolicyStore`].
#[derive(Default)]
pub struct MemoryPolicyStore {
    state: RwLock<PolicyState>,
}

impl MemoryPolicyStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PolicyState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PolicyState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a resource by fully qualified id.
    pub fn add_resource(&self, resource_id: &str) {
        self.write().resources.insert(resource_id.to_string());
    }

    /// Adds a role by fully qualified id.
    pub fn add_role(&self, role_id: &str) {
        self.write().roles.insert(role_id.to_string());
    }

    /// Grants `privilege` on `resource_id` to `role_id`.
    pub fn permit(&self, role_id: &str, privilege: &str, resource_id: &str) {
        self.write().permissions.insert((
            role_id.to_string(),
            privilege.to_string(),
            resource_id.to_string(),
        ));
    }

    /// Attaches an annotation to a resource.
    pub fn annotate(&self, resource_id: &str, name: &str, value: &str) {
        self.write()
            .annotations
            .entry(resource_id.to_string())
            .or_default()
            .push(Annotation { name: name.to_string(), value: value.to_string() });
    }

    /// Sets the secret value of the variable `{parent_identifier}/{name}`.
    pub fn set_secret(&self, account: &str, parent_identifier: &str, name: &str, value: &str) {
        let variable_id = format!("{}:variable:{}/{}", account, parent_identifier, name);
        self.write().secrets.insert(variable_id, value.to_string());
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn resource(&self, resource_id: &str) -> Result<Option<Resource>, StorageError> {
        let state = self.read();
        Ok(state
            .resources
            .contains(resource_id)
            .then(|| Resource { resource_id: resource_id.to_string() }))
    }

    async fn role(&self, role_id: &str) -> Result<Option<Role>, StorageError> {
        let state = self.read();
        Ok(state.roles.contains(role_id).then(|| Role { role_id: role_id.to_string() }))
    }

    async fn role_allowed_to(
        &self,
        role_id: &str,
        privilege: &str,
        resource_id: &str,
    ) -> Result<bool, StorageError> {
        let state = self.read();
        Ok(state.permissions.contains(&(
            role_id.to_string(),
            privilege.to_string(),
            resource_id.to_string(),
        )))
    }

    async fn annotations(&self, resource_id: &str) -> Result<Vec<Annotation>, StorageError> {
        let state = self.read();
        Ok(state.annotations.get(resource_id).cloned().unwrap_or_default())
    }

    async fn secret(
        &self,
        account: &str,
        parent_identifier: &str,
        name: &str,
    ) -> Result<Option<String>, StorageError> {
        let variable_id = format!("{}:variable:{}/{}", account, parent_identifier, name);
        let state = self.read();
        Ok(state.secrets.get(&variable_id).cloned())
    }

    async fn find_hosts_by_identifier(
        &self,
        account: &str,
        identifier: &str,
    ) -> Result<Vec<Role>, StorageError> {
        let prefix = format!("{}:host:", account);
        let suffix = format!("/{}", identifier);
        let state = self.read();
        let mut matches: Vec<Role> = state
            .roles
            .iter()
            .filter(|role_id| {
                role_id.strip_prefix(&prefix).is_some_and(|host_id| {
                    host_id == identifier || host_id.ends_with(&suffix)
                })
            })
            .map(|role_id| Role { role_id: role_id.clone() })
            .collect();
        matches.sort_by(|a, b| a.role_id.cmp(&b.role_id));
        Ok(matches)
    }
}

/// In-memory [`SigningKeyStore`].
#[derive(Default)]
pub struct MemorySigningKeyStore {
    keys: RwLock<HashMap<String, SigningKeyPair>>,
}

impl MemorySigningKeyStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates and registers a fresh key pair for `account`, returning a
    /// copy of it.
    pub fn provision(&self, account: &str) -> SigningKeyPair {
        let key = SigningKey::generate(&mut OsRng);
        let pair = SigningKeyPair::from_secret_bytes(account, key.to_bytes());
        self.keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(account.to_string(), pair.clone());
        pair
    }
}

#[async_trait]
impl SigningKeyStore for MemorySigningKeyStore {
    async fn signing_key(&self, account: &str) -> Result<Option<SigningKeyPair>, StorageError> {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        Ok(keys.get(account).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resource_lookup() {
        let store = MemoryPolicyStore::new();
        store.add_resource("cucumber:webservice:conjur/authn-jwt/prod");

        let found = store.resource("cucumber:webservice:conjur/authn-jwt/prod").await.unwrap();
        assert!(found.is_some());

        let missing = store.resource("cucumber:webservice:conjur/authn-jwt/staging").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_permission_check() {
        let store = MemoryPolicyStore::new();
        store.add_role("cucumber:user:alice");
        store.add_resource("cucumber:webservice:conjur/authn-jwt/prod");
        store.permit("cucumber:user:alice", "authenticate", "cucumber:webservice:conjur/authn-jwt/prod");

        assert!(store
            .role_allowed_to(
                "cucumber:user:alice",
                "authenticate",
                "cucumber:webservice:conjur/authn-jwt/prod"
            )
            .await
            .unwrap());
        assert!(!store
            .role_allowed_to(
                "cucumber:user:bob",
                "authenticate",
                "cucumber:webservice:conjur/authn-jwt/prod"
            )
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_secret_lookup() {
        let store = MemoryPolicyStore::new();
        store.set_secret("cucumber", "conjur/authn-jwt/prod", "issuer", "https://idp.example.com");

        let value = store.secret("cucumber", "conjur/authn-jwt/prod", "issuer").await.unwrap();
        assert_eq!(value.as_deref(), Some("https://idp.example.com"));

        let missing = store.secret("cucumber", "conjur/authn-jwt/prod", "audience").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_find_hosts_exact_and_suffix() {
        let store = MemoryPolicyStore::new();
        store.add_role("cucumber:host:myapp");
        store.add_role("cucumber:host:staging/myapp");
        store.add_role("cucumber:host:other");
        store.add_role("other-account:host:myapp");

        let matches = store.find_hosts_by_identifier("cucumber", "myapp").await.unwrap();
        let ids: Vec<&str> = matches.iter().map(|r| r.role_id.as_str()).collect();
        assert_eq!(ids, vec!["cucumber:host:myapp", "cucumber:host:staging/myapp"]);
    }

    #[tokio::test]
    async fn test_signing_key_provisioning() {
        let store = MemorySigningKeyStore::new();
        assert!(store.signing_key("cucumber").await.unwrap().is_none());

        let pair = store.provision("cucumber");
        let fetched = store.signing_key("cucumber").await.unwrap().expect("key");
        assert_eq!(fetched.fingerprint, pair.fingerprint);
    }
}
