//! Webservice identity.
//!
//! A [`Webservice`] identifies one authenticator instance
//! (`account/authn-type/service-id`) and projects onto the policy resource
//! `{account}:webservice:conjur/{type}/{service_id}`. [`Webservices`] is the
//! configured whitelist of instances this server is allowed to run, parsed
//! from a comma-separated string.

use crate::error::{AuthnError, Result};

/// Immutable identity of one authenticator instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Webservice {
    account: String,
    authenticator_name: String,
    service_id: Option<String>,
}

impl Webservice {
    /// Creates a webservice identity. `service_id` is `None` for singleton
    /// authenticators such as the default `authn`.
    pub fn new(account: &str, authenticator_name: &str, service_id: Option<&str>) -> Self {
        Self {
            account: account.to_string(),
            authenticator_name: authenticator_name.to_string(),
            service_id: service_id.filter(|s| !s.is_empty()).map(str::to_string),
        }
    }

    /// Parses `authn-jwt/prod` (or bare `authn`) into a webservice under
    /// `account`.
    pub fn from_string(account: &str, entry: &str) -> Result<Self> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(AuthnError::InvalidWhitelistEntry(entry.to_string()));
        }
        match entry.split_once('/') {
            Some((name, service_id)) => {
                if name.is_empty() || service_id.is_empty() {
                    return Err(AuthnError::InvalidWhitelistEntry(entry.to_string()));
                }
                Ok(Self::new(account, name, Some(service_id)))
            }
            None => Ok(Self::new(account, entry, None)),
        }
    }

    /// The tenant account.
    pub fn account(&self) -> &str {
        &self.account
    }

    /// The authenticator type, e.g. `authn-jwt`.
    pub fn authenticator_name(&self) -> &str {
        &self.authenticator_name
    }

    /// The instance discriminator, if any.
    pub fn service_id(&self) -> Option<&str> {
        self.service_id.as_deref()
    }

    /// `{type}/{service_id}`, or just `{type}` for singletons.
    pub fn name(&self) -> String {
        match &self.service_id {
            Some(service_id) => format!("{}/{}", self.authenticator_name, service_id),
            None => self.authenticator_name.clone(),
        }
    }

    /// The policy resource id this webservice projects onto.
    pub fn resource_id(&self) -> String {
        format!("{}:webservice:conjur/{}", self.account, self.name())
    }

    /// The policy identifier of the webservice (without account/kind), used
    /// as the parent of its configuration variables.
    pub fn identifier(&self) -> String {
        format!("conjur/{}", self.name())
    }
}

/// The whitelist of authenticator instances enabled on this server.
#[derive(Clone, Debug, Default)]
pub struct Webservices {
    entries: Vec<Webservice>,
}

impl Webservices {
    /// Parses a comma-separated whitelist string (the
    /// `PORTCULLIS_AUTHENTICATORS` format). Empty segments are skipped; a
    /// malformed segment fails the whole parse.
    pub fn from_string(account: &str, whitelist: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for segment in whitelist.split(',') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            entries.push(Webservice::from_string(account, segment)?);
        }
        Ok(Self { entries })
    }

    /// Structural membership test.
    pub fn contains(&self, webservice: &Webservice) -> bool {
        self.entries.contains(webservice)
    }

    /// Appends an instance to the whitelist.
    pub fn push(&mut self, webservice: Webservice) {
        self.entries.push(webservice);
    }

    /// Number of whitelisted instances.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the whitelist is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over whitelisted instances.
    pub fn iter(&self) -> impl Iterator<Item = &Webservice> {
        self.entries.iter()
    }
}
