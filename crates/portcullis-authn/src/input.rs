//! Request-scoped value objects.
//!
//! [`AuthenticatorInput`] carries everything a strategy needs to verify one
//! authentication attempt. It is immutable: deriving a username from a
//! decoded credential produces a new copy via [`AuthenticatorInput::with_username`].

use crate::webservice::{Webservice, Webservices};

/// The credential bundle for one authentication attempt.
#[derive(Clone, Debug)]
pub struct AuthenticatorInput {
    /// Authenticator type, e.g. `authn-jwt`
    pub authenticator_name: String,
    /// Instance discriminator, if any
    pub service_id: Option<String>,
    /// Tenant account
    pub account: String,
    /// Claimed identity; may be empty until derived from the credential
    pub username: String,
    /// Raw credentials: request body or password, strategy-specific
    pub credentials: String,
    /// Source IP of the request
    pub client_ip: String,
    /// Extra request parameters (query/body fields) the strategy may need
    pub parameters: Vec<(String, String)>,
}

impl AuthenticatorInput {
    /// Returns a copy with the username replaced. Used when the identity is
    /// only known after decoding the credential.
    pub fn with_username(&self, username: &str) -> Self {
        Self { username: username.to_string(), ..self.clone() }
    }

    /// The webservice this input addresses.
    pub fn webservice(&self) -> Webservice {
        Webservice::new(&self.account, &self.authenticator_name, self.service_id.as_deref())
    }

    /// First parameter with the given name, if present.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Input to the security validator: the addressed webservice, the configured
/// whitelist, and the requesting identity. Transient, never persisted.
#[derive(Clone, Debug)]
pub struct AccessRequest {
    /// The webservice being used
    pub webservice: Webservice,
    /// The whitelist in force
    pub whitelisted_webservices: Webservices,
    /// The requesting identity (login form)
    pub user_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> AuthenticatorInput {
        AuthenticatorInput {
            authenticator_name: "authn-jwt".into(),
            service_id: Some("prod".into()),
            account: "cucumber".into(),
            username: String::new(),
            credentials: "jwt=abc".into(),
            client_ip: "10.0.0.5".into(),
            parameters: vec![("code".into(), "xyz".into())],
        }
    }

    #[test]
    fn test_with_username_is_a_copy() {
        let original = input();
        let derived = original.with_username("host/myapp");
        assert_eq!(derived.username, "host/myapp");
        assert_eq!(original.username, "");
        assert_eq!(derived.account, original.account);
    }

    #[test]
    fn test_webservice_projection() {
        let ws = input().webservice();
        assert_eq!(ws.resource_id(), "cucumber:webservice:conjur/authn-jwt/prod");
    }

    #[test]
    fn test_parameter_lookup() {
        let input = input();
        assert_eq!(input.parameter("code"), Some("xyz"));
        assert_eq!(input.parameter("state"), None);
    }
}
