//! The authentication pipeline.
//!
//! `authenticate` composes the whole flow in strict order: resolve the
//! strategy from the registry, run the webservice security gates, check the
//! claimed identity's authorization, verify credentials, re-check
//! authorization when the strategy derived a different identity than the
//! caller claimed, then issue the token. The webservice gates always run
//! before the strategy touches the credential, so a disabled or undefined
//! instance never drives upstream calls. Any failure aborts the pipeline;
//! no partial token ever exists. Every attempt, success or failure,
//! produces exactly one audit record.

use std::{sync::Arc, time::Instant};

use portcullis_store::{PolicyStore, policy::role_id_from_login};

use crate::{
    audit::{AuditRecord, AuditSink, UNKNOWN_ROLE},
    error::Result,
    input::{AccessRequest, AuthenticatorInput},
    registry::AuthenticatorRegistry,
    security::SecurityValidator,
    token::{SignedToken, TokenIssuer},
    webservice::{Webservice, Webservices},
};

use portcullis_config::DEFAULT_AUTHENTICATOR_NAME;

/// Orchestrates registry, security gates, strategies, and token issuance.
pub struct Dispatcher {
    registry: AuthenticatorRegistry,
    security: SecurityValidator,
    issuer: TokenIssuer,
    audit: Arc<dyn AuditSink>,
    /// Raw whitelist string, `{type}/{service_id}` comma-separated
    enabled_authenticators: String,
}

impl Dispatcher {
    /// Wires the pipeline together. `enabled_authenticators` is the
    /// configured whitelist string; the built-in `authn` type is always
    /// appended.
    pub fn new(
        registry: AuthenticatorRegistry,
        policy: Arc<dyn PolicyStore>,
        issuer: TokenIssuer,
        audit: Arc<dyn AuditSink>,
        enabled_authenticators: &str,
    ) -> Self {
        Self {
            registry,
            security: SecurityValidator::new(policy),
            issuer,
            audit,
            enabled_authenticators: enabled_authenticators.to_string(),
        }
    }

    /// The whitelist in force for `account`. The default `authn` instance
    /// is always present, configured or not.
    fn whitelist(&self, account: &str) -> Result<Webservices> {
        let mut webservices = Webservices::from_string(account, &self.enabled_authenticators)?;
        let default = Webservice::new(account, DEFAULT_AUTHENTICATOR_NAME, None);
        if !webservices.contains(&default) {
            webservices.push(default);
        }
        Ok(webservices)
    }

    fn access_request(&self, input: &AuthenticatorInput) -> Result<AccessRequest> {
        Ok(AccessRequest {
            webservice: input.webservice(),
            whitelisted_webservices: self.whitelist(&input.account)?,
            user_id: input.username.clone(),
        })
    }

    async fn run_pipeline(&self, input: &AuthenticatorInput) -> Result<SignedToken> {
        let strategy = self.registry.resolve(&input.authenticator_name)?;

        // The webservice gates run before the strategy sees the credential,
        // whether or not an identity was claimed. The role gate needs an
        // identity: it runs up front for claimed ones and again below when
        // the strategy derived a different one.
        let claimed = self.access_request(input)?;
        self.security.validate_webservice(&claimed).await?;
        if !input.username.is_empty() {
            self.security.validate_role(&claimed).await?;
        }

        let identity = strategy.verify(input).await?;

        if identity.username != input.username {
            let derived = input.with_username(&identity.username);
            self.security.validate_role(&self.access_request(&derived)?).await?;
        }

        self.issuer.issue(&input.account, &identity.username).await
    }

    /// Runs one authentication attempt end to end.
    ///
    /// Exactly one audit record is emitted per call, carrying the full
    /// error detail on failure; the returned error only exposes
    /// [`crate::error::AuthnError::public_message`] to callers.
    pub async fn authenticate(&self, input: &AuthenticatorInput) -> Result<SignedToken> {
        let started = Instant::now();
        let result = self.run_pipeline(input).await;
        let duration = started.elapsed().as_secs_f64();

        let role_id = if input.username.is_empty() {
            UNKNOWN_ROLE.to_string()
        } else {
            role_id_from_login(&input.account, &input.username)
        };
        let record = match &result {
            Ok(token) => {
                let role_id = token
                    .claims_unverified()
                    .map(|claims| role_id_from_login(&input.account, &claims.sub))
                    .unwrap_or(role_id);
                AuditRecord::success(
                    &role_id,
                    &input.authenticator_name,
                    input.service_id.as_deref(),
                    &input.client_ip,
                )
            }
            Err(error) => AuditRecord::failure(
                &role_id,
                &input.authenticator_name,
                input.service_id.as_deref(),
                &input.client_ip,
                error,
            ),
        };
        self.audit.record(&record);
        crate::metrics::record_authn_attempt(&input.authenticator_name, result.is_ok(), duration);

        result
    }
}
