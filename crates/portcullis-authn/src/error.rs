use portcullis_store::StorageError;
use thiserror::Error;

/// Authentication pipeline errors.
///
/// The taxonomy is closed at the crate boundary: upstream library and
/// transport errors are mapped into one of these kinds before they leave a
/// module. Callers outside the audit trail only ever see
/// [`AuthnError::public_message`], which is identical for every
/// authorization-class failure so that rejected attempts cannot be used to
/// enumerate valid identities.
#[derive(Debug, Error)]
pub enum AuthnError {
    // ========== Configuration errors ==========
    /// No authenticator with this name is registered
    #[error("'{0}' is not an available authenticator")]
    AuthenticatorNotRegistered(String),

    /// The webservice is not in the configured whitelist
    #[error("'{0}' is not enabled in the authenticator whitelist")]
    NotWhitelisted(String),

    /// The webservice resource does not exist in policy
    #[error("webservice '{0}' is not defined in policy")]
    ServiceNotDefined(String),

    /// A required authenticator variable is declared but has no value, or is
    /// missing entirely
    #[error("authenticator configuration variable '{0}' is missing or empty")]
    MissingConfigurationVariable(String),

    /// The configured whitelist string could not be parsed
    #[error("invalid authenticator whitelist entry: '{0}'")]
    InvalidWhitelistEntry(String),

    // ========== Authorization errors ==========
    /// The role does not exist or lacks the `authenticate` privilege.
    /// Deliberately a single kind for both conditions.
    #[error("'{0}' is not authorized to authenticate")]
    RoleNotAuthorized(String),

    /// No role matched the verified identity
    #[error("no role found for identity '{0}'")]
    RoleNotFound(String),

    /// More than one role matched the verified identity
    #[error("identity '{0}' matched {1} roles; ambiguous matches are rejected")]
    MultipleRoleMatches(String, usize),

    /// A resource restriction did not match the request
    #[error("resource restriction '{0}' does not match the request")]
    InvalidResourceRestriction(String),

    /// A restriction annotation is declared with an empty value
    #[error("annotation '{0}' is declared but empty")]
    EmptyAnnotation(String),

    /// The verified credential does not carry the attribute a restriction
    /// names
    #[error("credential is missing attribute '{0}' required by a restriction")]
    MissingRestrictionAttribute(String),

    /// The restriction set violates the authenticator's constraints
    #[error("restriction set is not acceptable: {0}")]
    ConstraintViolation(String),

    // ========== Credential verification errors ==========
    /// Credentials are malformed or fail verification
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Malformed token or request body
    #[error("invalid token format: {0}")]
    InvalidTokenFormat(String),

    /// Token has expired
    #[error("token expired")]
    TokenExpired,

    /// Token not yet valid
    #[error("token not yet valid")]
    TokenNotYetValid,

    /// Token issued-at exceeds the maximum accepted age
    #[error("token too old")]
    TokenTooOld,

    /// Signature verification failed
    #[error("invalid signature")]
    InvalidSignature,

    /// Issuer is not the configured one
    #[error("invalid issuer: {0}")]
    InvalidIssuer(String),

    /// Audience is not the configured one
    #[error("invalid audience: {0}")]
    InvalidAudience(String),

    /// A required claim is missing from the credential
    #[error("missing claim: {0}")]
    MissingClaim(String),

    /// Algorithm is not in the accepted list
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// JWKS fetch or parse failure
    #[error("JWKS error: {0}")]
    JwksError(String),

    /// No key in the key set matches the token's `kid`, even after a forced
    /// refresh
    #[error("signing key '{0}' not found in key set")]
    KeyNotFound(String),

    /// OIDC `state` did not match a pending authorization
    #[error("authorization state mismatch")]
    StateMismatch,

    /// OIDC `nonce` did not match the pending authorization
    #[error("authorization nonce mismatch")]
    NonceMismatch,

    /// OIDC provider discovery failed
    #[error("OIDC discovery failed: {0}")]
    OidcDiscoveryFailed(String),

    /// The Jenkins build named by the request is not currently running
    #[error("job '{0}' has no running build #{1}")]
    RunningJobNotFound(String, u64),

    /// A required region could not be extracted from the signed request
    #[error("failed to extract region from signed request headers")]
    MissingRegion,

    /// The identity service rejected the replayed signed request
    #[error("signed request verification failed: {0}")]
    SignedRequestRejected(String),

    /// Kubernetes pod resolution failed: zero or multiple pods matched
    #[error("expected exactly one pod for IP {0}, found {1}")]
    PodResolutionFailed(String, usize),

    /// Certificate issuance for this identity is already in flight
    #[error("certificate issuance already in progress for '{0}'")]
    CertIssuanceInProgress(String),

    /// Certificate issuance or installation failed
    #[error("certificate error: {0}")]
    CertificateError(String),

    // ========== Transport / infrastructure ==========
    /// Network failure talking to an external verifier, wrapped so the
    /// taxonomy stays closed
    #[error("verification request failed: {0}")]
    VerificationError(String),

    /// Policy or key storage failure
    #[error("storage error: {0}")]
    StorageFailure(String),

    // ========== Fatal ==========
    /// The account has no signing key; unrecoverable for that account
    #[error("no signing key provisioned for account '{0}'")]
    MissingSigningKey(String),
}

impl AuthnError {
    /// Short machine-readable label for audit records and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthnError::AuthenticatorNotRegistered(_) => "authenticator_not_registered",
            AuthnError::NotWhitelisted(_) => "not_whitelisted",
            AuthnError::ServiceNotDefined(_) => "service_not_defined",
            AuthnError::MissingConfigurationVariable(_) => "missing_configuration_variable",
            AuthnError::InvalidWhitelistEntry(_) => "invalid_whitelist_entry",
            AuthnError::RoleNotAuthorized(_) => "role_not_authorized",
            AuthnError::RoleNotFound(_) => "role_not_found",
            AuthnError::MultipleRoleMatches(_, _) => "multiple_role_matches",
            AuthnError::InvalidResourceRestriction(_) => "invalid_resource_restriction",
            AuthnError::EmptyAnnotation(_) => "empty_annotation",
            AuthnError::MissingRestrictionAttribute(_) => "missing_restriction_attribute",
            AuthnError::ConstraintViolation(_) => "constraint_violation",
            AuthnError::InvalidCredentials => "invalid_credentials",
            AuthnError::InvalidTokenFormat(_) => "invalid_token_format",
            AuthnError::TokenExpired => "token_expired",
            AuthnError::TokenNotYetValid => "token_not_yet_valid",
            AuthnError::TokenTooOld => "token_too_old",
            AuthnError::InvalidSignature => "invalid_signature",
            AuthnError::InvalidIssuer(_) => "invalid_issuer",
            AuthnError::InvalidAudience(_) => "invalid_audience",
            AuthnError::MissingClaim(_) => "missing_claim",
            AuthnError::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            AuthnError::JwksError(_) => "jwks_error",
            AuthnError::KeyNotFound(_) => "key_not_found",
            AuthnError::StateMismatch => "state_mismatch",
            AuthnError::NonceMismatch => "nonce_mismatch",
            AuthnError::OidcDiscoveryFailed(_) => "oidc_discovery_failed",
            AuthnError::RunningJobNotFound(_, _) => "running_job_not_found",
            AuthnError::MissingRegion => "missing_region",
            AuthnError::SignedRequestRejected(_) => "signed_request_rejected",
            AuthnError::PodResolutionFailed(_, _) => "pod_resolution_failed",
            AuthnError::CertIssuanceInProgress(_) => "cert_issuance_in_progress",
            AuthnError::CertificateError(_) => "certificate_error",
            AuthnError::VerificationError(_) => "verification_error",
            AuthnError::StorageFailure(_) => "storage_failure",
            AuthnError::MissingSigningKey(_) => "missing_signing_key",
        }
    }

    /// The message safe to return to the caller.
    ///
    /// Every failure that could distinguish "role does not exist" from
    /// "wrong credentials" from "authenticator disabled" collapses to the
    /// same generic string; the full detail is only written to the audit
    /// trail. Fatal signing-key failures keep their message since they
    /// indicate an operator problem, not a credential problem.
    pub fn public_message(&self) -> &'static str {
        match self {
            AuthnError::MissingSigningKey(_) => "signing key unavailable",
            AuthnError::CertIssuanceInProgress(_) => "temporarily unavailable, retry later",
            _ => "authentication failed",
        }
    }

    /// Whether the error maps to a retry-later (`503`-class) outcome rather
    /// than a plain rejection.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, AuthnError::CertIssuanceInProgress(_))
    }
}

impl From<jsonwebtoken::errors::Error> for AuthnError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidToken => AuthnError::InvalidTokenFormat("invalid JWT structure".into()),
            ErrorKind::InvalidSignature => AuthnError::InvalidSignature,
            ErrorKind::ExpiredSignature => AuthnError::TokenExpired,
            ErrorKind::ImmatureSignature => AuthnError::TokenNotYetValid,
            ErrorKind::InvalidAudience => {
                AuthnError::InvalidAudience("audience validation failed".into())
            }
            ErrorKind::InvalidIssuer => AuthnError::InvalidIssuer("issuer validation failed".into()),
            ErrorKind::InvalidAlgorithm => {
                AuthnError::UnsupportedAlgorithm("algorithm not accepted".into())
            }
            _ => AuthnError::InvalidTokenFormat(format!("JWT error: {}", err)),
        }
    }
}

impl From<StorageError> for AuthnError {
    fn from(err: StorageError) -> Self {
        AuthnError::StorageFailure(err.to_string())
    }
}

impl From<reqwest::Error> for AuthnError {
    fn from(err: reqwest::Error) -> Self {
        // Transport failures never propagate raw; the taxonomy stays closed.
        AuthnError::VerificationError(err.to_string())
    }
}

/// Result type alias for authentication operations
pub type Result<T> = std::result::Result<T, AuthnError>;
