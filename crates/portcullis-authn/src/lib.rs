//! # Portcullis Authn
//!
//! The authentication framework: a registry of protocol-specific
//! strategies (API key, JWT, OIDC, AWS IAM, Kubernetes, LDAP, Jenkins), a
//! three-gate security validator run before any credential is inspected,
//! annotation-driven workload restriction matching, short-lived signed
//! token issuance, and a dispatcher that composes the whole pipeline with
//! an exactly-once audit trail.
//!
//! Strategies are wired at construction time through
//! [`registry::AuthenticatorRegistry`]; every collaborator is injected as a
//! trait object, so tests run against in-memory doubles without touching
//! the network.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Audit records and sinks
pub mod audit;
/// The end-to-end authentication pipeline
pub mod dispatcher;
/// Error taxonomy
pub mod error;
/// Request-scoped value objects
pub mod input;
/// JWKS fetching, parsing, and single-flight caching
pub mod jwks;
/// Metric recording helpers
pub mod metrics;
/// The strategy registry
pub mod registry;
/// Annotation-driven workload restrictions
pub mod restrictions;
/// The three-gate security validator
pub mod security;
/// Protocol-specific credential verifiers
pub mod strategies;
/// Signed token claims, wire format, and issuance
pub mod token;
/// Webservice identity and whitelist parsing
pub mod webservice;

pub use audit::{AuditRecord, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use dispatcher::Dispatcher;
pub use error::{AuthnError, Result};
pub use input::{AccessRequest, AuthenticatorInput};
pub use registry::{AuthenticatorKind, AuthenticatorRegistry};
pub use security::SecurityValidator;
pub use strategies::{Authenticator, VerifiedIdentity};
pub use token::{SignedToken, TokenClaims, TokenIssuer};
pub use webservice::{Webservice, Webservices};
