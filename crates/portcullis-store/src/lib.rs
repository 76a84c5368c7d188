//! # Portcullis Store
//!
//! Narrow interfaces onto the durable collaborators the authentication
//! pipeline depends on: the policy store (resources, roles, annotations,
//! permission checks, secret values) and the per-account token signing key
//! store.
//!
//! The real storage engine lives elsewhere; this crate defines the traits it
//! implements plus in-memory implementations used by tests and small
//! single-node deployments.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Storage errors
pub mod error;
/// In-memory store implementations
pub mod memory;
/// Policy store interface: resources, roles, annotations, secrets
pub mod policy;
/// Token signing key store interface
pub mod signing;

pub use error::StorageError;
pub use memory::{MemoryPolicyStore, MemorySigningKeyStore};
pub use policy::{Annotation, PolicyStore, Resource, Role};
pub use signing::{SigningKeyPair, SigningKeyStore};
