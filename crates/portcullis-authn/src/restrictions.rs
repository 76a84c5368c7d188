//! Resource restrictions.
//!
//! Hosts opt in to authenticator-specific constraints through annotations of
//! the form `{authenticator_name}/{service_id}/{restriction_name}` (the
//! service segment is optional). Extraction turns matching annotations into
//! a name→value map; validation first asks a pluggable [`Constraint`] to
//! accept the *set of names*, then compares each stored value against the
//! attribute the verified credential actually carries.

use std::{collections::BTreeMap, sync::Arc};

use portcullis_store::PolicyStore;
use regex::Regex;

use crate::error::{AuthnError, Result};

/// Restriction name → required value, keys stripped of the authenticator
/// prefix. Ordered so extraction output is deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceRestrictions {
    entries: BTreeMap<String, String>,
}

impl ResourceRestrictions {
    /// Number of restrictions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no restriction is declared.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The declared restriction names.
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Iterates over `(name, required_value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// The attributes a verified credential can answer restriction checks with.
///
/// Implemented by whatever a strategy resolved the request into, such as a
/// decoded JWT claim map or a verified caller identity.
pub trait AttributeSource {
    /// The value of the named attribute, or `None` when the credential does
    /// not carry it at all. Absence and mismatch are distinct error kinds.
    fn attribute(&self, name: &str) -> Option<String>;
}

impl AttributeSource for BTreeMap<String, String> {
    fn attribute(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Nested-claim lookup over a decoded JSON credential: `a/b/c` digs through
/// objects, scalars render to their string form.
impl AttributeSource for serde_json::Value {
    fn attribute(&self, name: &str) -> Option<String> {
        let mut current = self;
        for segment in name.split('/') {
            current = current.get(segment)?;
        }
        match current {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// Authenticator-specific policy over the *set* of restriction names.
pub trait Constraint: Send + Sync {
    /// Accept or reject the declared restriction names.
    fn validate(&self, names: &[&str]) -> Result<()>;
}

/// Requires at least one restriction to be declared.
pub struct NonEmptyConstraint;

impl Constraint for NonEmptyConstraint {
    fn validate(&self, names: &[&str]) -> Result<()> {
        if names.is_empty() {
            return Err(AuthnError::ConstraintViolation(
                "at least one restriction must be declared".into(),
            ));
        }
        Ok(())
    }
}

/// Requires every listed name to be present.
pub struct RequiredConstraint {
    required: Vec<String>,
}

impl RequiredConstraint {
    /// Creates the constraint from the required names.
    pub fn new<I: IntoIterator<Item = S>, S: Into<String>>(required: I) -> Self {
        Self { required: required.into_iter().map(Into::into).collect() }
    }
}

impl Constraint for RequiredConstraint {
    fn validate(&self, names: &[&str]) -> Result<()> {
        for required in &self.required {
            if !names.contains(&required.as_str()) {
                return Err(AuthnError::ConstraintViolation(format!(
                    "restriction '{}' must be declared",
                    required
                )));
            }
        }
        Ok(())
    }
}

/// Requires exactly one of the listed names to be present.
pub struct ExclusiveConstraint {
    alternatives: Vec<String>,
}

impl ExclusiveConstraint {
    /// Creates the constraint from the mutually exclusive names.
    pub fn new<I: IntoIterator<Item = S>, S: Into<String>>(alternatives: I) -> Self {
        Self { alternatives: alternatives.into_iter().map(Into::into).collect() }
    }
}

impl Constraint for ExclusiveConstraint {
    fn validate(&self, names: &[&str]) -> Result<()> {
        let present =
            self.alternatives.iter().filter(|alt| names.contains(&alt.as_str())).count();
        if present != 1 {
            return Err(AuthnError::ConstraintViolation(format!(
                "exactly one of [{}] must be declared, found {}",
                self.alternatives.join(", "),
                present
            )));
        }
        Ok(())
    }
}

/// Extracts and validates resource restrictions for one authenticator
/// instance.
pub struct RestrictionMatcher {
    policy: Arc<dyn PolicyStore>,
}

impl RestrictionMatcher {
    /// Creates a matcher reading annotations from the given policy store.
    pub fn new(policy: Arc<dyn PolicyStore>) -> Self {
        Self { policy }
    }

    /// Fetches the host's annotations and filters them down to this
    /// authenticator's restrictions.
    ///
    /// Annotation names must match
    /// `^{authenticator_name}/({service_id}/)?{restriction_name}$` where the
    /// restriction name has no further slashes at the top level (nested claim
    /// paths are expressed in the value-side lookup, not the annotation key).
    /// Service-scoped annotations shadow unscoped ones of the same name.
    ///
    /// # Errors
    ///
    /// [`AuthnError::EmptyAnnotation`] when a matching annotation has a blank
    /// value; a declared-but-empty restriction is a configuration error, not
    /// an automatic pass.
    pub async fn extract(
        &self,
        authenticator_name: &str,
        service_id: Option<&str>,
        host_role_id: &str,
    ) -> Result<ResourceRestrictions> {
        let annotations = self.policy.annotations(host_role_id).await?;

        let pattern = match service_id {
            Some(service_id) => format!(
                "^{}/(?:{}/)?(?P<restriction_name>[^/]+)$",
                regex::escape(authenticator_name),
                regex::escape(service_id)
            ),
            None => {
                format!("^{}/(?P<restriction_name>[^/]+)$", regex::escape(authenticator_name))
            }
        };
        let matcher = Regex::new(&pattern)
            .map_err(|e| AuthnError::ConstraintViolation(format!("bad annotation pattern: {e}")))?;

        let service_prefix = service_id.map(|s| format!("{}/{}/", authenticator_name, s));
        let mut general: BTreeMap<String, String> = BTreeMap::new();
        let mut scoped: BTreeMap<String, String> = BTreeMap::new();

        for annotation in &annotations {
            let Some(captures) = matcher.captures(&annotation.name) else {
                continue;
            };
            let name = captures["restriction_name"].to_string();
            if annotation.value.trim().is_empty() {
                return Err(AuthnError::EmptyAnnotation(annotation.name.clone()));
            }
            let is_scoped =
                service_prefix.as_deref().is_some_and(|p| annotation.name.starts_with(p));
            if is_scoped {
                scoped.insert(name, annotation.value.clone());
            } else {
                general.insert(name, annotation.value.clone());
            }
        }

        let mut entries = general;
        entries.extend(scoped);
        Ok(ResourceRestrictions { entries })
    }

    /// Validates a request against extracted restrictions.
    ///
    /// The constraint sees only the restriction *names*; the value check then
    /// requires every stored value to equal the attribute the credential
    /// carries. A missing attribute and a mismatching one raise different
    /// error kinds, though both deny authentication.
    pub fn validate(
        &self,
        restrictions: &ResourceRestrictions,
        constraint: &dyn Constraint,
        request: &dyn AttributeSource,
    ) -> Result<()> {
        constraint.validate(&restrictions.names())?;

        for (name, required_value) in restrictions.iter() {
            let Some(actual) = request.attribute(name) else {
                return Err(AuthnError::MissingRestrictionAttribute(name.to_string()));
            };
            if actual != required_value {
                return Err(AuthnError::InvalidResourceRestriction(name.to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use portcullis_store::MemoryPolicyStore;

    use super::*;

    const HOST: &str = "cucumber:host:myapp";

    async fn extract(store: MemoryPolicyStore) -> Result<ResourceRestrictions> {
        let matcher = RestrictionMatcher::new(Arc::new(store));
        matcher.extract("authn-jwt", Some("prod"), HOST).await
    }

    #[tokio::test]
    async fn test_extract_scoped_and_unscoped() {
        let store = MemoryPolicyStore::new();
        store.annotate(HOST, "authn-jwt/prod/project-id", "team-a");
        store.annotate(HOST, "authn-jwt/ref", "main");
        store.annotate(HOST, "authn-k8s/prod/namespace", "ignored");
        store.annotate(HOST, "description", "ignored");

        let restrictions = extract(store).await.unwrap();
        assert_eq!(restrictions.len(), 2);
        assert_eq!(restrictions.names(), vec!["project-id", "ref"]);
    }

    #[tokio::test]
    async fn test_scoped_annotation_shadows_unscoped() {
        let store = MemoryPolicyStore::new();
        store.annotate(HOST, "authn-jwt/ref", "general");
        store.annotate(HOST, "authn-jwt/prod/ref", "scoped");

        let restrictions = extract(store).await.unwrap();
        let value = restrictions.iter().find(|(n, _)| *n == "ref").map(|(_, v)| v.to_string());
        assert_eq!(value.as_deref(), Some("scoped"));
    }

    #[tokio::test]
    async fn test_empty_annotation_is_configuration_error() {
        let store = MemoryPolicyStore::new();
        store.annotate(HOST, "authn-jwt/prod/project-id", "  ");

        let result = extract(store).await;
        assert!(matches!(result, Err(AuthnError::EmptyAnnotation(_))));
    }

    #[tokio::test]
    async fn test_extract_ignores_other_service() {
        let store = MemoryPolicyStore::new();
        store.annotate(HOST, "authn-jwt/staging/project-id", "team-a");

        let restrictions = extract(store).await.unwrap();
        assert!(restrictions.is_empty());
    }

    fn restrictions_of(pairs: &[(&str, &str)]) -> ResourceRestrictions {
        ResourceRestrictions {
            entries: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    fn matcher() -> RestrictionMatcher {
        RestrictionMatcher::new(Arc::new(MemoryPolicyStore::new()))
    }

    #[test]
    fn test_validate_matching_claims() {
        let restrictions = restrictions_of(&[("project-id", "team-a"), ("ref", "main")]);
        let claims: serde_json::Value =
            serde_json::json!({"project-id": "team-a", "ref": "main", "sub": "x"});

        let result = matcher().validate(&restrictions, &NonEmptyConstraint, &claims);
        assert!(result.is_ok());
    }

    #[test]
    fn test_validate_mismatch() {
        let restrictions = restrictions_of(&[("project-id", "team-a")]);
        let claims = serde_json::json!({"project-id": "team-b"});

        let result = matcher().validate(&restrictions, &NonEmptyConstraint, &claims);
        assert!(
            matches!(result, Err(AuthnError::InvalidResourceRestriction(n)) if n == "project-id")
        );
    }

    #[test]
    fn test_validate_missing_claim_is_distinct_from_mismatch() {
        let restrictions = restrictions_of(&[("project-id", "team-a")]);
        let claims = serde_json::json!({"sub": "x"});

        let result = matcher().validate(&restrictions, &NonEmptyConstraint, &claims);
        assert!(
            matches!(result, Err(AuthnError::MissingRestrictionAttribute(n)) if n == "project-id")
        );
    }

    #[test]
    fn test_validate_nested_claim_path() {
        let restrictions = restrictions_of(&[("ci/pipeline", "deploy")]);
        let claims = serde_json::json!({"ci": {"pipeline": "deploy"}});

        // Nested paths only occur for authenticators whose restriction names
        // allow slashes in the value lookup; exercised directly here.
        let result =
            matcher().validate(&restrictions, &NonEmptyConstraint, &claims);
        assert!(result.is_ok());
    }

    #[test]
    fn test_non_empty_constraint_rejects_empty_set() {
        let result = matcher().validate(
            &ResourceRestrictions::default(),
            &NonEmptyConstraint,
            &serde_json::json!({}),
        );
        assert!(matches!(result, Err(AuthnError::ConstraintViolation(_))));
    }

    #[test]
    fn test_required_constraint() {
        let constraint = RequiredConstraint::new(["namespace", "service-account"]);
        assert!(constraint.validate(&["namespace", "service-account", "extra"]).is_ok());
        assert!(matches!(
            constraint.validate(&["namespace"]),
            Err(AuthnError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn test_exclusive_constraint() {
        let constraint = ExclusiveConstraint::new(["deployment", "stateful-set"]);
        assert!(constraint.validate(&["deployment", "namespace"]).is_ok());
        assert!(matches!(
            constraint.validate(&["deployment", "stateful-set"]),
            Err(AuthnError::ConstraintViolation(_))
        ));
        assert!(matches!(constraint.validate(&["namespace"]), Err(AuthnError::ConstraintViolation(_))));
    }
}
