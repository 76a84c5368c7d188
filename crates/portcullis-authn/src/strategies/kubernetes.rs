//! Kubernetes mutual-TLS bootstrap, the `authn-k8s` type.
//!
//! Two operations. `bootstrap` runs once per workload: the caller's IP must
//! resolve to exactly one pod, a leaf certificate is issued from this
//! instance's CA with the host identity in the common name and the pod's
//! SPIFFE id as a SAN, and the certificate is installed into the pod.
//! Concurrent bootstraps for the same identity are serialized by conflict:
//! the first proceeds, the rest get a retry-later error. `verify` then
//! authenticates requests made with the issued certificate, which the
//! transport has already terminated and parsed; the strategy receives the
//! certificate's common name and re-checks pod resolution.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use portcullis_store::PolicyStore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, Ia5String, IsCa, KeyPair, SanType,
};

use crate::{
    error::{AuthnError, Result},
    input::AuthenticatorInput,
    strategies::{Authenticator, VerifiedIdentity, variable},
    webservice::Webservice,
};

/// A pod as the cluster reports it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pod {
    /// Pod name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Pod IP
    pub ip: String,
}

impl Pod {
    /// The pod's SPIFFE identity.
    pub fn spiffe_id(&self) -> String {
        format!("spiffe://cluster.local/namespace/{}/pod/{}", self.namespace, self.name)
    }
}

/// Cluster operations the strategy needs, behind a trait so tests run
/// without an API server.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// All pods whose IP is `ip`.
    async fn pods_by_ip(&self, ip: &str) -> Result<Vec<Pod>>;

    /// Installs an issued certificate into the pod, at the path the client
    /// sidecar watches.
    async fn install_certificate(&self, pod: &Pod, cert_pem: &str, key_pem: &str) -> Result<()>;
}

/// A leaf certificate issued during bootstrap.
#[derive(Clone, Debug)]
pub struct IssuedCertificate {
    /// PEM certificate
    pub cert_pem: String,
    /// PEM private key
    pub key_pem: String,
}

/// Per-instance certificate authority.
pub struct CertificateAuthority {
    key: KeyPair,
    cert: Certificate,
}

impl CertificateAuthority {
    /// Creates a fresh self-signed CA named `common_name`.
    pub fn new(common_name: &str) -> Result<Self> {
        let key = KeyPair::generate().map_err(cert_error)?;
        let mut params = CertificateParams::new(Vec::new()).map_err(cert_error)?;
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).map_err(cert_error)?;
        Ok(Self { key, cert })
    }

    /// Issues a leaf certificate for `common_name` with `spiffe_uri` as a
    /// URI SAN.
    pub fn issue(&self, common_name: &str, spiffe_uri: &str) -> Result<IssuedCertificate> {
        let leaf_key = KeyPair::generate().map_err(cert_error)?;
        let mut params = CertificateParams::new(Vec::new()).map_err(cert_error)?;
        params.distinguished_name.push(DnType::CommonName, common_name);
        params
            .subject_alt_names
            .push(SanType::URI(Ia5String::try_from(spiffe_uri.to_string()).map_err(cert_error)?));
        let cert = params.signed_by(&leaf_key, &self.cert, &self.key).map_err(cert_error)?;
        Ok(IssuedCertificate { cert_pem: cert.pem(), key_pem: leaf_key.serialize_pem() })
    }

    /// The CA certificate in PEM form, for distribution to clients.
    pub fn ca_pem(&self) -> String {
        self.cert.pem()
    }
}

fn cert_error(e: impl std::fmt::Display) -> AuthnError {
    AuthnError::CertificateError(e.to_string())
}

/// The `authn-k8s` strategy.
pub struct KubernetesAuthenticator {
    policy: Arc<dyn PolicyStore>,
    cluster: Arc<dyn ClusterClient>,
    ca: CertificateAuthority,
    /// Identities with a bootstrap currently in flight
    in_flight: Mutex<HashSet<String>>,
}

impl KubernetesAuthenticator {
    /// Creates the strategy with its own CA.
    pub fn new(
        policy: Arc<dyn PolicyStore>,
        cluster: Arc<dyn ClusterClient>,
        ca: CertificateAuthority,
    ) -> Self {
        Self { policy, cluster, ca, in_flight: Mutex::new(HashSet::new()) }
    }

    /// The common-name prefix for this webservice, configurable via the
    /// `host-id-prefix` variable.
    async fn host_id_prefix(&self, webservice: &Webservice) -> Result<String> {
        if let Some(prefix) = variable(self.policy.as_ref(), webservice, "host-id-prefix").await? {
            return Ok(prefix);
        }
        Ok(format!(
            "host.{}.authn-k8s.{}.apps",
            webservice.account(),
            webservice.service_id().unwrap_or("default")
        ))
    }

    /// The caller's IP must resolve to exactly one pod.
    async fn resolve_pod(&self, client_ip: &str) -> Result<Pod> {
        let pods = self.cluster.pods_by_ip(client_ip).await?;
        let count = pods.len();
        let mut pods = pods.into_iter();
        match (pods.next(), count) {
            (Some(pod), 1) => Ok(pod),
            _ => Err(AuthnError::PodResolutionFailed(client_ip.to_string(), count)),
        }
    }

    /// Issues and installs a certificate for the requesting identity.
    ///
    /// # Errors
    ///
    /// [`AuthnError::CertIssuanceInProgress`] when another bootstrap for the
    /// same identity has not finished; callers retry after a short delay.
    pub async fn bootstrap(&self, input: &AuthenticatorInput) -> Result<()> {
        let relative = input
            .username
            .strip_prefix("host/")
            .ok_or(AuthnError::InvalidCredentials)?;
        if relative.is_empty() {
            return Err(AuthnError::InvalidCredentials);
        }
        // The certificate CN encodes `/` as `.`; a dot inside the host id
        // would decode to a different login on verify.
        if relative.contains('.') {
            return Err(AuthnError::InvalidCredentials);
        }

        let _guard = InFlightGuard::acquire(&self.in_flight, &input.username)?;

        let pod = self.resolve_pod(&input.client_ip).await?;
        let webservice = input.webservice();
        let prefix = self.host_id_prefix(&webservice).await?;
        let common_name = format!("{}.{}", prefix, relative.replace('/', "."));

        let issued = self.ca.issue(&common_name, &pod.spiffe_id())?;
        self.cluster.install_certificate(&pod, &issued.cert_pem, &issued.key_pem).await?;

        tracing::info!(
            username = %input.username,
            pod = %pod.name,
            namespace = %pod.namespace,
            "Issued and installed client certificate"
        );
        Ok(())
    }
}

/// Marks an identity as having a bootstrap in flight; the mark is dropped
/// with the guard, including on error paths.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, key: &str) -> Result<Self> {
        let mut in_flight = set.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(key.to_string()) {
            return Err(AuthnError::CertIssuanceInProgress(key.to_string()));
        }
        Ok(Self { set, key: key.to_string() })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap_or_else(|e| e.into_inner()).remove(&self.key);
    }
}

#[async_trait]
impl Authenticator for KubernetesAuthenticator {
    fn name(&self) -> &'static str {
        "authn-k8s"
    }

    /// Authenticates a request made with an issued certificate. The
    /// transport terminated the TLS session; the certificate's common name
    /// arrives as the `common-name` parameter.
    async fn verify(&self, input: &AuthenticatorInput) -> Result<VerifiedIdentity> {
        let common_name = input
            .parameter("common-name")
            .ok_or_else(|| AuthnError::InvalidTokenFormat("missing common-name".into()))?;

        let webservice = input.webservice();
        let prefix = self.host_id_prefix(&webservice).await?;
        let relative = common_name
            .strip_prefix(&format!("{prefix}."))
            .ok_or(AuthnError::InvalidCredentials)?;
        if relative.is_empty() {
            return Err(AuthnError::InvalidCredentials);
        }

        // The certificate holder must still be a resolvable, unique pod.
        let pod = self.resolve_pod(&input.client_ip).await?;

        let username = format!("host/{}", relative.replace('.', "/"));
        tracing::debug!(
            username = %username,
            pod = %pod.name,
            "Kubernetes client certificate accepted"
        );
        Ok(VerifiedIdentity::new(username))
    }
}
