//! Jenkins build authentication, the `authn-jenkins` type.
//!
//! A Jenkins job proves it is the one asking by signing
//! `"{job_name}-{build_number}"` with the master's instance identity key,
//! published in the `X-Instance-Identity` response header. The signature
//! alone is not enough: the named build must also currently be running, so
//! a captured signature is useless once the build finishes.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use rsa::{Pkcs1v15Sign, RsaPublicKey, pkcs8::DecodePublicKey};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::{
    error::{AuthnError, Result},
    input::AuthenticatorInput,
    strategies::{Authenticator, VerifiedIdentity},
};

/// Jenkins master endpoints the strategy needs.
#[async_trait]
pub trait JenkinsServer: Send + Sync {
    /// The master's RSA instance identity public key.
    async fn instance_identity_key(&self) -> Result<RsaPublicKey>;

    /// Whether build `build_number` of the job at `job_path` (slash-joined
    /// segments) is currently running. `Ok(false)` covers both a finished
    /// build and a build the master does not know.
    async fn build_running(&self, job_path: &str, build_number: u64) -> Result<bool>;
}

/// REST client for a real Jenkins master, authenticated with basic auth.
pub struct HttpJenkinsServer {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpJenkinsServer {
    /// Creates a client with the Jenkins read timeout.
    ///
    /// # Errors
    ///
    /// Fails if the TLS backend cannot be initialized.
    pub fn new(base_url: &str, username: &str, password: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthnError::VerificationError(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    /// `folder/app` becomes `/job/folder/job/app`.
    fn job_url_path(job_path: &str) -> String {
        job_path.split('/').map(|segment| format!("/job/{segment}")).collect()
    }
}

#[derive(Deserialize)]
struct BuildStatus {
    building: bool,
}

#[async_trait]
impl JenkinsServer for HttpJenkinsServer {
    async fn instance_identity_key(&self) -> Result<RsaPublicKey> {
        let response = self
            .client
            .get(&self.base_url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        let header = response
            .headers()
            .get("X-Instance-Identity")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AuthnError::VerificationError("Jenkins did not send X-Instance-Identity".into())
            })?;
        let der = STANDARD
            .decode(header)
            .map_err(|e| AuthnError::VerificationError(format!("bad identity header: {e}")))?;
        RsaPublicKey::from_public_key_der(&der)
            .map_err(|e| AuthnError::VerificationError(format!("bad identity key: {e}")))
    }

    async fn build_running(&self, job_path: &str, build_number: u64) -> Result<bool> {
        let url = format!(
            "{}{}/{}/api/json",
            self.base_url,
            Self::job_url_path(job_path),
            build_number
        );
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(AuthnError::VerificationError(format!(
                "Jenkins build status returned {}",
                response.status()
            )));
        }
        let status: BuildStatus = response.json().await?;
        Ok(status.building)
    }
}

/// Request body presented by the Jenkins job.
#[derive(Debug, Deserialize)]
struct JenkinsCredentials {
    #[serde(rename = "buildNumber")]
    build_number: u64,
    /// Base64 RSA-SHA256 signature over `{job_name}-{build_number}`
    signature: String,
    /// Host-id prefix to strip from the username when deriving the job name
    #[serde(rename = "jobProperty_hostPrefix", default)]
    host_prefix: Option<String>,
}

/// The `authn-jenkins` strategy.
pub struct JenkinsAuthenticator {
    server: Arc<dyn JenkinsServer>,
}

impl JenkinsAuthenticator {
    /// Creates the strategy over the given master.
    pub fn new(server: Arc<dyn JenkinsServer>) -> Self {
        Self { server }
    }

    /// Derives the job name from the login: strip `host/`, then the optional
    /// configured prefix.
    fn job_name(username: &str, host_prefix: Option<&str>) -> Result<String> {
        let mut name = username.strip_prefix("host/").unwrap_or(username);
        if let Some(prefix) = host_prefix {
            let prefix = prefix.trim_matches('/');
            if !prefix.is_empty() {
                name = name.strip_prefix(prefix).unwrap_or(name).trim_start_matches('/');
            }
        }
        if name.is_empty() {
            return Err(AuthnError::InvalidCredentials);
        }
        Ok(name.to_string())
    }

    fn verify_signature(key: &RsaPublicKey, message: &str, signature_b64: &str) -> Result<()> {
        let signature = STANDARD
            .decode(signature_b64)
            .map_err(|e| AuthnError::InvalidTokenFormat(format!("bad signature encoding: {e}")))?;
        let digest = Sha256::digest(message.as_bytes());
        key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
            .map_err(|_| AuthnError::InvalidSignature)
    }
}

#[async_trait]
impl Authenticator for JenkinsAuthenticator {
    fn name(&self) -> &'static str {
        "authn-jenkins"
    }

    async fn verify(&self, input: &AuthenticatorInput) -> Result<VerifiedIdentity> {
        let credentials: JenkinsCredentials = serde_json::from_str(&input.credentials)
            .map_err(|e| AuthnError::InvalidTokenFormat(format!("bad Jenkins body: {e}")))?;

        let job_name = Self::job_name(&input.username, credentials.host_prefix.as_deref())?;
        let message = format!("{}-{}", job_name, credentials.build_number);

        let key = self.server.instance_identity_key().await?;
        Self::verify_signature(&key, &message, &credentials.signature)?;

        // A valid signature for a build that is not running is still a
        // rejection; captured signatures die with the build.
        if !self.server.build_running(&job_name, credentials.build_number).await? {
            return Err(AuthnError::RunningJobNotFound(job_name, credentials.build_number));
        }

        tracing::debug!(
            job = %job_name,
            build = credentials.build_number,
            "Jenkins build verified"
        );
        Ok(VerifiedIdentity::new(&input.username))
    }
}

#[cfg(test)]
mod tests {
    use rsa::RsaPrivateKey;

    use super::*;

    struct FakeJenkins {
        key: RsaPublicKey,
        building: bool,
    }

    #[async_trait]
    impl JenkinsServer for FakeJenkins {
        async fn instance_identity_key(&self) -> Result<RsaPublicKey> {
            Ok(self.key.clone())
        }

        async fn build_running(&self, _job_path: &str, _build_number: u64) -> Result<bool> {
            Ok(self.building)
        }
    }

    fn key_pair() -> (RsaPrivateKey, RsaPublicKey) {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).expect("generate RSA key");
        let public = RsaPublicKey::from(&private);
        (private, public)
    }

    fn sign(private: &RsaPrivateKey, message: &str) -> String {
        let digest = Sha256::digest(message.as_bytes());
        let signature = private.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).unwrap();
        STANDARD.encode(signature)
    }

    fn input(username: &str, body: serde_json::Value) -> AuthenticatorInput {
        AuthenticatorInput {
            authenticator_name: "authn-jenkins".into(),
            service_id: Some("ci".into()),
            account: "cucumber".into(),
            username: username.into(),
            credentials: body.to_string(),
            client_ip: "10.0.0.5".into(),
            parameters: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_valid_signature_and_running_build() {
        let (private, public) = key_pair();
        let strategy =
            JenkinsAuthenticator::new(Arc::new(FakeJenkins { key: public, building: true }));
        let body = serde_json::json!({
            "buildNumber": 42,
            "signature": sign(&private, "myjob-42"),
        });

        let identity = strategy.verify(&input("host/myjob", body)).await.unwrap();
        assert_eq!(identity.username, "host/myjob");
    }

    #[tokio::test]
    async fn test_valid_signature_but_build_not_running() {
        let (private, public) = key_pair();
        let strategy =
            JenkinsAuthenticator::new(Arc::new(FakeJenkins { key: public, building: false }));
        let body = serde_json::json!({
            "buildNumber": 42,
            "signature": sign(&private, "myjob-42"),
        });

        let result = strategy.verify(&input("host/myjob", body)).await;
        assert!(
            matches!(result, Err(AuthnError::RunningJobNotFound(job, 42)) if job == "myjob")
        );
    }

    #[tokio::test]
    async fn test_bad_signature() {
        let (private, public) = key_pair();
        let strategy =
            JenkinsAuthenticator::new(Arc::new(FakeJenkins { key: public, building: true }));
        let body = serde_json::json!({
            "buildNumber": 42,
            "signature": sign(&private, "otherjob-42"),
        });

        let result = strategy.verify(&input("host/myjob", body)).await;
        assert!(matches!(result, Err(AuthnError::InvalidSignature)));
    }

    #[tokio::test]
    async fn test_host_prefix_stripped_from_job_name() {
        let (private, public) = key_pair();
        let strategy =
            JenkinsAuthenticator::new(Arc::new(FakeJenkins { key: public, building: true }));
        let body = serde_json::json!({
            "buildNumber": 7,
            "signature": sign(&private, "folder/myjob-7"),
            "jobProperty_hostPrefix": "jenkins",
        });

        let identity = strategy.verify(&input("host/jenkins/folder/myjob", body)).await.unwrap();
        assert_eq!(identity.username, "host/jenkins/folder/myjob");
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let (_, public) = key_pair();
        let strategy =
            JenkinsAuthenticator::new(Arc::new(FakeJenkins { key: public, building: true }));
        let mut bad = input("host/myjob", serde_json::json!({}));
        bad.credentials = "not json".into();

        let result = strategy.verify(&bad).await;
        assert!(matches!(result, Err(AuthnError::InvalidTokenFormat(_))));
    }

    #[test]
    fn test_job_url_path_joins_with_job_segments() {
        assert_eq!(HttpJenkinsServer::job_url_path("folder/app"), "/job/folder/job/app");
        assert_eq!(HttpJenkinsServer::job_url_path("app"), "/job/app");
    }
}
