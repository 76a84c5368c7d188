//! AWS IAM role authentication, the `authn-iam` type.
//!
//! The workload signs an STS `GetCallerIdentity` request with its role
//! credentials and hands us the signed headers; we replay them against STS
//! and read the verified caller ARN out of the response. The region comes
//! from the signed `Host` header, falling back to the SigV4 credential
//! scope. One deliberate retry exists: a rejected `us-east-1` call is
//! retried once against the global endpoint, nothing else is ever retried.
//!
//! A host may further pin the roles it accepts with an `iam_allowed_roles`
//! annotation holding a JSON array of session-stripped ARNs.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use portcullis_store::{PolicyStore, policy::role_id_from_login};
use regex::Regex;
use serde::Deserialize;

use crate::{
    error::{AuthnError, Result},
    input::AuthenticatorInput,
    strategies::{Authenticator, VerifiedIdentity},
};

/// Which STS endpoint to replay the signed request against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StsEndpoint {
    /// `sts.amazonaws.com`
    Global,
    /// `sts.{region}.amazonaws.com`
    Regional(String),
}

impl StsEndpoint {
    /// The endpoint URL.
    pub fn url(&self) -> String {
        match self {
            StsEndpoint::Global => "https://sts.amazonaws.com".to_string(),
            StsEndpoint::Regional(region) => format!("https://sts.{region}.amazonaws.com"),
        }
    }
}

/// Replays a signed `GetCallerIdentity` request.
#[async_trait]
pub trait StsClient: Send + Sync {
    /// Sends the signed headers to `endpoint`, returning the raw XML
    /// response body on success.
    async fn get_caller_identity(
        &self,
        endpoint: &StsEndpoint,
        headers: &HashMap<String, String>,
    ) -> Result<String>;
}

/// HTTPS client used in production.
pub struct HttpStsClient {
    client: reqwest::Client,
}

impl HttpStsClient {
    /// Creates a client with the given request timeout.
    ///
    /// # Errors
    ///
    /// Fails if the TLS backend cannot be initialized.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthnError::VerificationError(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl StsClient for HttpStsClient {
    async fn get_caller_identity(
        &self,
        endpoint: &StsEndpoint,
        headers: &HashMap<String, String>,
    ) -> Result<String> {
        let url = format!("{}/?Action=GetCallerIdentity&Version=2011-06-15", endpoint.url());
        let mut request = self.client.get(&url);
        for (name, value) in headers {
            // reqwest sets Host itself from the URL.
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            request = request.header(name, value);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(AuthnError::SignedRequestRejected(format!(
                "STS returned {}",
                response.status()
            )));
        }
        Ok(response.text().await?)
    }
}

/// The verified caller, parsed from the STS XML response.
#[derive(Clone, Debug)]
pub struct CallerIdentity {
    /// Full caller ARN
    pub arn: String,
    /// AWS account id
    pub account: String,
}

impl CallerIdentity {
    /// The caller ARN with the session-name suffix stripped:
    /// `arn:aws:sts::{account}:assumed-role/{role}`.
    pub fn role_arn(&self) -> Result<String> {
        // Validates the assumed-role form as a side effect.
        self.role_name()?;
        match self.arn.rsplit_once('/') {
            Some((head, _session)) => Ok(head.to_string()),
            None => Err(AuthnError::VerificationError(format!("bad ARN: {}", self.arn))),
        }
    }

    /// The IAM role name from an assumed-role ARN, session name dropped.
    pub fn role_name(&self) -> Result<String> {
        // arn:aws:sts::{account}:assumed-role/{role}/{session}
        let resource = self
            .arn
            .rsplit(':')
            .next()
            .ok_or_else(|| AuthnError::VerificationError(format!("bad ARN: {}", self.arn)))?;
        let mut parts = resource.split('/');
        match (parts.next(), parts.next()) {
            (Some("assumed-role"), Some(role)) if !role.is_empty() => Ok(role.to_string()),
            _ => Err(AuthnError::VerificationError(format!("unexpected ARN form: {}", self.arn))),
        }
    }
}

#[derive(Deserialize)]
struct GetCallerIdentityResult {
    #[serde(rename = "Arn")]
    arn: String,
    #[serde(rename = "Account")]
    account: String,
}

#[derive(Deserialize)]
struct GetCallerIdentityResponse {
    #[serde(rename = "GetCallerIdentityResult")]
    result: GetCallerIdentityResult,
}

fn parse_caller_identity(xml: &str) -> Result<CallerIdentity> {
    let response: GetCallerIdentityResponse = quick_xml::de::from_str(xml)
        .map_err(|e| AuthnError::VerificationError(format!("bad STS response: {e}")))?;
    Ok(CallerIdentity { arn: response.result.arn, account: response.result.account })
}

/// Annotation naming the ARNs a host may authenticate as.
const ALLOWED_ROLES_ANNOTATION: &str = "iam_allowed_roles";

/// The `authn-iam` strategy.
pub struct IamAuthenticator {
    policy: Arc<dyn PolicyStore>,
    sts: Arc<dyn StsClient>,
}

impl IamAuthenticator {
    /// Creates the strategy over the given policy store and STS client.
    pub fn new(policy: Arc<dyn PolicyStore>, sts: Arc<dyn StsClient>) -> Self {
        Self { policy, sts }
    }

    /// Extracts the target endpoint from the signed headers: the `Host`
    /// header first, then the SigV4 credential scope.
    fn endpoint_from_headers(headers: &HashMap<String, String>) -> Result<StsEndpoint> {
        if let Some(host) = header(headers, "host") {
            if host == "sts.amazonaws.com" {
                return Ok(StsEndpoint::Global);
            }
            let host_re = Regex::new(r"^sts\.([a-z0-9-]+)\.amazonaws\.com$")
                .map_err(|e| AuthnError::VerificationError(e.to_string()))?;
            if let Some(captures) = host_re.captures(&host) {
                return Ok(StsEndpoint::Regional(captures[1].to_string()));
            }
        }

        if let Some(authorization) = header(headers, "authorization") {
            let scope_re = Regex::new(r"Credential=[^/]+/\d{8}/([a-z0-9-]+)/sts/aws4_request")
                .map_err(|e| AuthnError::VerificationError(e.to_string()))?;
            if let Some(captures) = scope_re.captures(&authorization) {
                return Ok(StsEndpoint::Regional(captures[1].to_string()));
            }
        }

        Err(AuthnError::MissingRegion)
    }

    async fn verify_with_sts(
        &self,
        endpoint: StsEndpoint,
        headers: &HashMap<String, String>,
    ) -> Result<CallerIdentity> {
        let first = self.sts.get_caller_identity(&endpoint, headers).await;
        let xml = match first {
            Ok(xml) => xml,
            // us-east-1 signed requests are also valid against the global
            // endpoint; one retry, never more.
            Err(err) if endpoint == StsEndpoint::Regional("us-east-1".to_string()) => {
                tracing::debug!(error = %err, "us-east-1 STS call failed, retrying global endpoint");
                self.sts.get_caller_identity(&StsEndpoint::Global, headers).await?
            }
            Err(err) => return Err(err),
        };
        parse_caller_identity(&xml)
    }

    /// Replaces the last two segments of the claimed login with the verified
    /// `{account}/{role}`.
    fn derived_username(claimed: &str, identity: &CallerIdentity) -> Result<String> {
        let (prefix, body) = match claimed.strip_prefix("host/") {
            Some(rest) => ("host/", rest),
            None => ("", claimed),
        };
        let segments: Vec<&str> = body.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() < 2 {
            return Err(AuthnError::InvalidCredentials);
        }

        let role_name = identity.role_name()?;
        let mut derived: Vec<&str> = segments[..segments.len() - 2].to_vec();
        derived.push(&identity.account);
        derived.push(&role_name);
        Ok(format!("{}{}", prefix, derived.join("/")))
    }

    /// Enforces the host's `iam_allowed_roles` annotation, when declared:
    /// the session-stripped caller ARN must appear in its JSON array. A host
    /// without the annotation accepts any role that maps onto its identifier.
    async fn check_allowed_roles(
        &self,
        input: &AuthenticatorInput,
        username: &str,
        identity: &CallerIdentity,
    ) -> Result<()> {
        let role_id = role_id_from_login(&input.account, username);
        let annotations = self.policy.annotations(&role_id).await?;

        let scoped = input
            .service_id
            .as_deref()
            .map(|service_id| format!("{}/{}/{}", self.name(), service_id, ALLOWED_ROLES_ANNOTATION));
        let unscoped = format!("{}/{}", self.name(), ALLOWED_ROLES_ANNOTATION);
        let declared = scoped
            .as_deref()
            .and_then(|name| annotations.iter().find(|a| a.name == name))
            .or_else(|| annotations.iter().find(|a| a.name == unscoped));

        let Some(annotation) = declared else {
            return Ok(());
        };
        if annotation.value.trim().is_empty() {
            return Err(AuthnError::EmptyAnnotation(annotation.name.clone()));
        }
        let allowed: Vec<String> = serde_json::from_str(&annotation.value).map_err(|e| {
            AuthnError::VerificationError(format!(
                "annotation '{}' is not a JSON array of ARNs: {e}",
                annotation.name
            ))
        })?;

        let caller = identity.role_arn()?;
        if allowed.iter().any(|arn| arn == &caller) {
            Ok(())
        } else {
            tracing::warn!(
                role_id = %role_id,
                arn = %caller,
                "caller ARN not in the host's allowed roles"
            );
            Err(AuthnError::InvalidResourceRestriction(ALLOWED_ROLES_ANNOTATION.to_string()))
        }
    }
}

#[async_trait]
impl Authenticator for IamAuthenticator {
    fn name(&self) -> &'static str {
        "authn-iam"
    }

    async fn verify(&self, input: &AuthenticatorInput) -> Result<VerifiedIdentity> {
        let headers: HashMap<String, String> = serde_json::from_str(&input.credentials)
            .map_err(|e| AuthnError::InvalidTokenFormat(format!("bad signed-headers body: {e}")))?;

        let endpoint = Self::endpoint_from_headers(&headers)?;
        let identity = self.verify_with_sts(endpoint, &headers).await?;
        let username = Self::derived_username(&input.username, &identity)?;
        self.check_allowed_roles(input, &username, &identity).await?;

        tracing::debug!(
            arn = %identity.arn,
            username = %username,
            "IAM caller verified"
        );
        Ok(VerifiedIdentity::new(username))
    }
}

fn header(headers: &HashMap<String, String>, name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.clone())
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use portcullis_store::MemoryPolicyStore;

    use super::*;

    const RESPONSE_XML: &str = r#"<GetCallerIdentityResponse xmlns="https://sts.amazonaws.com/doc/2011-06-15/">
  <GetCallerIdentityResult>
    <Arn>arn:aws:sts::011915987442:assumed-role/MyApp/i-0abcd</Arn>
    <UserId>AROAEXAMPLE:i-0abcd</UserId>
    <Account>011915987442</Account>
  </GetCallerIdentityResult>
  <ResponseMetadata><RequestId>req-1</RequestId></ResponseMetadata>
</GetCallerIdentityResponse>"#;

    struct FakeSts {
        /// Endpoints that fail with a rejection
        failing: Vec<StsEndpoint>,
        calls: AtomicUsize,
        seen: Mutex<Vec<StsEndpoint>>,
    }

    impl FakeSts {
        fn new(failing: Vec<StsEndpoint>) -> Self {
            Self { failing, calls: AtomicUsize::new(0), seen: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl StsClient for FakeSts {
        async fn get_caller_identity(
            &self,
            endpoint: &StsEndpoint,
            _headers: &HashMap<String, String>,
        ) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(endpoint.clone());
            if self.failing.contains(endpoint) {
                return Err(AuthnError::SignedRequestRejected("STS returned 403".into()));
            }
            Ok(RESPONSE_XML.to_string())
        }
    }

    fn signed_headers(host: &str) -> serde_json::Value {
        serde_json::json!({
            "Host": host,
            "Authorization": "AWS4-HMAC-SHA256 Credential=AKIAEXAMPLE/20260826/us-west-2/sts/aws4_request, SignedHeaders=host;x-amz-date, Signature=deadbeef",
            "X-Amz-Date": "20260826T120000Z",
        })
    }

    fn strategy_over(sts: Arc<FakeSts>) -> IamAuthenticator {
        IamAuthenticator::new(Arc::new(MemoryPolicyStore::new()), sts)
    }

    fn input(username: &str, headers: serde_json::Value) -> AuthenticatorInput {
        AuthenticatorInput {
            authenticator_name: "authn-iam".into(),
            service_id: Some("prod".into()),
            account: "cucumber".into(),
            username: username.into(),
            credentials: headers.to_string(),
            client_ip: "10.0.0.5".into(),
            parameters: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_verified_arn_replaces_last_two_segments() {
        let sts = Arc::new(FakeSts::new(vec![]));
        let strategy = strategy_over(sts.clone());

        let identity = strategy
            .verify(&input("host/myapp/claimed-acct/claimed-role", signed_headers("sts.us-west-2.amazonaws.com")))
            .await
            .unwrap();

        assert_eq!(identity.username, "host/myapp/011915987442/MyApp");
        assert_eq!(sts.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            sts.seen.lock().unwrap()[0],
            StsEndpoint::Regional("us-west-2".to_string())
        );
    }

    #[tokio::test]
    async fn test_us_east_1_rejection_retries_global_exactly_once() {
        let sts = Arc::new(FakeSts::new(vec![StsEndpoint::Regional("us-east-1".to_string())]));
        let strategy = strategy_over(sts.clone());

        let identity = strategy
            .verify(&input("host/myapp/a/b", signed_headers("sts.us-east-1.amazonaws.com")))
            .await
            .unwrap();

        assert_eq!(identity.username, "host/myapp/011915987442/MyApp");
        assert_eq!(sts.calls.load(Ordering::SeqCst), 2);
        let seen = sts.seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                StsEndpoint::Regional("us-east-1".to_string()),
                StsEndpoint::Global,
            ]
        );
    }

    #[tokio::test]
    async fn test_other_region_rejection_is_not_retried() {
        let sts = Arc::new(FakeSts::new(vec![StsEndpoint::Regional("eu-west-1".to_string())]));
        let strategy = strategy_over(sts.clone());

        let result = strategy
            .verify(&input("host/myapp/a/b", signed_headers("sts.eu-west-1.amazonaws.com")))
            .await;

        assert!(matches!(result, Err(AuthnError::SignedRequestRejected(_))));
        assert_eq!(sts.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bare_sts_host_is_global() {
        let sts = Arc::new(FakeSts::new(vec![]));
        let strategy = strategy_over(sts.clone());

        strategy
            .verify(&input("host/myapp/a/b", signed_headers("sts.amazonaws.com")))
            .await
            .unwrap();

        assert_eq!(sts.seen.lock().unwrap()[0], StsEndpoint::Global);
    }

    #[tokio::test]
    async fn test_region_from_credential_scope_when_host_absent() {
        let sts = Arc::new(FakeSts::new(vec![]));
        let strategy = strategy_over(sts.clone());
        let headers = serde_json::json!({
            "Authorization": "AWS4-HMAC-SHA256 Credential=AKIAEXAMPLE/20260826/ap-southeast-2/sts/aws4_request, SignedHeaders=host, Signature=deadbeef",
        });

        strategy.verify(&input("host/myapp/a/b", headers)).await.unwrap();

        assert_eq!(
            sts.seen.lock().unwrap()[0],
            StsEndpoint::Regional("ap-southeast-2".to_string())
        );
    }

    #[tokio::test]
    async fn test_no_region_anywhere_is_rejected() {
        let sts = Arc::new(FakeSts::new(vec![]));
        let strategy = strategy_over(sts.clone());
        let headers = serde_json::json!({"X-Amz-Date": "20260826T120000Z"});

        let result = strategy.verify(&input("host/myapp/a/b", headers)).await;

        assert!(matches!(result, Err(AuthnError::MissingRegion)));
        assert_eq!(sts.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_username_too_short_for_substitution() {
        let sts = Arc::new(FakeSts::new(vec![]));
        let strategy = strategy_over(sts);

        let result = strategy
            .verify(&input("host/justone", signed_headers("sts.us-west-2.amazonaws.com")))
            .await;
        assert!(matches!(result, Err(AuthnError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn test_allowed_roles_accepts_listed_arn() {
        let policy = Arc::new(MemoryPolicyStore::new());
        policy.annotate(
            "cucumber:host:myapp/011915987442/MyApp",
            "authn-iam/prod/iam_allowed_roles",
            r#"["arn:aws:sts::011915987442:assumed-role/MyApp"]"#,
        );
        let strategy = IamAuthenticator::new(policy, Arc::new(FakeSts::new(vec![])));

        let identity = strategy
            .verify(&input("host/myapp/a/b", signed_headers("sts.us-west-2.amazonaws.com")))
            .await
            .unwrap();
        assert_eq!(identity.username, "host/myapp/011915987442/MyApp");
    }

    #[tokio::test]
    async fn test_allowed_roles_rejects_unlisted_arn() {
        let policy = Arc::new(MemoryPolicyStore::new());
        policy.annotate(
            "cucumber:host:myapp/011915987442/MyApp",
            "authn-iam/prod/iam_allowed_roles",
            r#"["arn:aws:sts::999999999999:assumed-role/OtherApp"]"#,
        );
        let strategy = IamAuthenticator::new(policy, Arc::new(FakeSts::new(vec![])));

        let result = strategy
            .verify(&input("host/myapp/a/b", signed_headers("sts.us-west-2.amazonaws.com")))
            .await;
        assert!(matches!(result, Err(AuthnError::InvalidResourceRestriction(name)) if name == "iam_allowed_roles"));
    }

    #[tokio::test]
    async fn test_allowed_roles_unscoped_annotation_applies() {
        let policy = Arc::new(MemoryPolicyStore::new());
        policy.annotate(
            "cucumber:host:myapp/011915987442/MyApp",
            "authn-iam/iam_allowed_roles",
            r#"["arn:aws:sts::999999999999:assumed-role/OtherApp"]"#,
        );
        let strategy = IamAuthenticator::new(policy, Arc::new(FakeSts::new(vec![])));

        let result = strategy
            .verify(&input("host/myapp/a/b", signed_headers("sts.us-west-2.amazonaws.com")))
            .await;
        assert!(matches!(result, Err(AuthnError::InvalidResourceRestriction(_))));
    }

    #[tokio::test]
    async fn test_allowed_roles_absent_annotation_passes() {
        // Covered implicitly by the endpoint tests, stated explicitly here:
        // a host without the annotation accepts any verified role.
        let strategy = strategy_over(Arc::new(FakeSts::new(vec![])));
        strategy
            .verify(&input("host/myapp/a/b", signed_headers("sts.us-west-2.amazonaws.com")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_allowed_roles_malformed_annotation_is_rejected() {
        let policy = Arc::new(MemoryPolicyStore::new());
        policy.annotate(
            "cucumber:host:myapp/011915987442/MyApp",
            "authn-iam/prod/iam_allowed_roles",
            "not-json",
        );
        let strategy = IamAuthenticator::new(policy, Arc::new(FakeSts::new(vec![])));

        let result = strategy
            .verify(&input("host/myapp/a/b", signed_headers("sts.us-west-2.amazonaws.com")))
            .await;
        assert!(matches!(result, Err(AuthnError::VerificationError(_))));
    }

    #[test]
    fn test_session_stripped_arn() {
        let identity = CallerIdentity {
            arn: "arn:aws:sts::011915987442:assumed-role/MyApp/i-0abcd".into(),
            account: "011915987442".into(),
        };
        assert_eq!(
            identity.role_arn().unwrap(),
            "arn:aws:sts::011915987442:assumed-role/MyApp"
        );
    }

    #[test]
    fn test_parse_caller_identity() {
        let identity = parse_caller_identity(RESPONSE_XML).unwrap();
        assert_eq!(identity.account, "011915987442");
        assert_eq!(identity.role_name().unwrap(), "MyApp");
    }

    #[test]
    fn test_unexpected_arn_form() {
        let identity = CallerIdentity {
            arn: "arn:aws:iam::011915987442:user/alice".into(),
            account: "011915987442".into(),
        };
        assert!(matches!(identity.role_name(), Err(AuthnError::VerificationError(_))));
    }
}
