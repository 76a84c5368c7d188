//! Authentication metrics.
//!
//! Thin wrappers over the `metrics` facade so call sites stay one-liners and
//! metric names live in one place. The exporter is installed by the hosting
//! binary, not here.

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Registers metric descriptions with the installed recorder. Call once at
/// startup, after the exporter is installed.
pub fn init_metrics_descriptions() {
    describe_counter!(
        "portcullis_authn_attempts_total",
        "Total authentication attempts, labeled by authenticator and result"
    );
    describe_histogram!(
        "portcullis_authn_duration_seconds",
        "End-to-end duration of authentication attempts in seconds"
    );
    describe_counter!(
        "portcullis_jwks_cache_hits_total",
        "JWKS lookups answered from cache"
    );
    describe_counter!(
        "portcullis_jwks_cache_misses_total",
        "JWKS lookups that required an upstream fetch"
    );
    describe_counter!(
        "portcullis_tokens_issued_total",
        "Access tokens issued, labeled by account and identity kind"
    );
}

/// Records one completed authentication attempt.
pub fn record_authn_attempt(authenticator: &str, success: bool, duration_secs: f64) {
    let result = if success { "success" } else { "failure" };
    counter!(
        "portcullis_authn_attempts_total",
        "authenticator" => authenticator.to_string(),
        "result" => result
    )
    .increment(1);
    histogram!(
        "portcullis_authn_duration_seconds",
        "authenticator" => authenticator.to_string()
    )
    .record(duration_secs);
}

/// Records a JWKS cache hit.
pub fn record_jwks_cache_hit(uri: &str) {
    counter!("portcullis_jwks_cache_hits_total", "uri" => uri.to_string()).increment(1);
}

/// Records a JWKS cache miss.
pub fn record_jwks_cache_miss(uri: &str) {
    counter!("portcullis_jwks_cache_misses_total", "uri" => uri.to_string()).increment(1);
}

/// Records an issued token.
pub fn record_token_issued(account: &str, is_host: bool) {
    let kind = if is_host { "host" } else { "user" };
    counter!(
        "portcullis_tokens_issued_total",
        "account" => account.to_string(),
        "kind" => kind
    )
    .increment(1);
}
