//! Endpoint configuration
//!
//! Default Azure endpoints, overridable per provisioner. The identity-token
//! URL bakes the `resource=<audience>` query in at construction time, so the
//! fetcher never rebuilds query strings per call.

use std::time::Duration;

use url::form_urlencoded;

/// Audience of the public cloud's management API. Sovereign clouds override
/// this through the provisioner's `audience` field.
pub const DEFAULT_AUDIENCE: &str = "https://management.azure.com/";

/// Default HTTP timeout for discovery, JWKS and identity-token requests.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

const IMDS_TOKEN_URL: &str =
    "http://169.254.169.254/metadata/identity/oauth2/token?api-version=2018-02-01";

/// Resolved endpoint set for one provisioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureEndpoints {
    /// OIDC discovery document URL for the tenant.
    pub oidc_discovery_url: String,
    /// Instance-metadata identity-token URL, `resource` query included.
    pub identity_token_url: String,
    /// Timeout applied to every outbound HTTP request.
    pub http_timeout: Duration,
}

impl AzureEndpoints {
    /// Default endpoints for a tenant and audience.
    pub fn new(tenant_id: &str, audience: &str) -> Self {
        let resource: String =
            form_urlencoded::byte_serialize(audience.as_bytes()).collect();
        Self {
            oidc_discovery_url: format!(
                "https://login.microsoftonline.com/{tenant_id}/.well-known/openid-configuration"
            ),
            identity_token_url: format!("{IMDS_TOKEN_URL}&resource={resource}"),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    /// Replace the discovery URL (test servers, sovereign clouds).
    pub fn with_oidc_discovery_url(mut self, url: impl Into<String>) -> Self {
        self.oidc_discovery_url = url.into();
        self
    }

    /// Replace the identity-token URL.
    pub fn with_identity_token_url(mut self, url: impl Into<String>) -> Self {
        self.identity_token_url = url.into();
        self
    }

    /// Replace the HTTP timeout.
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }
}
