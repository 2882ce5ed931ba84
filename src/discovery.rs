//! OIDC discovery client
//!
//! Fetches the tenant's OpenID Connect configuration once at `init` and
//! keeps only the two fields the provisioner needs: the issuer and the JWKS
//! URI. There is no background refresh; re-running `init` re-runs discovery.

use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::error::{Error, ErrorKind, Result};

/// The subset of the OpenID Connect discovery document this provisioner
/// consumes. All other fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDocument {
    /// Issuer URL; compared byte-for-byte against the token's `iss` claim.
    #[serde(default)]
    pub issuer: String,
    /// JWKS endpoint holding the tenant's verification keys.
    #[serde(default)]
    pub jwks_uri: String,
}

impl DiscoveryDocument {
    fn validate(self) -> Result<Self> {
        if self.issuer.is_empty() {
            return Err(Error::new(
                ErrorKind::ConfigInvalid,
                "discovery document is missing the issuer field",
            ));
        }
        if self.jwks_uri.is_empty() {
            return Err(Error::new(
                ErrorKind::ConfigInvalid,
                "discovery document is missing the jwks_uri field",
            ));
        }
        Ok(self)
    }
}

/// Require HTTPS for discovery endpoints; plain HTTP is accepted only for
/// loopback hosts, which is what test fakes bind to.
pub(crate) fn validate_endpoint_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| {
        Error::with_source(
            ErrorKind::ConfigInvalid,
            format!("invalid endpoint URL {raw:?}"),
            e,
        )
    })?;
    match url.scheme() {
        "https" => Ok(url),
        "http" => {
            let loopback = matches!(
                url.host_str(),
                Some("localhost") | Some("127.0.0.1") | Some("[::1]")
            );
            if loopback {
                Ok(url)
            } else {
                Err(Error::new(
                    ErrorKind::ConfigInvalid,
                    format!("endpoint URL {raw:?} must use https"),
                ))
            }
        }
        other => Err(Error::new(
            ErrorKind::ConfigInvalid,
            format!("endpoint URL {raw:?} has unsupported scheme {other:?}"),
        )),
    }
}

/// Fetch and validate the tenant's discovery document.
pub(crate) async fn fetch(
    client: &reqwest::Client,
    discovery_url: &str,
) -> Result<DiscoveryDocument> {
    let url = validate_endpoint_url(discovery_url)?;
    debug!(url = %url, "fetching OIDC discovery document");

    let response = client.get(url.clone()).send().await.map_err(|e| {
        Error::with_source(
            ErrorKind::ConfigInvalid,
            format!("failed to fetch discovery document from {url}"),
            e,
        )
    })?;

    if !response.status().is_success() {
        return Err(Error::new(
            ErrorKind::ConfigInvalid,
            format!(
                "discovery endpoint {url} returned status {}",
                response.status()
            ),
        ));
    }

    let document: DiscoveryDocument = response.json().await.map_err(|e| {
        Error::with_source(
            ErrorKind::ConfigInvalid,
            format!("invalid discovery document from {url}"),
            e,
        )
    })?;
    let document = document.validate()?;

    info!(issuer = %document.issuer, jwks_uri = %document.jwks_uri, "resolved OIDC configuration");
    Ok(document)
}
