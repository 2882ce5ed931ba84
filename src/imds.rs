//! Instance-metadata identity-token fetcher
//!
//! When the provisioner acts as a client (on the VM requesting a
//! certificate), it asks the instance-metadata service for a
//! managed-identity access token. The token comes back opaque; validation
//! happens on the CA side.

use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Deserialize)]
struct IdentityTokenResponse {
    #[serde(default)]
    access_token: String,
}

/// GET the configured identity-token URL with the `Metadata: true` header
/// the metadata service requires. The `resource` query is already part of
/// the URL.
pub(crate) async fn fetch_identity_token(
    client: &reqwest::Client,
    identity_token_url: &str,
) -> Result<String> {
    let url = Url::parse(identity_token_url).map_err(|e| {
        Error::with_source(
            ErrorKind::ClientConfig,
            format!("invalid identity token URL {identity_token_url:?}"),
            e,
        )
    })?;
    debug!(url = %url, "requesting identity token from instance metadata");

    let response = client
        .get(url)
        .header("Metadata", "true")
        .send()
        .await
        .map_err(|e| {
            Error::with_source(
                ErrorKind::ClientTransport,
                "identity token request failed",
                e,
            )
        })?;

    if !response.status().is_success() {
        return Err(Error::new(
            ErrorKind::ClientHttp,
            format!(
                "identity token endpoint returned status {}",
                response.status()
            ),
        ));
    }

    let body: IdentityTokenResponse = response.json().await.map_err(|e| {
        Error::with_source(
            ErrorKind::ClientDecode,
            "error decoding identity token response",
            e,
        )
    })?;
    if body.access_token.is_empty() {
        return Err(Error::new(
            ErrorKind::ClientDecode,
            "identity token response has no access_token",
        ));
    }
    Ok(body.access_token)
}
