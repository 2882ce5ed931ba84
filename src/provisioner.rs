//! The Azure provisioner
//!
//! Authenticates virtual machines by their managed-identity OIDC tokens and
//! compiles the constraints the CA enforces when minting certificates. The
//! configuration fields follow the CA's JSON schema; the runtime state
//! (discovery document, key store, claimer, replay guard) is created by
//! [`Azure::init`] and immutable afterwards, so the public operations may
//! run concurrently against one instance.
//!
//! Authorization walks a fixed ladder: parse, resolve the verification key,
//! verify the signature, enforce the claim policy, decode the VM resource
//! path, then compile the sign-time constraints. Each rung fails with its
//! own error kind so the CA can answer with the right status and an
//! auditable message.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{Validation, decode, decode_header};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::claims::{Claimer, Claims};
use crate::config::{AzureEndpoints, DEFAULT_AUDIENCE};
use crate::discovery::{self, DiscoveryDocument};
use crate::error::{Error, ErrorKind, Result};
use crate::imds;
use crate::jwks::KeyStore;
use crate::mirid::VmResourceId;
use crate::policy::{ProvisionerExtension, SignConstraint, SshPolicy, compile_x509};
use crate::token::{AzureClaims, derived_identity};
use crate::tofu::{MemoryTofuStore, TofuStore};

/// Tag of this provisioner kind in the CA configuration.
pub const TYPE_TAG: &str = "Azure";

/// Allowed clock skew when checking `nbf`/`exp`.
const CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Provisioner kind, recorded into the audit extension of issued
/// certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvisionerType {
    Azure,
}

impl ProvisionerType {
    /// The configuration tag for this kind.
    pub const fn tag(self) -> &'static str {
        match self {
            ProvisionerType::Azure => TYPE_TAG,
        }
    }
}

impl fmt::Display for ProvisionerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Runtime state built by `init`.
#[derive(Debug)]
struct Runtime {
    endpoints: AzureEndpoints,
    http: reqwest::Client,
    discovery: DiscoveryDocument,
    key_store: KeyStore,
    claimer: Claimer,
    tofu: Arc<dyn TofuStore>,
}

/// Azure managed-identity provisioner.
///
/// The serialized form is exactly the CA's configuration schema for this
/// provisioner kind:
///
/// ```json
/// {
///   "type": "Azure",
///   "name": "azure-prod",
///   "tenantID": "8a9d2f4e-...",
///   "resourceGroups": ["prod"],
///   "disableCustomSANs": true
/// }
/// ```
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Azure {
    /// Must equal [`TYPE_TAG`].
    #[serde(rename = "type")]
    pub typ: String,
    /// Human-readable name, unique within the CA.
    pub name: String,
    /// Expected tenant GUID.
    #[serde(rename = "tenantID")]
    pub tenant_id: String,
    /// Allowed resource groups; empty means any group is allowed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_groups: Vec<String>,
    /// Token audience; defaults to the public cloud management API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    /// When set, issued certificates carry only the VM name as subject and
    /// SAN.
    #[serde(default, rename = "disableCustomSANs")]
    pub disable_custom_sans: bool,
    /// When set, tokens are not single-use and `token_id` returns `jti`.
    #[serde(default)]
    pub disable_trust_on_first_use: bool,
    /// Claim overrides applied atop the CA-wide defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<Claims>,

    #[serde(skip)]
    endpoints: Option<AzureEndpoints>,
    #[serde(skip)]
    tofu: Option<Arc<dyn TofuStore>>,
    #[serde(skip)]
    state: Option<Runtime>,
}

impl Azure {
    /// Create a provisioner with the given name and tenant; everything else
    /// at its default.
    pub fn new(name: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            typ: TYPE_TAG.to_string(),
            name: name.into(),
            tenant_id: tenant_id.into(),
            resource_groups: Vec::new(),
            audience: None,
            disable_custom_sans: false,
            disable_trust_on_first_use: false,
            claims: None,
            endpoints: None,
            tofu: None,
            state: None,
        }
    }

    /// Override the default endpoints (sovereign clouds, tests).
    pub fn set_endpoints(&mut self, endpoints: AzureEndpoints) {
        self.endpoints = Some(endpoints);
    }

    /// Plug in a replay-guard backend; defaults to the in-memory store.
    pub fn set_tofu_store(&mut self, store: Arc<dyn TofuStore>) {
        self.tofu = Some(store);
    }

    /// Effective audience.
    pub fn audience(&self) -> &str {
        self.audience.as_deref().unwrap_or(DEFAULT_AUDIENCE)
    }

    /// Stable provisioner id: the tenant GUID.
    pub fn id(&self) -> &str {
        &self.tenant_id
    }

    /// Provisioner name.
    pub fn provisioner_name(&self) -> &str {
        &self.name
    }

    /// Provisioner kind.
    pub fn provisioner_type(&self) -> ProvisionerType {
        ProvisionerType::Azure
    }

    /// This provisioner kind has no symmetric encryption key.
    pub fn encrypted_key(&self) -> Option<(String, String)> {
        None
    }

    fn resolved_endpoints(&self) -> AzureEndpoints {
        self.endpoints
            .clone()
            .unwrap_or_else(|| AzureEndpoints::new(&self.tenant_id, self.audience()))
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.state.as_ref().ok_or_else(|| {
            Error::new(
                ErrorKind::ConfigInvalid,
                format!("azure provisioner {:?} is not initialized", self.name),
            )
        })
    }

    /// Validate the configuration and warm up discovery and the key store.
    ///
    /// Idempotent: calling it again re-runs discovery and replaces the
    /// runtime state.
    pub async fn init(&mut self, global: &Claims) -> Result<()> {
        const P: &str = "azure.init";

        if self.typ.is_empty() {
            return Err(Error::new(
                ErrorKind::ConfigInvalid,
                format!("{P}; provisioner type cannot be empty"),
            ));
        }
        if self.typ != TYPE_TAG {
            return Err(Error::new(
                ErrorKind::ConfigInvalid,
                format!("{P}; unexpected provisioner type {:?}", self.typ),
            ));
        }
        if self.name.is_empty() {
            return Err(Error::new(
                ErrorKind::ConfigInvalid,
                format!("{P}; provisioner name cannot be empty"),
            ));
        }
        if self.tenant_id.is_empty() {
            return Err(Error::new(
                ErrorKind::ConfigInvalid,
                format!("{P}; provisioner tenantID cannot be empty"),
            ));
        }

        let claimer = Claimer::new(self.claims.as_ref(), global).map_err(|e| e.prefixed(P))?;

        let endpoints = self.resolved_endpoints();
        let http = reqwest::Client::builder()
            .timeout(endpoints.http_timeout)
            .build()
            .map_err(|e| {
                Error::with_source(
                    ErrorKind::ConfigInvalid,
                    format!("{P}; failed to build HTTP client"),
                    e,
                )
            })?;

        let discovery = discovery::fetch(&http, &endpoints.oidc_discovery_url)
            .await
            .map_err(|e| e.prefixed(P))?;
        let key_store = KeyStore::bootstrap(http.clone(), discovery.jwks_uri.clone())
            .await
            .map_err(|e| e.prefixed(P))?;

        let tofu = self
            .tofu
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryTofuStore::new()));

        info!(
            provisioner = %self.name,
            issuer = %discovery.issuer,
            "initialized azure provisioner"
        );
        self.state = Some(Runtime {
            endpoints,
            http,
            discovery,
            key_store,
            claimer,
            tofu,
        });
        Ok(())
    }

    /// Derive the stable request identity from a token, without verifying
    /// the signature. With trust-on-first-use disabled the token's `jti` is
    /// the identity; otherwise it is the SHA-256 of `xms_mirid`.
    pub fn token_id(&self, token: &str) -> Result<String> {
        const P: &str = "azure.getTokenID";

        let claims = AzureClaims::from_compact_unverified(token).map_err(|e| {
            Error::with_source(
                ErrorKind::TokenMalformed,
                format!("{P}; error parsing azure token"),
                e,
            )
        })?;
        if self.disable_trust_on_first_use {
            return claims
                .standard
                .jti
                .filter(|jti| !jti.is_empty())
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::TokenPolicy,
                        format!("{P}; azure token has no jti claim"),
                    )
                });
        }
        match claims.xms_mirid.as_deref() {
            Some(mirid) if !mirid.is_empty() => Ok(derived_identity(mirid)),
            _ => Err(Error::new(
                ErrorKind::TokenPolicy,
                format!("{P}; azure token has no xms_mirid claim"),
            )),
        }
    }

    /// Obtain a managed-identity access token from the instance metadata
    /// service. The token comes back opaque; the CA validates it when it is
    /// presented.
    ///
    /// `subject` and `ca_url` are part of the provisioner client interface
    /// and are not consumed by the metadata service.
    pub async fn identity_token(&self, _subject: &str, _ca_url: &str) -> Result<String> {
        const P: &str = "azure.getIdentityToken";

        let (http, url) = match &self.state {
            Some(rt) => (rt.http.clone(), rt.endpoints.identity_token_url.clone()),
            None => {
                let endpoints = self.resolved_endpoints();
                let http = reqwest::Client::builder()
                    .timeout(endpoints.http_timeout)
                    .build()
                    .map_err(|e| {
                        Error::with_source(
                            ErrorKind::ClientConfig,
                            format!("{P}; failed to build HTTP client"),
                            e,
                        )
                    })?;
                (http, endpoints.identity_token_url)
            }
        };
        imds::fetch_identity_token(&http, &url)
            .await
            .map_err(|e| e.prefixed(P))
    }

    /// Verify a token and enforce the claim policy. Returns the claims, the
    /// VM name and the resource group decoded from `xms_mirid`.
    async fn authorize_token(&self, token: &str) -> Result<(AzureClaims, String, String)> {
        const P: &str = "azure.authorizeToken";

        let rt = self.runtime()?;

        let header = decode_header(token).map_err(|e| {
            Error::with_source(
                ErrorKind::TokenMalformed,
                format!("{P}; error parsing azure token"),
                e,
            )
        })?;
        let kid = header.kid.as_deref().ok_or_else(|| {
            Error::new(
                ErrorKind::TokenMalformed,
                format!("{P}; error parsing azure token - header has no kid"),
            )
        })?;

        let key = rt.key_store.key(kid).await.map_err(|e| {
            Error::with_source(
                ErrorKind::TokenUnverifiable,
                format!("{P}; cannot validate azure token"),
                e,
            )
        })?;
        // The header algorithm is only trusted when it matches what the
        // JWKS advertises for this key.
        if key.algorithm != header.alg {
            return Err(Error::new(
                ErrorKind::TokenUnverifiable,
                format!("{P}; cannot validate azure token - unexpected algorithm"),
            ));
        }

        let mut validation = Validation::new(key.algorithm);
        validation.leeway = CLOCK_SKEW.as_secs();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_issuer(&[&rt.discovery.issuer]);
        validation.set_audience(&[self.audience()]);

        let data = decode::<AzureClaims>(token, &key.key, &validation).map_err(|e| {
            let (kind, message) = match e.kind() {
                JwtErrorKind::ExpiredSignature
                | JwtErrorKind::ImmatureSignature
                | JwtErrorKind::InvalidIssuer
                | JwtErrorKind::InvalidAudience
                | JwtErrorKind::MissingRequiredClaim(_) => (
                    ErrorKind::TokenPolicy,
                    format!("{P}; failed to validate azure token payload"),
                ),
                JwtErrorKind::InvalidSignature
                | JwtErrorKind::InvalidAlgorithm
                | JwtErrorKind::InvalidEcdsaKey
                | JwtErrorKind::InvalidRsaKey(_)
                | JwtErrorKind::InvalidKeyFormat => (
                    ErrorKind::TokenUnverifiable,
                    format!("{P}; cannot validate azure token"),
                ),
                _ => (
                    ErrorKind::TokenMalformed,
                    format!("{P}; error parsing azure token"),
                ),
            };
            Error::with_source(kind, message, e)
        })?;
        let claims = data.claims;

        let tid = claims.tid.as_deref().unwrap_or_default();
        if !tid.eq_ignore_ascii_case(&self.tenant_id) {
            return Err(Error::new(
                ErrorKind::TokenPolicy,
                format!("{P}; azure token validation failed - invalid tenant id claim (tid)"),
            ));
        }

        let raw_mirid = claims.xms_mirid.clone().unwrap_or_default();
        let resource: VmResourceId = raw_mirid.parse().map_err(|e| {
            Error::with_source(
                ErrorKind::TokenPolicy,
                format!("{P}; error parsing xms_mirid claim - {raw_mirid}"),
                e,
            )
        })?;

        if !self.resource_groups.is_empty()
            && !self
                .resource_groups
                .iter()
                .any(|g| g == &resource.resource_group)
        {
            return Err(Error::new(
                ErrorKind::TokenPolicy,
                format!("{P}; azure token validation failed - invalid resource group"),
            ));
        }

        if !self.disable_trust_on_first_use {
            let identity = derived_identity(&raw_mirid);
            let expires_at = claims
                .expires_at()
                .unwrap_or_else(|| SystemTime::now() + CLOCK_SKEW);
            if !rt.tofu.insert_if_absent(&identity, expires_at) {
                return Err(Error::new(
                    ErrorKind::TokenReplay,
                    format!("{P}; token has already been used"),
                ));
            }
        }

        debug!(
            provisioner = %self.name,
            vm = %resource.resource_name,
            resource_group = %resource.resource_group,
            "authorized azure token"
        );
        Ok((claims, resource.resource_name, resource.resource_group))
    }

    /// Authorize an X.509 signing request, returning the ordered constraint
    /// list the CA applies during templating and validation.
    pub async fn authorize_sign(&self, token: &str) -> Result<Vec<SignConstraint>> {
        let (_claims, vm_name, _group) = self.authorize_token(token).await?;
        let rt = self.runtime()?;

        let extension = ProvisionerExtension {
            provisioner_type: ProvisionerType::Azure,
            name: self.name.clone(),
            credential_id: self.tenant_id.clone(),
            key_value_pairs: Vec::new(),
        };
        let locked = self.disable_custom_sans.then_some(vm_name.as_str());
        Ok(compile_x509(extension, &rt.claimer, locked))
    }

    /// Authorize a certificate renewal. No token is required; only the
    /// claimer is consulted.
    pub fn authorize_renew(&self) -> Result<()> {
        let rt = self.runtime()?;
        if rt.claimer.renewal_disabled() {
            return Err(Error::new(
                ErrorKind::RenewDisabled,
                format!(
                    "azure.authorizeRenew; renew is disabled for azure provisioner {:?}",
                    self.name
                ),
            ));
        }
        Ok(())
    }

    /// Authorize an SSH signing request, returning the compiled SSH policy
    /// (defaults plus upper bound) for the signing pipeline.
    pub async fn authorize_ssh_sign(&self, token: &str) -> Result<SshPolicy> {
        let rt = self.runtime()?;
        if !rt.claimer.ssh_ca_enabled() {
            return Err(Error::new(
                ErrorKind::SshDisabled,
                format!(
                    "azure.authorizeSSHSign; sshCA is disabled for azure provisioner {:?}",
                    self.name
                ),
            ));
        }
        let (_claims, vm_name, _group) = self.authorize_token(token).await?;
        Ok(SshPolicy::compile(
            &vm_name,
            &rt.claimer,
            !self.disable_custom_sans,
            SystemTime::now(),
        ))
    }
}
