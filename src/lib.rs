//! # Azure Provisioner
//!
//! Azure managed-identity provisioner for a private certificate authority.
//! Virtual machines authenticate with the OIDC token their instance
//! metadata service hands out; on success the provisioner emits the bundle
//! of constraints the CA enforces when minting X.509 or SSH certificates.
//!
//! ## What it does
//!
//! - **OIDC discovery** - resolves the tenant's issuer and JWKS URI once at
//!   init ([`discovery`])
//! - **Key rotation** - caches the JWKS and refetches on `kid` miss, single
//!   flight
//! - **Token validation** - signature plus strict claim policy: issuer,
//!   audience, tenant, time window, `xms_mirid` shape, resource-group
//!   filter, optional trust-on-first-use replay protection
//! - **Policy compilation** - turns a validated token into the ordered
//!   constraint list (X.509) or options record (SSH) the signing pipeline
//!   consumes ([`policy`])
//! - **Client side** - fetches managed-identity tokens from the instance
//!   metadata endpoint ([`Azure::identity_token`])
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use azure_provisioner::{Azure, Claims};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut provisioner = Azure::new("azure-prod", "8a9d2f4e-0000-0000-0000-000000000000");
//! provisioner.resource_groups = vec!["prod".to_string()];
//! provisioner.disable_custom_sans = true;
//!
//! // Runs discovery and warms up the key store.
//! provisioner.init(&Claims::global_defaults()).await?;
//!
//! # let token = "eyJ...";
//! // The CA applies each constraint in turn while templating and
//! // validating the certificate.
//! let constraints = provisioner.authorize_sign(token).await?;
//! for constraint in &constraints {
//!     println!("{:?}", constraint.kind());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Error model
//!
//! Every public operation fails with an [`Error`] carrying a stable
//! [`ErrorKind`] and the HTTP status the CA answers with, exposed through
//! the [`StatusCoded`] carrier trait. Messages are short and
//! domain-prefixed (`"azure.authorizeToken; ..."`), with the underlying
//! cause preserved as the error source for logging.

pub mod claims;
pub mod config;
pub mod discovery;
pub mod error;
mod imds;
mod jwks;
pub mod mirid;
pub mod policy;
pub mod provisioner;
pub mod token;
pub mod tofu;

#[doc(inline)]
pub use claims::{CertDuration, Claimer, Claims};
#[doc(inline)]
pub use config::{AzureEndpoints, DEFAULT_AUDIENCE, DEFAULT_HTTP_TIMEOUT};
#[doc(inline)]
pub use discovery::DiscoveryDocument;
#[doc(inline)]
pub use error::{Error, ErrorKind, Result, StatusCoded};
#[doc(inline)]
pub use mirid::VmResourceId;
#[doc(inline)]
pub use policy::{
    ConstraintKind, ConstraintViolation, ProvisionerExtension, SignConstraint, SshCertType,
    SshOptions, SshPolicy, X509Request,
};
#[doc(inline)]
pub use provisioner::{Azure, ProvisionerType, TYPE_TAG};
#[doc(inline)]
pub use token::{Audience, AzureClaims, StandardClaims, derived_identity};
#[doc(inline)]
pub use tofu::{MemoryTofuStore, TofuStore};
