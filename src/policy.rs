//! Sign-time constraint compilation
//!
//! A successful authorization compiles into the bundle of constraints the
//! signing pipeline enforces. For X.509 that is an ordered list of tagged
//! variants the CA dispatches on by kind; for SSH it is an options record
//! used both as the default and as the upper bound for the request.

use std::net::IpAddr;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use ssh_key::public::KeyData;
use thiserror::Error;

use crate::claims::Claimer;
use crate::provisioner::ProvisionerType;

/// A sign request violated a compiled constraint.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ConstraintViolation(String);

impl ConstraintViolation {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Audit extension recorded into the issued certificate: which provisioner
/// authorized the request and under which credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionerExtension {
    /// Kind of the authorizing provisioner.
    pub provisioner_type: ProvisionerType,
    /// Provisioner name within the CA.
    pub name: String,
    /// Credential the requester authenticated under (the tenant id here).
    pub credential_id: String,
    /// Extra audit key/value pairs; none for this provisioner.
    pub key_value_pairs: Vec<String>,
}

/// Discriminant of a [`SignConstraint`]; the CA dispatches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    ProvisionerExtension,
    DefaultDuration,
    ValidityRange,
    DefaultPublicKey,
    CommonName,
    DnsNames,
    IpAddresses,
    EmailAddresses,
    Uris,
}

/// One entry of the compiled X.509 constraint list.
///
/// Default-style entries carry values the templating step applies;
/// validator-style entries are checked against the final request via
/// [`SignConstraint::validate`].
#[derive(Debug, Clone, PartialEq)]
pub enum SignConstraint {
    /// Audit marker recorded as a certificate extension.
    ProvisionerExtension(ProvisionerExtension),
    /// Certificate lifetime to apply when the request does not pick one.
    DefaultDuration(Duration),
    /// Bounds every requested lifetime must fall within.
    ValidityRange {
        min: Duration,
        max: Duration,
    },
    /// Accept any public key the CA considers acceptable.
    DefaultPublicKey,
    /// Subject common name locked to the decoded VM name.
    CommonName(String),
    /// DNS SANs locked to exactly this set.
    DnsNames(Vec<String>),
    /// IP SANs locked to exactly this set.
    IpAddresses(Vec<IpAddr>),
    /// Email SANs locked to exactly this set.
    EmailAddresses(Vec<String>),
    /// URI SANs locked to exactly this set.
    Uris(Vec<String>),
}

/// The fields of an X.509 sign request the compiled validators look at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct X509Request {
    pub common_name: String,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub email_addresses: Vec<String>,
    pub uris: Vec<String>,
}

fn same_members<T: Ord + Clone>(got: &[T], want: &[T]) -> bool {
    let mut got = got.to_vec();
    let mut want = want.to_vec();
    got.sort();
    want.sort();
    got == want
}

impl SignConstraint {
    /// The variant tag.
    pub fn kind(&self) -> ConstraintKind {
        match self {
            SignConstraint::ProvisionerExtension(_) => ConstraintKind::ProvisionerExtension,
            SignConstraint::DefaultDuration(_) => ConstraintKind::DefaultDuration,
            SignConstraint::ValidityRange { .. } => ConstraintKind::ValidityRange,
            SignConstraint::DefaultPublicKey => ConstraintKind::DefaultPublicKey,
            SignConstraint::CommonName(_) => ConstraintKind::CommonName,
            SignConstraint::DnsNames(_) => ConstraintKind::DnsNames,
            SignConstraint::IpAddresses(_) => ConstraintKind::IpAddresses,
            SignConstraint::EmailAddresses(_) => ConstraintKind::EmailAddresses,
            SignConstraint::Uris(_) => ConstraintKind::Uris,
        }
    }

    /// Check a request against this constraint. Default-style entries pass
    /// unconditionally; locking validators require the request's value to
    /// be unset or exactly the locked set.
    pub fn validate(&self, req: &X509Request) -> Result<(), ConstraintViolation> {
        match self {
            SignConstraint::ProvisionerExtension(_)
            | SignConstraint::DefaultDuration(_)
            | SignConstraint::ValidityRange { .. }
            | SignConstraint::DefaultPublicKey => Ok(()),
            SignConstraint::CommonName(want) => {
                if req.common_name.is_empty() || req.common_name == *want {
                    Ok(())
                } else {
                    Err(ConstraintViolation::new(format!(
                        "certificate request does not contain the valid common name; want {want:?} but got {:?}",
                        req.common_name
                    )))
                }
            }
            SignConstraint::DnsNames(want) => {
                if req.dns_names.is_empty() || same_members(&req.dns_names, want) {
                    Ok(())
                } else {
                    Err(ConstraintViolation::new(format!(
                        "certificate request does not contain the valid DNS names; want {want:?} but got {:?}",
                        req.dns_names
                    )))
                }
            }
            SignConstraint::IpAddresses(want) => {
                if req.ip_addresses.is_empty() || same_members(&req.ip_addresses, want) {
                    Ok(())
                } else {
                    Err(ConstraintViolation::new(format!(
                        "certificate request does not contain the valid IP addresses; want {want:?} but got {:?}",
                        req.ip_addresses
                    )))
                }
            }
            SignConstraint::EmailAddresses(want) => {
                if req.email_addresses.is_empty() || same_members(&req.email_addresses, want) {
                    Ok(())
                } else {
                    Err(ConstraintViolation::new(format!(
                        "certificate request does not contain the valid email addresses; want {want:?} but got {:?}",
                        req.email_addresses
                    )))
                }
            }
            SignConstraint::Uris(want) => {
                if req.uris.is_empty() || same_members(&req.uris, want) {
                    Ok(())
                } else {
                    Err(ConstraintViolation::new(format!(
                        "certificate request does not contain the valid URIs; want {want:?} but got {:?}",
                        req.uris
                    )))
                }
            }
        }
    }
}

/// Compile the X.509 constraint list.
///
/// Four entries always: the audit extension, the default duration, the
/// validity bounds and the public-key acceptance. When `locked_vm_name` is
/// set (custom SANs disabled) five locking validators follow: common name
/// and DNS SANs pinned to the VM name, IP/email/URI SANs pinned empty.
pub(crate) fn compile_x509(
    extension: ProvisionerExtension,
    claimer: &Claimer,
    locked_vm_name: Option<&str>,
) -> Vec<SignConstraint> {
    let mut constraints = vec![
        SignConstraint::ProvisionerExtension(extension),
        SignConstraint::DefaultDuration(claimer.default_tls_cert_duration()),
        SignConstraint::ValidityRange {
            min: claimer.min_tls_cert_duration(),
            max: claimer.max_tls_cert_duration(),
        },
        SignConstraint::DefaultPublicKey,
    ];
    if let Some(vm_name) = locked_vm_name {
        constraints.extend([
            SignConstraint::CommonName(vm_name.to_string()),
            SignConstraint::DnsNames(vec![vm_name.to_string()]),
            SignConstraint::IpAddresses(Vec::new()),
            SignConstraint::EmailAddresses(Vec::new()),
            SignConstraint::Uris(Vec::new()),
        ]);
    }
    constraints
}

/// SSH certificate type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SshCertType {
    User,
    Host,
}

impl std::fmt::Display for SshCertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SshCertType::User => f.write_str("user"),
            SshCertType::Host => f.write_str("host"),
        }
    }
}

/// Options of an SSH sign request; unset fields inherit the compiled
/// defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SshOptions {
    pub cert_type: Option<SshCertType>,
    pub principals: Vec<String>,
    pub valid_after: Option<SystemTime>,
    pub valid_before: Option<SystemTime>,
}

/// Compiled SSH policy: the defaults derived from the VM identity, applied
/// to the request and enforced as its upper bound.
#[derive(Debug, Clone)]
pub struct SshPolicy {
    defaults: SshOptions,
    allow_custom_principals: bool,
    min_rsa_bits: usize,
}

impl SshPolicy {
    pub(crate) fn compile(
        vm_name: &str,
        claimer: &Claimer,
        allow_custom_principals: bool,
        now: SystemTime,
    ) -> Self {
        let host_duration = claimer.default_host_ssh_cert_duration();
        Self {
            defaults: SshOptions {
                cert_type: Some(SshCertType::Host),
                principals: vec![vm_name.to_string()],
                valid_after: Some(now),
                valid_before: Some(now + host_duration),
            },
            allow_custom_principals,
            min_rsa_bits: 2048,
        }
    }

    /// The compiled defaults (host certificate for the VM name, validity
    /// window starting now).
    pub fn defaults(&self) -> &SshOptions {
        &self.defaults
    }

    /// Merge the request with the defaults, rejecting anything the policy
    /// does not allow: user certificates, principals outside the compiled
    /// set (unless custom principals are permitted), or validity outside
    /// the default window.
    pub fn apply(&self, requested: &SshOptions) -> Result<SshOptions, ConstraintViolation> {
        if requested.cert_type == Some(SshCertType::User) {
            return Err(ConstraintViolation::new(
                "ssh certificate type \"user\" is not allowed; this provisioner issues host certificates",
            ));
        }

        let principals = if requested.principals.is_empty() {
            self.defaults.principals.clone()
        } else if same_members(&requested.principals, &self.defaults.principals)
            || self.allow_custom_principals
        {
            requested.principals.clone()
        } else {
            return Err(ConstraintViolation::new(format!(
                "ssh certificate principals {:?} are not allowed; want {:?}",
                requested.principals, self.defaults.principals
            )));
        };

        let valid_after = requested.valid_after.unwrap_or_else(|| {
            self.defaults.valid_after.unwrap_or(SystemTime::UNIX_EPOCH)
        });
        let valid_before = requested.valid_before.unwrap_or_else(|| {
            self.defaults.valid_before.unwrap_or(SystemTime::UNIX_EPOCH)
        });
        let window_start = self.defaults.valid_after.unwrap_or(SystemTime::UNIX_EPOCH);
        let window_end = self.defaults.valid_before.unwrap_or(SystemTime::UNIX_EPOCH);
        if valid_after < window_start || valid_before > window_end || valid_after >= valid_before {
            return Err(ConstraintViolation::new(
                "ssh certificate validity is outside the allowed window",
            ));
        }

        Ok(SshOptions {
            cert_type: Some(SshCertType::Host),
            principals,
            valid_after: Some(valid_after),
            valid_before: Some(valid_before),
        })
    }

    /// Reject public keys below the configured strength: RSA under 2048
    /// bits and DSA keys.
    pub fn check_public_key(&self, key: &KeyData) -> Result<(), ConstraintViolation> {
        match key {
            KeyData::Rsa(rsa) => {
                let bits = rsa
                    .n
                    .as_positive_bytes()
                    .map(|bytes| bytes.len() * 8)
                    .unwrap_or(0);
                if bits < self.min_rsa_bits {
                    return Err(ConstraintViolation::new(format!(
                        "rsa public keys must be at least {} bits, got {bits}",
                        self.min_rsa_bits
                    )));
                }
                Ok(())
            }
            KeyData::Dsa(_) => Err(ConstraintViolation::new("dsa public keys are not supported")),
            _ => Ok(()),
        }
    }

    /// Full request check: merge with defaults and vet the public key, the
    /// way the signing pipeline consumes the policy.
    pub fn validate_request(
        &self,
        requested: &SshOptions,
        key: &KeyData,
    ) -> Result<SshOptions, ConstraintViolation> {
        self.check_public_key(key)?;
        self.apply(requested)
    }
}
