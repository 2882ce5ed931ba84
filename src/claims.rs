//! Claim overrides and the claimer
//!
//! Each provisioner may override a subset of the CA-wide claim defaults
//! (certificate durations, renewal, SSH CA availability). The [`Claimer`]
//! folds the per-provisioner overrides over the global defaults at `init`
//! time and validates the result once, so the authorize paths read plain
//! values.

use std::fmt;
use std::time::Duration;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, ErrorKind, Result};

/// A certificate duration in the CA's configuration files.
///
/// Accepts either an integer number of seconds or a compact string such as
/// `"24h"`, `"5m"` or `"1h30m"`, and serializes back to the compact form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CertDuration(Duration);

impl CertDuration {
    /// Wrap a standard duration.
    pub const fn new(duration: Duration) -> Self {
        Self(duration)
    }

    /// The wrapped duration.
    pub const fn duration(self) -> Duration {
        self.0
    }

    fn parse(s: &str) -> Option<Duration> {
        if s.is_empty() {
            return None;
        }
        let mut total = Duration::ZERO;
        let mut rest = s;
        while !rest.is_empty() {
            let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
            if digits == 0 {
                return None;
            }
            let value: u64 = rest[..digits].parse().ok()?;
            rest = &rest[digits..];
            let unit = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()).len();
            let secs = match &rest[..unit] {
                "h" => 3600,
                "m" => 60,
                "s" => 1,
                _ => return None,
            };
            rest = &rest[unit..];
            total += Duration::from_secs(value * secs);
        }
        Some(total)
    }
}

impl From<Duration> for CertDuration {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl fmt::Display for CertDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        if secs == 0 {
            write!(f, "0s")
        } else if secs % 3600 == 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs % 60 == 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{}s", secs)
        }
    }
}

impl Serialize for CertDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CertDuration {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = CertDuration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration string like \"24h\" or a number of seconds")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
                Ok(CertDuration(Duration::from_secs(v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
                if v < 0 {
                    return Err(E::custom("duration cannot be negative"));
                }
                Ok(CertDuration(Duration::from_secs(v as u64)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                CertDuration::parse(v)
                    .map(CertDuration)
                    .ok_or_else(|| E::custom(format!("invalid duration {v:?}")))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

/// Per-provisioner claim overrides.
///
/// All fields are optional; anything left unset falls through to the CA-wide
/// defaults. Field names follow the CA's JSON configuration schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Claims {
    #[serde(rename = "defaultTLSCertDuration", skip_serializing_if = "Option::is_none")]
    pub default_tls_cert_duration: Option<CertDuration>,
    #[serde(rename = "minTLSCertDuration", skip_serializing_if = "Option::is_none")]
    pub min_tls_cert_duration: Option<CertDuration>,
    #[serde(rename = "maxTLSCertDuration", skip_serializing_if = "Option::is_none")]
    pub max_tls_cert_duration: Option<CertDuration>,
    #[serde(rename = "disableRenewal", skip_serializing_if = "Option::is_none")]
    pub disable_renewal: Option<bool>,
    #[serde(rename = "enableSSHCA", skip_serializing_if = "Option::is_none")]
    pub enable_ssh_ca: Option<bool>,
    #[serde(rename = "defaultHostSSHCertDuration", skip_serializing_if = "Option::is_none")]
    pub default_host_ssh_cert_duration: Option<CertDuration>,
    #[serde(rename = "minHostSSHCertDuration", skip_serializing_if = "Option::is_none")]
    pub min_host_ssh_cert_duration: Option<CertDuration>,
    #[serde(rename = "maxHostSSHCertDuration", skip_serializing_if = "Option::is_none")]
    pub max_host_ssh_cert_duration: Option<CertDuration>,
    #[serde(rename = "defaultUserSSHCertDuration", skip_serializing_if = "Option::is_none")]
    pub default_user_ssh_cert_duration: Option<CertDuration>,
    #[serde(rename = "minUserSSHCertDuration", skip_serializing_if = "Option::is_none")]
    pub min_user_ssh_cert_duration: Option<CertDuration>,
    #[serde(rename = "maxUserSSHCertDuration", skip_serializing_if = "Option::is_none")]
    pub max_user_ssh_cert_duration: Option<CertDuration>,
}

const HOUR: Duration = Duration::from_secs(3600);
const MINUTE: Duration = Duration::from_secs(60);

impl Claims {
    /// The CA-wide defaults used when neither the provisioner nor the CA
    /// configuration overrides a field.
    pub fn global_defaults() -> Self {
        Self {
            default_tls_cert_duration: Some(CertDuration(24 * HOUR)),
            min_tls_cert_duration: Some(CertDuration(5 * MINUTE)),
            max_tls_cert_duration: Some(CertDuration(24 * HOUR)),
            disable_renewal: Some(false),
            enable_ssh_ca: Some(true),
            default_host_ssh_cert_duration: Some(CertDuration(30 * 24 * HOUR)),
            min_host_ssh_cert_duration: Some(CertDuration(5 * MINUTE)),
            max_host_ssh_cert_duration: Some(CertDuration(30 * 24 * HOUR)),
            default_user_ssh_cert_duration: Some(CertDuration(16 * HOUR)),
            min_user_ssh_cert_duration: Some(CertDuration(5 * MINUTE)),
            max_user_ssh_cert_duration: Some(CertDuration(24 * HOUR)),
        }
    }

    fn merged_over(&self, global: &Claims) -> Claims {
        let defaults = Claims::global_defaults();
        let pick = |ours: Option<CertDuration>,
                    theirs: Option<CertDuration>,
                    fallback: Option<CertDuration>| {
            ours.or(theirs).or(fallback)
        };
        Claims {
            default_tls_cert_duration: pick(
                self.default_tls_cert_duration,
                global.default_tls_cert_duration,
                defaults.default_tls_cert_duration,
            ),
            min_tls_cert_duration: pick(
                self.min_tls_cert_duration,
                global.min_tls_cert_duration,
                defaults.min_tls_cert_duration,
            ),
            max_tls_cert_duration: pick(
                self.max_tls_cert_duration,
                global.max_tls_cert_duration,
                defaults.max_tls_cert_duration,
            ),
            disable_renewal: self
                .disable_renewal
                .or(global.disable_renewal)
                .or(defaults.disable_renewal),
            enable_ssh_ca: self
                .enable_ssh_ca
                .or(global.enable_ssh_ca)
                .or(defaults.enable_ssh_ca),
            default_host_ssh_cert_duration: pick(
                self.default_host_ssh_cert_duration,
                global.default_host_ssh_cert_duration,
                defaults.default_host_ssh_cert_duration,
            ),
            min_host_ssh_cert_duration: pick(
                self.min_host_ssh_cert_duration,
                global.min_host_ssh_cert_duration,
                defaults.min_host_ssh_cert_duration,
            ),
            max_host_ssh_cert_duration: pick(
                self.max_host_ssh_cert_duration,
                global.max_host_ssh_cert_duration,
                defaults.max_host_ssh_cert_duration,
            ),
            default_user_ssh_cert_duration: pick(
                self.default_user_ssh_cert_duration,
                global.default_user_ssh_cert_duration,
                defaults.default_user_ssh_cert_duration,
            ),
            min_user_ssh_cert_duration: pick(
                self.min_user_ssh_cert_duration,
                global.min_user_ssh_cert_duration,
                defaults.min_user_ssh_cert_duration,
            ),
            max_user_ssh_cert_duration: pick(
                self.max_user_ssh_cert_duration,
                global.max_user_ssh_cert_duration,
                defaults.max_user_ssh_cert_duration,
            ),
        }
    }
}

/// Resolved claim values for one provisioner.
#[derive(Debug, Clone)]
pub struct Claimer {
    merged: Claims,
}

impl Claimer {
    /// Fold `overrides` over the CA-wide `global` claims and validate the
    /// result.
    pub fn new(overrides: Option<&Claims>, global: &Claims) -> Result<Self> {
        let merged = overrides.unwrap_or(&Claims::default()).merged_over(global);
        let claimer = Self { merged };
        claimer.validate()?;
        Ok(claimer)
    }

    fn validate(&self) -> Result<()> {
        let windows = [
            (
                "TLSCertDuration",
                self.min_tls_cert_duration(),
                self.default_tls_cert_duration(),
                self.max_tls_cert_duration(),
            ),
            (
                "HostSSHCertDuration",
                self.min_host_ssh_cert_duration(),
                self.default_host_ssh_cert_duration(),
                self.max_host_ssh_cert_duration(),
            ),
            (
                "UserSSHCertDuration",
                self.min_user_ssh_cert_duration(),
                self.default_user_ssh_cert_duration(),
                self.max_user_ssh_cert_duration(),
            ),
        ];
        for (label, min, default, max) in windows {
            if min.is_zero() || default.is_zero() || max.is_zero() {
                return Err(Error::new(
                    ErrorKind::ConfigInvalid,
                    format!("claims: {label} durations must be greater than 0"),
                ));
            }
            if min > max || default < min || default > max {
                return Err(Error::new(
                    ErrorKind::ConfigInvalid,
                    format!(
                        "claims: default{label} must fall between min{label} and max{label}"
                    ),
                ));
            }
        }
        Ok(())
    }

    fn get(&self, field: Option<CertDuration>) -> Duration {
        // merged_over guarantees every field is set
        field.map(CertDuration::duration).unwrap_or_default()
    }

    /// Default X.509 certificate duration.
    pub fn default_tls_cert_duration(&self) -> Duration {
        self.get(self.merged.default_tls_cert_duration)
    }

    /// Minimum X.509 certificate duration.
    pub fn min_tls_cert_duration(&self) -> Duration {
        self.get(self.merged.min_tls_cert_duration)
    }

    /// Maximum X.509 certificate duration.
    pub fn max_tls_cert_duration(&self) -> Duration {
        self.get(self.merged.max_tls_cert_duration)
    }

    /// Whether certificate renewal is disabled for this provisioner.
    pub fn renewal_disabled(&self) -> bool {
        self.merged.disable_renewal.unwrap_or(false)
    }

    /// Whether this provisioner may mint SSH certificates.
    pub fn ssh_ca_enabled(&self) -> bool {
        self.merged.enable_ssh_ca.unwrap_or(false)
    }

    /// Default SSH host certificate duration.
    pub fn default_host_ssh_cert_duration(&self) -> Duration {
        self.get(self.merged.default_host_ssh_cert_duration)
    }

    /// Minimum SSH host certificate duration.
    pub fn min_host_ssh_cert_duration(&self) -> Duration {
        self.get(self.merged.min_host_ssh_cert_duration)
    }

    /// Maximum SSH host certificate duration.
    pub fn max_host_ssh_cert_duration(&self) -> Duration {
        self.get(self.merged.max_host_ssh_cert_duration)
    }

    /// Default SSH user certificate duration.
    pub fn default_user_ssh_cert_duration(&self) -> Duration {
        self.get(self.merged.default_user_ssh_cert_duration)
    }

    /// Minimum SSH user certificate duration.
    pub fn min_user_ssh_cert_duration(&self) -> Duration {
        self.get(self.merged.min_user_ssh_cert_duration)
    }

    /// Maximum SSH user certificate duration.
    pub fn max_user_ssh_cert_duration(&self) -> Duration {
        self.get(self.merged.max_user_ssh_cert_duration)
    }
}
