//! Azure token claim schema
//!
//! The payload is the standard JWT claim set composed with the
//! Azure-specific extras; `xms_mirid` is the one the provisioner lives on,
//! since it carries the VM's managed-identity resource path.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// The `aud` claim: a single string or an array of strings on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Audience(Vec<String>);

impl Audience {
    /// Case-sensitive membership test.
    pub fn contains(&self, audience: &str) -> bool {
        self.0.iter().any(|a| a == audience)
    }

    /// All audience values.
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl From<Vec<String>> for Audience {
    fn from(values: Vec<String>) -> Self {
        Self(values)
    }
}

impl Serialize for Audience {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // single audiences serialize back to the bare-string form
        if self.0.len() == 1 {
            serializer.serialize_str(&self.0[0])
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Audience {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AudienceVisitor;

        impl<'de> Visitor<'de> for AudienceVisitor {
            type Value = Audience;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a string or an array of strings")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(Audience(vec![v.to_string()]))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut values = Vec::new();
                while let Some(value) = seq.next_element::<String>()? {
                    values.push(value);
                }
                Ok(Audience(values))
            }
        }

        deserializer.deserialize_any(AudienceVisitor)
    }
}

/// Registered JWT claims (RFC 7519 subset the provisioner reads).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StandardClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "audience_is_empty")]
    pub aud: Audience,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

fn audience_is_empty(aud: &Audience) -> bool {
    aud.as_slice().is_empty()
}

/// The Azure-flavored payload: standard claims plus the managed-identity
/// extras.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AzureClaims {
    #[serde(flatten)]
    pub standard: StandardClaims,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appidacr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xms_mirid: Option<String>,
}

/// Failure to read a compact JWT's payload without verification.
#[derive(Debug, Error)]
pub enum TokenParseError {
    /// Not a three-segment compact serialization.
    #[error("token is not a three-segment compact JWT")]
    Format,
    /// Payload segment is not valid base64url.
    #[error("invalid base64 in token payload")]
    Encoding(#[from] base64::DecodeError),
    /// Payload is not a JSON claim set.
    #[error("invalid claims JSON in token payload")]
    Json(#[from] serde_json::Error),
}

impl AzureClaims {
    /// Decode the payload of a compact JWT **without** verifying the
    /// signature. Used where only the claim values are needed (token-id
    /// derivation); the authorize paths always verify first.
    pub fn from_compact_unverified(token: &str) -> Result<Self, TokenParseError> {
        let mut segments = token.split('.');
        let (Some(_), Some(payload), Some(_), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(TokenParseError::Format);
        };
        let bytes = URL_SAFE_NO_PAD.decode(payload)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Absolute expiry, when the token carries `exp`.
    pub fn expires_at(&self) -> Option<SystemTime> {
        self.standard
            .exp
            .map(|exp| UNIX_EPOCH + Duration::from_secs(exp))
    }
}

/// Stable request identity: lowercase hex SHA-256 of the raw `xms_mirid`
/// string.
pub fn derived_identity(xms_mirid: &str) -> String {
    hex::encode(Sha256::digest(xms_mirid.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audience_accepts_string_and_array() {
        let single: Audience = serde_json::from_str(r#""https://a/""#).unwrap();
        assert!(single.contains("https://a/"));
        assert!(!single.contains("https://a"));

        let many: Audience = serde_json::from_str(r#"["https://a/", "https://b/"]"#).unwrap();
        assert!(many.contains("https://b/"));
        assert_eq!(many.as_slice().len(), 2);
    }

    #[test]
    fn single_audience_serializes_as_string() {
        let aud = Audience::from(vec!["https://a/".to_string()]);
        assert_eq!(serde_json::to_string(&aud).unwrap(), r#""https://a/""#);
        let aud = Audience::from(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(serde_json::to_string(&aud).unwrap(), r#"["a","b"]"#);
    }

    #[test]
    fn claims_flatten_standard_and_extras() {
        let json = r#"{
            "iss": "https://sts.windows.net/t/",
            "sub": "subject",
            "aud": "https://management.azure.com/",
            "exp": 1700000300,
            "jti": "the-jti",
            "tid": "tenant",
            "xms_mirid": "/subscriptions/s/resourceGroups/g/providers/Microsoft.Compute/virtualMachines/vm"
        }"#;
        let claims: AzureClaims = serde_json::from_str(json).unwrap();
        assert_eq!(claims.standard.sub.as_deref(), Some("subject"));
        assert_eq!(claims.standard.jti.as_deref(), Some("the-jti"));
        assert_eq!(claims.tid.as_deref(), Some("tenant"));
        assert!(claims.xms_mirid.is_some());
        assert_eq!(
            claims.expires_at(),
            Some(UNIX_EPOCH + Duration::from_secs(1_700_000_300))
        );
    }

    #[test]
    fn unverified_parse_rejects_garbage() {
        assert!(matches!(
            AzureClaims::from_compact_unverified("foo"),
            Err(TokenParseError::Format)
        ));
        assert!(matches!(
            AzureClaims::from_compact_unverified("a.b.c.d"),
            Err(TokenParseError::Format)
        ));
        // header.payload.signature with an undecodable payload
        assert!(AzureClaims::from_compact_unverified("eyJhbGciOiJIUzI1NiJ9.ey.fooo").is_err());
    }

    #[test]
    fn derived_identity_is_lowercase_sha256_hex() {
        let id = derived_identity(
            "/subscriptions/subscriptionID/resourceGroups/resourceGroup/providers/Microsoft.Compute/virtualMachines/virtualMachine",
        );
        assert_eq!(id.len(), 64);
        assert_eq!(id, id.to_lowercase());
        // deterministic
        assert_eq!(
            id,
            derived_identity(
                "/subscriptions/subscriptionID/resourceGroups/resourceGroup/providers/Microsoft.Compute/virtualMachines/virtualMachine"
            )
        );
    }
}
