//! Provisioner error type
//!
//! Every error surfaced from the public operations carries a stable
//! [`ErrorKind`] and an HTTP status code the CA uses verbatim in its
//! response. The status travels via the [`StatusCoded`] trait so the HTTP
//! layer never has to introspect messages.

use http::StatusCode;
use thiserror::Error;

/// Boxed underlying cause, kept for logging.
type Source = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Stable error categories.
///
/// The string form (`as_str`) is what audit pipelines key on; it never
/// changes for a given failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing/empty type, name or tenant, bad discovery document, bad claims.
    ConfigInvalid,
    /// Identity-token URL cannot be parsed.
    ClientConfig,
    /// Identity-token request failed at the transport level.
    ClientTransport,
    /// Identity-token endpoint returned a non-2xx status.
    ClientHttp,
    /// Identity-token response was not JSON or had no `access_token`.
    ClientDecode,
    /// The JWT could not be parsed.
    TokenMalformed,
    /// No matching verification key, or the signature does not verify.
    TokenUnverifiable,
    /// Issuer, audience, tenant, time window, resource group or `xms_mirid`
    /// violation.
    TokenPolicy,
    /// Trust-on-first-use hit: the derived identity was already seen.
    TokenReplay,
    /// The claimer forbids renewal.
    RenewDisabled,
    /// The claimer forbids the SSH CA.
    SshDisabled,
}

impl ErrorKind {
    /// Stable snake_case identifier for this kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConfigInvalid => "config_invalid",
            ErrorKind::ClientConfig => "client_config",
            ErrorKind::ClientTransport => "client_transport",
            ErrorKind::ClientHttp => "client_http",
            ErrorKind::ClientDecode => "client_decode",
            ErrorKind::TokenMalformed => "token_malformed",
            ErrorKind::TokenUnverifiable => "token_unverifiable",
            ErrorKind::TokenPolicy => "token_policy",
            ErrorKind::TokenReplay => "token_replay",
            ErrorKind::RenewDisabled => "renew_disabled",
            ErrorKind::SshDisabled => "ssh_disabled",
        }
    }

    /// HTTP status the CA responds with for this kind.
    ///
    /// The `client_*` kinds never travel through the CA's HTTP layer (they
    /// happen on the requesting VM); they map to 500 so a misrouted one is
    /// visible.
    pub const fn status_code(self) -> StatusCode {
        match self {
            ErrorKind::ConfigInvalid
            | ErrorKind::ClientConfig
            | ErrorKind::ClientTransport
            | ErrorKind::ClientHttp
            | ErrorKind::ClientDecode => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::TokenMalformed
            | ErrorKind::TokenUnverifiable
            | ErrorKind::TokenPolicy
            | ErrorKind::TokenReplay
            | ErrorKind::RenewDisabled
            | ErrorKind::SshDisabled => StatusCode::UNAUTHORIZED,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Carrier interface for the HTTP status of an error.
///
/// The CA's response layer dispatches on this trait alone.
pub trait StatusCoded {
    /// HTTP status to respond with.
    fn status_code(&self) -> StatusCode;
}

/// Error returned by every public provisioner operation.
///
/// The message is short and domain-prefixed (for example
/// `"azure.authorizeToken; cannot validate azure token"`); the underlying
/// cause, when there is one, stays attached as the error source.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Source>,
}

impl Error {
    /// Create an error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Create an error that wraps an underlying cause.
    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl Into<Source>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Prepend an operation prefix to the message, keeping kind and source.
    pub(crate) fn prefixed(self, prefix: &str) -> Self {
        Self {
            kind: self.kind,
            message: format!("{prefix}; {}", self.message),
            source: self.source,
        }
    }
}

impl StatusCoded for Error {
    fn status_code(&self) -> StatusCode {
        self.kind.status_code()
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_expected_statuses() {
        assert_eq!(
            ErrorKind::ConfigInvalid.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        for kind in [
            ErrorKind::TokenMalformed,
            ErrorKind::TokenUnverifiable,
            ErrorKind::TokenPolicy,
            ErrorKind::TokenReplay,
            ErrorKind::RenewDisabled,
            ErrorKind::SshDisabled,
        ] {
            assert_eq!(kind.status_code(), StatusCode::UNAUTHORIZED);
        }
    }

    #[test]
    fn message_and_source_are_preserved() {
        let cause = std::io::Error::other("boom");
        let err = Error::with_source(
            ErrorKind::TokenUnverifiable,
            "azure.authorizeToken; cannot validate azure token",
            cause,
        );
        assert_eq!(
            err.to_string(),
            "azure.authorizeToken; cannot validate azure token"
        );
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.kind().as_str(), "token_unverifiable");
    }
}
