//! JWKS key store
//!
//! Holds the tenant's verification keys, indexed by `kid`. The set is
//! fetched once at `init` and refetched at most once per lookup that
//! misses, which is how key rotation is absorbed: a token signed with a
//! fresh key forces one refetch, every other caller waits for that result.
//!
//! Concurrency model: readers take the shared lock; a refresh computes the
//! replacement map with no lock held beyond the single-flight mutex and
//! swaps it in whole, so readers never observe a half-refreshed set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk, JwkSet, KeyAlgorithm};
use jsonwebtoken::{Algorithm, DecodingKey};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, ErrorKind, Result};

/// A decoded verification key plus the algorithm its JWKS entry advertises.
///
/// Tokens must be verified with this algorithm; the header's `alg` is only
/// trusted when it matches.
pub(crate) struct VerificationKey {
    pub key: DecodingKey,
    pub algorithm: Algorithm,
}

impl std::fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationKey")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

struct KeySetState {
    keys: Arc<HashMap<String, Arc<VerificationKey>>>,
    refreshed_at: SystemTime,
    epoch: u64,
}

/// Cached JWKS with refresh-on-miss.
pub(crate) struct KeyStore {
    jwks_uri: String,
    client: reqwest::Client,
    state: RwLock<KeySetState>,
    // Single-flight guard: at most one refetch in flight, concurrent
    // missers wait for its result instead of stampeding the tenant.
    refresh: Mutex<()>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("jwks_uri", &self.jwks_uri)
            .finish_non_exhaustive()
    }
}

impl KeyStore {
    /// Fetch the JWKS once and build the store. Fails when the endpoint is
    /// unreachable or the set contains no usable key.
    pub(crate) async fn bootstrap(client: reqwest::Client, jwks_uri: String) -> Result<Self> {
        let keys = fetch_key_map(&client, &jwks_uri).await?;
        if keys.is_empty() {
            return Err(Error::new(
                ErrorKind::ConfigInvalid,
                format!("JWKS at {jwks_uri} contains no usable verification keys"),
            ));
        }
        info!(jwks_uri = %jwks_uri, key_count = keys.len(), "loaded JWKS");
        Ok(Self {
            jwks_uri,
            client,
            state: RwLock::new(KeySetState {
                keys: Arc::new(keys),
                refreshed_at: SystemTime::now(),
                epoch: 0,
            }),
            refresh: Mutex::new(()),
        })
    }

    /// Number of cached verification keys.
    pub(crate) async fn len(&self) -> usize {
        self.state.read().await.keys.len()
    }

    /// When the set was last (re)fetched.
    pub(crate) async fn refreshed_at(&self) -> SystemTime {
        self.state.read().await.refreshed_at
    }

    async fn lookup(&self, kid: &str) -> (Option<Arc<VerificationKey>>, u64) {
        let state = self.state.read().await;
        (state.keys.get(kid).cloned(), state.epoch)
    }

    /// Resolve a `kid` to its verification key, refetching the JWKS at most
    /// once when the key is not cached.
    pub(crate) async fn key(&self, kid: &str) -> Result<Arc<VerificationKey>> {
        let (hit, seen_epoch) = self.lookup(kid).await;
        if let Some(key) = hit {
            return Ok(key);
        }

        let _flight = self.refresh.lock().await;

        // A concurrent misser may have refreshed while we waited; share its
        // result rather than refetching again.
        let (hit, epoch) = self.lookup(kid).await;
        if let Some(key) = hit {
            return Ok(key);
        }
        if epoch == seen_epoch {
            debug!(jwks_uri = %self.jwks_uri, kid = kid, "kid not cached, refetching JWKS");
            let keys = fetch_key_map(&self.client, &self.jwks_uri)
                .await
                .map_err(|e| {
                    Error::with_source(
                        ErrorKind::TokenUnverifiable,
                        "failed to refresh JWKS",
                        e,
                    )
                })?;
            let mut state = self.state.write().await;
            state.keys = Arc::new(keys);
            state.refreshed_at = SystemTime::now();
            state.epoch += 1;
        }
        drop(_flight);

        let (hit, _) = self.lookup(kid).await;
        hit.ok_or_else(|| {
            Error::new(
                ErrorKind::TokenUnverifiable,
                format!("no verification key found for kid {kid:?}"),
            )
        })
    }
}

/// Map a JWKS entry's advertised algorithm to the verification algorithm,
/// falling back to the conventional default for the key type when the entry
/// omits `alg`. Entries that advertise an algorithm this provisioner cannot
/// verify are rejected here, at parse time.
fn advertised_algorithm(jwk: &Jwk) -> Option<Algorithm> {
    if let Some(alg) = jwk.common.key_algorithm {
        return match alg {
            KeyAlgorithm::RS256 => Some(Algorithm::RS256),
            KeyAlgorithm::RS384 => Some(Algorithm::RS384),
            KeyAlgorithm::RS512 => Some(Algorithm::RS512),
            KeyAlgorithm::PS256 => Some(Algorithm::PS256),
            KeyAlgorithm::PS384 => Some(Algorithm::PS384),
            KeyAlgorithm::PS512 => Some(Algorithm::PS512),
            KeyAlgorithm::ES256 => Some(Algorithm::ES256),
            KeyAlgorithm::ES384 => Some(Algorithm::ES384),
            KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
            _ => None,
        };
    }
    match &jwk.algorithm {
        AlgorithmParameters::RSA(_) => Some(Algorithm::RS256),
        AlgorithmParameters::EllipticCurve(params) => match params.curve {
            EllipticCurve::P256 => Some(Algorithm::ES256),
            EllipticCurve::P384 => Some(Algorithm::ES384),
            _ => None,
        },
        AlgorithmParameters::OctetKeyPair(_) => Some(Algorithm::EdDSA),
        _ => None,
    }
}

async fn fetch_key_map(
    client: &reqwest::Client,
    jwks_uri: &str,
) -> Result<HashMap<String, Arc<VerificationKey>>> {
    let response = client.get(jwks_uri).send().await.map_err(|e| {
        Error::with_source(
            ErrorKind::ConfigInvalid,
            format!("failed to fetch JWKS from {jwks_uri}"),
            e,
        )
    })?;
    if !response.status().is_success() {
        return Err(Error::new(
            ErrorKind::ConfigInvalid,
            format!("JWKS endpoint {jwks_uri} returned status {}", response.status()),
        ));
    }
    let jwks: JwkSet = response.json().await.map_err(|e| {
        Error::with_source(
            ErrorKind::ConfigInvalid,
            format!("invalid JWKS document from {jwks_uri}"),
            e,
        )
    })?;

    let mut keys = HashMap::new();
    for jwk in &jwks.keys {
        let Some(kid) = jwk.common.key_id.clone() else {
            warn!(jwks_uri = %jwks_uri, "skipping JWKS entry without kid");
            continue;
        };
        let Some(algorithm) = advertised_algorithm(jwk) else {
            warn!(jwks_uri = %jwks_uri, kid = %kid, "rejecting JWKS entry with unsupported algorithm");
            continue;
        };
        match DecodingKey::from_jwk(jwk) {
            Ok(key) => {
                keys.insert(kid, Arc::new(VerificationKey { key, algorithm }));
            }
            Err(e) => {
                warn!(jwks_uri = %jwks_uri, kid = %kid, error = %e, "rejecting undecodable JWKS entry");
            }
        }
    }
    Ok(keys)
}
