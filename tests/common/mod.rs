//! Shared test infrastructure
//!
//! A wiremock stand-in for the Azure endpoints the provisioner talks to
//! (OIDC discovery, JWKS, instance-metadata identity token), plus RSA key
//! generation and token minting.

#![allow(dead_code)]

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use azure_provisioner::{Azure, AzureEndpoints, Claims, DEFAULT_AUDIENCE};

/// The resource path baked into happy-path tokens.
pub const VM_MIRID: &str = "/subscriptions/subscriptionID/resourceGroups/resourceGroup/providers/Microsoft.Compute/virtualMachines/virtualMachine";

/// An RSA signing key with its JWKS representation.
pub struct TestKey {
    pub kid: String,
    pub encoding: EncodingKey,
    pub jwk: serde_json::Value,
}

pub fn generate_rsa_key(kid: &str) -> TestKey {
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, 2048).expect("generate RSA key");
    let pem = private
        .to_pkcs8_pem(LineEnding::LF)
        .expect("encode private key");
    let encoding = EncodingKey::from_rsa_pem(pem.as_bytes()).expect("load private key");

    let public = private.to_public_key();
    let jwk = json!({
        "kty": "RSA",
        "use": "sig",
        "alg": "RS256",
        "kid": kid,
        "n": URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
        "e": URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
    });

    TestKey {
        kid: kid.to_string(),
        encoding,
        jwk,
    }
}

/// The key the mock tenant publishes in its JWKS. Generated once per test
/// binary; RSA keygen is not cheap.
pub fn tenant_key() -> &'static TestKey {
    static KEY: OnceLock<TestKey> = OnceLock::new();
    KEY.get_or_init(|| generate_rsa_key("key-1"))
}

/// A keypair the tenant does NOT publish, for bad-signature cases.
pub fn rogue_key() -> &'static TestKey {
    static KEY: OnceLock<TestKey> = OnceLock::new();
    KEY.get_or_init(|| generate_rsa_key("rogue-key"))
}

/// Sign `claims` with `key`, putting its kid in the header.
pub fn sign_token(key: &TestKey, claims: &serde_json::Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(key.kid.clone());
    jsonwebtoken::encode(&header, claims, &key.encoding).expect("sign token")
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_secs() as i64
}

/// The Azure-flavored payload the metadata service would mint, with
/// `iat`/`nbf` at now + `now_offset_secs` and a five minute lifetime.
pub fn azure_claims(
    issuer: &str,
    audience: &str,
    tenant: &str,
    mirid: &str,
    now_offset_secs: i64,
) -> serde_json::Value {
    let now = unix_now() + now_offset_secs;
    json!({
        "iss": issuer,
        "sub": "subject",
        "aud": audience,
        "iat": now,
        "nbf": now,
        "exp": now + 300,
        "jti": "the-jti",
        "appid": "the-appid",
        "appidacr": "the-appidacr",
        "idp": "the-idp",
        "oid": "the-oid",
        "tid": tenant,
        "ver": "the-version",
        "xms_mirid": mirid,
    })
}

/// Mock Azure tenant: discovery, JWKS, and an identity-token endpoint.
pub struct MockAzure {
    pub server: MockServer,
    pub issuer: String,
}

impl MockAzure {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let uri = server.uri();
        let issuer = format!("{uri}/tenant-1/v2.0");

        Mock::given(method("GET"))
            .and(path("/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": issuer,
                "jwks_uri": format!("{uri}/jwks"),
                "token_endpoint": format!("{uri}/token"),
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "keys": [tenant_key().jwk],
            })))
            .mount(&server)
            .await;

        // degenerate discovery documents for init failure cases
        Mock::given(method("GET"))
            .and(path("/openid-configuration-no-issuer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jwks_uri": format!("{uri}/jwks"),
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/openid-configuration-bad-jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": issuer,
                "jwks_uri": format!("{uri}/missing-jwks"),
            })))
            .mount(&server)
            .await;

        Self { server, issuer }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Endpoints pointing every fetch at this mock.
    pub fn endpoints(&self) -> AzureEndpoints {
        AzureEndpoints::new("tenant-1", DEFAULT_AUDIENCE)
            .with_oidc_discovery_url(format!("{}/openid-configuration", self.uri()))
            .with_identity_token_url(format!("{}/identity-token", self.uri()))
    }

    /// Serve `body` with `status` from the identity-token endpoint.
    pub async fn mount_identity_token(&self, status: u16, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/identity-token"))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(&self.server)
            .await;
    }

    /// Serve a non-JSON identity-token response.
    pub async fn mount_identity_token_raw(&self, status: u16, body: &str) {
        Mock::given(method("GET"))
            .and(path("/identity-token"))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(&self.server)
            .await;
    }

    /// A well-formed token signed by the tenant key.
    pub fn valid_token(&self, tenant: &str) -> String {
        sign_token(
            tenant_key(),
            &azure_claims(&self.issuer, DEFAULT_AUDIENCE, tenant, VM_MIRID, 0),
        )
    }
}

/// Build and initialize a provisioner against the mock, applying `configure`
/// before `init`.
pub async fn init_provisioner<F>(mock: &MockAzure, configure: F) -> Azure
where
    F: FnOnce(&mut Azure),
{
    let mut azure = Azure::new("azure-test", "tenant-1");
    azure.set_endpoints(mock.endpoints());
    configure(&mut azure);
    azure
        .init(&Claims::global_defaults())
        .await
        .expect("init provisioner");
    azure
}
