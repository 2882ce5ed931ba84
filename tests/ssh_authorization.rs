//! SSH authorization tests: compiled defaults, option merging, the
//! upper-bound validation and the public-key strength policy.

mod common;

use azure_provisioner::{Claims, ErrorKind, SshCertType, SshOptions, StatusCoded};
use common::{MockAzure, init_provisioner};
use ssh_key::PublicKey;

const RSA_1024: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAAAgQDHWu3krGwgeFPQNyZp/8EQDLGEMPX7fP0Zn7aqJxvMN6Q8J0JaiOJ+DWKVBspqvNT3+afQ16+Q29XT3ToNuqjVfsN4W3xpg8mkPFbcqjoJsnUmwipmnxhcHbAom9vqp2K6HvvTy4a2ptywZ0j8dn//ZrseSfXKrK1X6N5apS65cw== host";
const RSA_2048: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQDuSxpQ0kHjcZeict+fL+n9Ned1YhT/NfKRJrQFcLQF6D/7Wtv3euu8wijqky1p1eAh62Pf7iYoeMIQsdz8/SdjT2UvvKjV6on2f2lZFYfmZymZwG4lQ+C3FZ+3z+I5ggidm+9rhHSXXpbxbG7CV/ldpglA20wfR/EDAleAjwwNXP9hVJKn4qtNZ3DThUZe/2zrVKWmWt59NhphG+CtKH8nnBpBqiyadHrb3NLeZU8mY2xdF6wUigAVu5gZJIxqGbFB4t0ziO8jJecUpUWZVK3b6n0dgrLnO9z9eRNDN4PDOvf1gVcPxmi9G4QIB9CYclwMbgI7E6WSWeV3hN24Vt+L host";
const ED25519: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFut5Eby4jMBXQZmrbgYtrEDNsNQHfx/nGe+SBOVZLRP host";

fn key_data(openssh: &str) -> ssh_key::public::KeyData {
    PublicKey::from_openssh(openssh)
        .expect("parse fixture key")
        .key_data()
        .clone()
}

#[tokio::test]
async fn compiled_defaults_describe_a_host_cert_for_the_vm() {
    let mock = MockAzure::start().await;
    let azure = init_provisioner(&mock, |p| p.disable_custom_sans = true).await;

    let before_call = std::time::SystemTime::now();
    let policy = azure
        .authorize_ssh_sign(&mock.valid_token("tenant-1"))
        .await
        .unwrap();
    let after_call = std::time::SystemTime::now();

    let defaults = policy.defaults();
    assert_eq!(defaults.cert_type, Some(SshCertType::Host));
    assert_eq!(defaults.principals, vec!["virtualMachine".to_string()]);

    let valid_after = defaults.valid_after.unwrap();
    let valid_before = defaults.valid_before.unwrap();
    assert!(valid_after >= before_call && valid_after <= after_call);
    // the window is exactly the default host duration (30 days)
    assert_eq!(
        valid_before.duration_since(valid_after).unwrap(),
        std::time::Duration::from_secs(30 * 24 * 3600)
    );
}

#[tokio::test]
async fn conforming_requests_merge_with_the_defaults() {
    let mock = MockAzure::start().await;
    let azure = init_provisioner(&mock, |p| p.disable_custom_sans = true).await;
    let policy = azure
        .authorize_ssh_sign(&mock.valid_token("tenant-1"))
        .await
        .unwrap();
    let key = key_data(ED25519);

    // empty request inherits everything
    let merged = policy.validate_request(&SshOptions::default(), &key).unwrap();
    assert_eq!(&merged, policy.defaults());

    // explicitly matching options pass too
    for requested in [
        SshOptions {
            cert_type: Some(SshCertType::Host),
            ..Default::default()
        },
        SshOptions {
            principals: vec!["virtualMachine".to_string()],
            ..Default::default()
        },
        SshOptions {
            cert_type: Some(SshCertType::Host),
            principals: vec!["virtualMachine".to_string()],
            ..Default::default()
        },
    ] {
        let merged = policy.validate_request(&requested, &key).unwrap();
        assert_eq!(&merged, policy.defaults());
    }
}

#[tokio::test]
async fn violating_requests_fail_at_the_validator() {
    let mock = MockAzure::start().await;
    let azure = init_provisioner(&mock, |p| p.disable_custom_sans = true).await;
    let policy = azure
        .authorize_ssh_sign(&mock.valid_token("tenant-1"))
        .await
        .unwrap();
    let key = key_data(ED25519);

    let cases = [
        SshOptions {
            cert_type: Some(SshCertType::User),
            ..Default::default()
        },
        SshOptions {
            principals: vec!["bastion.internal".to_string()],
            ..Default::default()
        },
        SshOptions {
            principals: vec![
                "virtualMachine".to_string(),
                "bastion.internal".to_string(),
            ],
            ..Default::default()
        },
    ];
    for requested in cases {
        assert!(
            policy.validate_request(&requested, &key).is_err(),
            "accepted {requested:?}"
        );
    }
}

#[tokio::test]
async fn custom_principals_follow_the_san_flag() {
    let mock = MockAzure::start().await;
    let key = key_data(ED25519);
    let requested = SshOptions {
        principals: vec!["foo.bar".to_string()],
        ..Default::default()
    };

    // custom SANs allowed: the requested principal wins
    let azure = init_provisioner(&mock, |_| {}).await;
    let policy = azure
        .authorize_ssh_sign(&mock.valid_token("tenant-1"))
        .await
        .unwrap();
    let merged = policy.validate_request(&requested, &key).unwrap();
    assert_eq!(merged.principals, vec!["foo.bar".to_string()]);
    assert_eq!(merged.cert_type, Some(SshCertType::Host));

    // custom SANs disabled: the same request is rejected
    let azure = init_provisioner(&mock, |p| p.disable_custom_sans = true).await;
    let policy = azure
        .authorize_ssh_sign(&mock.valid_token("tenant-1"))
        .await
        .unwrap();
    assert!(policy.validate_request(&requested, &key).is_err());
}

#[tokio::test]
async fn weak_rsa_keys_are_rejected() {
    let mock = MockAzure::start().await;
    let azure = init_provisioner(&mock, |p| p.disable_custom_sans = true).await;
    let policy = azure
        .authorize_ssh_sign(&mock.valid_token("tenant-1"))
        .await
        .unwrap();

    policy.check_public_key(&key_data(RSA_2048)).unwrap();
    policy.check_public_key(&key_data(ED25519)).unwrap();

    let err = policy.check_public_key(&key_data(RSA_1024)).unwrap_err();
    assert!(err.to_string().contains("2048"), "unexpected message: {err}");

    // the full request path rejects the weak key too
    assert!(
        policy
            .validate_request(&SshOptions::default(), &key_data(RSA_1024))
            .is_err()
    );
}

#[tokio::test]
async fn ssh_ca_disabled_fails_before_touching_the_token() {
    let mock = MockAzure::start().await;
    let azure = init_provisioner(&mock, |p| {
        p.claims = Some(Claims {
            enable_ssh_ca: Some(false),
            ..Default::default()
        });
    })
    .await;

    let err = azure.authorize_ssh_sign("foo").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SshDisabled);
    assert_eq!(err.status_code().as_u16(), 401);
    assert!(err.to_string().starts_with("azure.authorizeSSHSign; "));
}

#[tokio::test]
async fn invalid_tokens_fail_ssh_authorization() {
    let mock = MockAzure::start().await;
    let azure = init_provisioner(&mock, |_| {}).await;

    let err = azure.authorize_ssh_sign("foo").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TokenMalformed);
    assert_eq!(err.status_code().as_u16(), 401);
}
