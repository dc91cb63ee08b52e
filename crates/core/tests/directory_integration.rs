//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: jumpgate — Audited SSH access at the edge.
//

//! Integration tests for secrets, users, targets and roles against a live
//! vault.

use jumpgate_core::error::{DirectoryError, SecretError};
use jumpgate_core::role::{Role, RoleMatcher};
use jumpgate_core::secret::{Secret, SecretKind, SecretPayload};
use jumpgate_core::target::{Target, TargetAuth};
use jumpgate_core::user::User;
use jumpgate_core::vault::{Vault, VaultHandle, BUCKET_SECRETS};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::RsaPrivateKey;

fn open_vault(dir: &tempfile::TempDir) -> VaultHandle {
    let vault = Vault::open(dir.path().join("vault")).expect("open");
    vault.unlock("hunter2".into()).expect("unlock");
    vault
}

#[test]
fn test_password_secret_survives_lock_cycle() {
    // S1: store a password secret, lock, unlock, load
    let dir = tempfile::tempdir().expect("tempdir");
    let vault = open_vault(&dir);

    let secret = Secret {
        id: "foo".into(),
        payload: SecretPayload::Password("bar".into()),
    };
    secret.store(&vault).expect("store");

    vault.lock();
    vault.unlock("hunter2".into()).expect("unlock");

    let loaded = Secret::load(&vault, "foo").expect("load");
    assert_eq!(loaded.kind(), SecretKind::Password);
    match loaded.payload {
        SecretPayload::Password(password) => assert_eq!(password, "bar"),
        other => panic!("expected password payload, got {other:?}"),
    }
}

#[test]
fn test_missing_secret_is_no_secret() {
    let dir = tempfile::tempdir().expect("tempdir");
    let vault = open_vault(&dir);
    assert!(matches!(
        Secret::load(&vault, "absent"),
        Err(SecretError::NoSecret(_))
    ));
}

#[test]
fn test_unknown_secret_type_tag_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let vault = open_vault(&dir);

    // a record whose plaintext carries an unassigned type byte
    vault
        .set(BUCKET_SECRETS, "odd", &[42, 1, 2, 3])
        .expect("set");
    assert!(matches!(
        Secret::load(&vault, "odd"),
        Err(SecretError::UnknownSecretType(42))
    ));
}

#[test]
fn test_private_key_secret_round_trip_and_fingerprint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let vault = open_vault(&dir);

    let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("keygen");
    let der = key.to_pkcs1_der().expect("der").as_bytes().to_vec();

    let secret = Secret {
        id: "deploy-key".into(),
        payload: SecretPayload::PrivateKey(der.clone()),
    };
    secret.store(&vault).expect("store");

    let loaded = Secret::load(&vault, "deploy-key").expect("load");
    assert_eq!(loaded.kind(), SecretKind::PrivateKey);
    match &loaded.payload {
        SecretPayload::PrivateKey(reloaded) => assert_eq!(reloaded, &der),
        other => panic!("expected private key payload, got {other:?}"),
    }

    // fingerprint is stable and hex SHA-256 sized
    let fp = loaded.fingerprint().expect("fingerprint").expect("some");
    assert_eq!(fp.len(), 64);
    assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(secret.fingerprint().expect("fingerprint").expect("some"), fp);

    // a signer can be built for backend authentication
    assert!(loaded.signer().expect("signer").is_some());

    Secret::delete(&vault, "deploy-key").expect("delete");
    assert!(matches!(
        Secret::load(&vault, "deploy-key"),
        Err(SecretError::NoSecret(_))
    ));
}

#[test]
fn test_user_directory_round_trip() {
    // S3 essence: the fingerprint of the presented key resolves the user
    let dir = tempfile::tempdir().expect("tempdir");
    let vault = open_vault(&dir);

    let wire = b"some ssh wire encoded public key";
    let user = User {
        name: "alice".into(),
        key_fingerprint: User::fingerprint(wire),
    };
    user.store(&vault).expect("store");

    let loaded = User::load(&vault, &User::fingerprint(wire)).expect("load");
    assert_eq!(loaded.name, "alice");

    // a different key is unknown
    assert!(matches!(
        User::load(&vault, &User::fingerprint(b"another key")),
        Err(DirectoryError::UnknownUser(_))
    ));

    user.delete(&vault).expect("delete");
    assert!(matches!(
        User::load(&vault, &User::fingerprint(wire)),
        Err(DirectoryError::UnknownUser(_))
    ));
}

#[test]
fn test_target_resolution() {
    let dir = tempfile::tempdir().expect("tempdir");
    let vault = open_vault(&dir);

    let secret = Secret {
        id: "root-pw".into(),
        payload: SecretPayload::Password("t0ps3cret".into()),
    };
    secret.store(&vault).expect("store");

    let mut target = Target::parse("root@db01:2222").expect("parse");
    target.secret_id = Some("root-pw".into());
    target.store(&vault).expect("store");

    // a fresh handle on the same id resolves through the vault
    let mut fresh = Target::parse("root@db01:2222").expect("parse");
    match fresh.resolve(&vault).expect("resolve") {
        TargetAuth::Password(password) => assert_eq!(password, "t0ps3cret"),
        TargetAuth::Key(_) => panic!("expected password auth"),
    }

    // unknown target has no secret reference
    let mut unknown = Target::parse("root@elsewhere:22").expect("parse");
    assert!(matches!(
        unknown.resolve(&vault),
        Err(DirectoryError::Secret(SecretError::NoSecret(_)))
    ));

    // a dangling secret reference also fails with NoSecret
    Secret::delete(&vault, "root-pw").expect("delete");
    let mut dangling = Target::parse("root@db01:2222").expect("parse");
    assert!(matches!(
        dangling.resolve(&vault),
        Err(DirectoryError::Secret(SecretError::NoSecret(_)))
    ));
}

#[test]
fn test_roles_load_from_vault_and_deny() {
    // S4 essence: alice may reach root@*, nothing grants bob@srv
    let dir = tempfile::tempdir().expect("tempdir");
    let vault = open_vault(&dir);

    let matcher = RoleMatcher::new();
    let role = Role {
        name: "ops".into(),
        user_regex: "^alice$".into(),
        target_regex: "^root@.*".into(),
        require_twofactor: false,
    };
    role.store(&vault, &matcher).expect("store");

    // a fresh matcher picks the role up from storage
    let reloaded = RoleMatcher::new();
    assert_eq!(reloaded.load(&vault).expect("load"), 1);

    assert_eq!(
        reloaded.check("alice", "root@db01:22", false),
        Some("ops".to_string())
    );
    assert_eq!(reloaded.check("alice", "bob@srv:22", false), None);

    role.delete(&vault, &matcher).expect("delete");
    let emptied = RoleMatcher::new();
    assert_eq!(emptied.load(&vault).expect("load"), 0);
    assert_eq!(emptied.check("alice", "root@db01:22", false), None);
}
