//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: jumpgate — Audited SSH access at the edge.
//

//! Typed secrets stored in the vault.
//!
//! A secret is either a backend password or a PKCS#1 RSA private key in DER
//! form. The plaintext layout under the envelope is a single type byte
//! followed by the payload, so [`Secret::load`] can dispatch on the stored
//! tag without a second lookup.

use crate::encoding::{hexlify, put_mpint, put_string};
use crate::error::SecretError;
use crate::vault::{Vault, BUCKET_SECRETS};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use russh_keys::key::{KeyPair, SignatureHash};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use zeroize::Zeroize;

const TAG_PASSWORD: u8 = 0;
const TAG_PRIVATE_KEY: u8 = 1;

/// The kind of material a secret holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    Password,
    PrivateKey,
}

impl SecretKind {
    fn tag(self) -> u8 {
        match self {
            SecretKind::Password => TAG_PASSWORD,
            SecretKind::PrivateKey => TAG_PRIVATE_KEY,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, SecretError> {
        match tag {
            TAG_PASSWORD => Ok(SecretKind::Password),
            TAG_PRIVATE_KEY => Ok(SecretKind::PrivateKey),
            other => Err(SecretError::UnknownSecretType(other)),
        }
    }
}

/// Secret payload, tagged by kind.
#[derive(Debug, Clone)]
pub enum SecretPayload {
    /// A UTF-8 backend password.
    Password(String),
    /// A PKCS#1 RSA private key in DER form.
    PrivateKey(Vec<u8>),
}

/// A named secret held in the vault's `secrets` bucket.
#[derive(Debug, Clone)]
pub struct Secret {
    pub id: String,
    pub payload: SecretPayload,
}

impl Secret {
    pub fn kind(&self) -> SecretKind {
        match self.payload {
            SecretPayload::Password(_) => SecretKind::Password,
            SecretPayload::PrivateKey(_) => SecretKind::PrivateKey,
        }
    }

    /// Encrypt and persist this secret. The plaintext buffer is overwritten
    /// after the write.
    pub fn store(&self, vault: &Vault) -> Result<(), SecretError> {
        let mut plaintext = Vec::with_capacity(1 + self.payload_len());
        plaintext.push(self.kind().tag());
        match &self.payload {
            SecretPayload::Password(password) => plaintext.extend_from_slice(password.as_bytes()),
            SecretPayload::PrivateKey(der) => plaintext.extend_from_slice(der),
        }

        let result = vault.set(BUCKET_SECRETS, &self.id, &plaintext);
        plaintext.zeroize();
        result.map_err(SecretError::from)
    }

    /// Load and decrypt the secret stored under `id`, dispatching on the
    /// stored type byte.
    pub fn load(vault: &Vault, id: &str) -> Result<Secret, SecretError> {
        let mut plaintext = vault
            .get(BUCKET_SECRETS, id)?
            .ok_or_else(|| SecretError::NoSecret(id.to_string()))?;
        if plaintext.is_empty() {
            return Err(SecretError::NoSecret(id.to_string()));
        }

        let kind = SecretKind::from_tag(plaintext[0])?;
        let payload = match kind {
            SecretKind::Password => {
                let password = String::from_utf8(plaintext[1..].to_vec())
                    .map_err(|_| SecretError::InvalidKey("password is not UTF-8".into()))?;
                SecretPayload::Password(password)
            }
            SecretKind::PrivateKey => SecretPayload::PrivateKey(plaintext[1..].to_vec()),
        };
        plaintext.zeroize();

        Ok(Secret {
            id: id.to_string(),
            payload,
        })
    }

    /// Remove the secret stored under `id`.
    pub fn delete(vault: &Vault, id: &str) -> Result<(), SecretError> {
        vault.delete(BUCKET_SECRETS, id).map_err(SecretError::from)
    }

    /// SSH fingerprint of the public half of a private-key secret, for
    /// display: hex SHA-256 over the `ssh-rsa` wire encoding. Password
    /// secrets have no fingerprint.
    pub fn fingerprint(&self) -> Result<Option<String>, SecretError> {
        let SecretPayload::PrivateKey(der) = &self.payload else {
            return Ok(None);
        };

        let key = RsaPrivateKey::from_pkcs1_der(der)
            .map_err(|e| SecretError::InvalidKey(e.to_string()))?;
        let wire = rsa_public_wire(&key);
        Ok(Some(hexlify(&Sha256::digest(&wire))))
    }

    /// Build the SSH signer for a private-key secret, used to authenticate
    /// against the backend. Password secrets yield `None`.
    pub fn signer(&self) -> Result<Option<Arc<KeyPair>>, SecretError> {
        let SecretPayload::PrivateKey(der) = &self.payload else {
            return Ok(None);
        };

        let key = russh_keys::key::RsaPrivate::new_from_der(der)
            .map_err(|e| SecretError::InvalidKey(e.to_string()))?;
        Ok(Some(Arc::new(KeyPair::RSA {
            key,
            hash: SignatureHash::SHA2_256,
        })))
    }

    fn payload_len(&self) -> usize {
        match &self.payload {
            SecretPayload::Password(password) => password.len(),
            SecretPayload::PrivateKey(der) => der.len(),
        }
    }
}

/// SSH wire encoding of an RSA public key: `string "ssh-rsa", mpint e, mpint n`.
fn rsa_public_wire(key: &RsaPrivateKey) -> Vec<u8> {
    let public = key.to_public_key();
    let mut wire = Vec::new();
    put_string(&mut wire, b"ssh-rsa");
    put_mpint(&mut wire, &public.e().to_bytes_be());
    put_mpint(&mut wire, &public.n().to_bytes_be());
    wire
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::read_string;

    #[test]
    fn test_kind_tags_round_trip() {
        assert_eq!(
            SecretKind::from_tag(SecretKind::Password.tag()).expect("tag"),
            SecretKind::Password
        );
        assert_eq!(
            SecretKind::from_tag(SecretKind::PrivateKey.tag()).expect("tag"),
            SecretKind::PrivateKey
        );
        assert!(matches!(
            SecretKind::from_tag(9),
            Err(SecretError::UnknownSecretType(9))
        ));
    }

    #[test]
    fn test_rsa_public_wire_layout() {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("keygen");
        let wire = rsa_public_wire(&key);

        let (algo, rest) = read_string(&wire).expect("algo");
        assert_eq!(algo, b"ssh-rsa");
        let (e, rest) = read_string(rest).expect("e");
        assert!(!e.is_empty());
        let (n, rest) = read_string(rest).expect("n");
        // modulus of a 1024-bit key: 128 bytes, plus a possible sign pad
        assert!(n.len() == 128 || n.len() == 129);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_password_secret_has_no_fingerprint() {
        let secret = Secret {
            id: "db".into(),
            payload: SecretPayload::Password("hunter2".into()),
        };
        assert!(secret.fingerprint().expect("fingerprint").is_none());
        assert!(secret.signer().expect("signer").is_none());
    }
}
