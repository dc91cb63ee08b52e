//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: jumpgate — Audited SSH access at the edge.
//

//! The user directory: public-key fingerprint to username.
//!
//! A user is stored under the hex SHA-256 fingerprint of their SSH public
//! key (wire format), so the publickey auth callback can resolve the
//! username with a single lookup.

use crate::encoding::hexlify;
use crate::error::DirectoryError;
use crate::vault::{Vault, BUCKET_USERS};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub key_fingerprint: String,
}

impl User {
    /// Fingerprint of an SSH public key given in wire format.
    pub fn fingerprint(wire: &[u8]) -> String {
        hexlify(&Sha256::digest(wire))
    }

    /// Build a user from an OpenSSH `authorized_keys`-style line
    /// (`<algorithm> <base64 blob> [comment]`).
    pub fn from_authorized_key(name: &str, line: &str) -> Result<User, DirectoryError> {
        let mut parts = line.split_whitespace();
        let _algorithm = parts
            .next()
            .ok_or_else(|| DirectoryError::WrongKeyFormat(line.to_string()))?;
        let blob = parts
            .next()
            .ok_or_else(|| DirectoryError::WrongKeyFormat(line.to_string()))?;

        let wire = BASE64
            .decode(blob)
            .map_err(|_| DirectoryError::WrongKeyFormat(line.to_string()))?;

        Ok(User {
            name: name.to_string(),
            key_fingerprint: Self::fingerprint(&wire),
        })
    }

    /// Persist the fingerprint → username mapping.
    pub fn store(&self, vault: &Vault) -> Result<(), DirectoryError> {
        vault
            .set(BUCKET_USERS, &self.key_fingerprint, self.name.as_bytes())
            .map_err(DirectoryError::from)
    }

    /// Resolve the user enrolled under `fingerprint`.
    pub fn load(vault: &Vault, fingerprint: &str) -> Result<User, DirectoryError> {
        let name = vault
            .get(BUCKET_USERS, fingerprint)?
            .filter(|name| !name.is_empty())
            .ok_or_else(|| DirectoryError::UnknownUser(fingerprint.to_string()))?;

        Ok(User {
            name: String::from_utf8_lossy(&name).into_owned(),
            key_fingerprint: fingerprint.to_string(),
        })
    }

    /// Remove the mapping for this user's key.
    pub fn delete(&self, vault: &Vault) -> Result<(), DirectoryError> {
        vault
            .delete(BUCKET_USERS, &self.key_fingerprint)
            .map_err(DirectoryError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_authorized_key_computes_fingerprint() {
        let wire = b"fake wire bytes";
        let line = format!("ssh-ed25519 {} alice@laptop", BASE64.encode(wire));

        let user = User::from_authorized_key("alice", &line).expect("parse");
        assert_eq!(user.name, "alice");
        assert_eq!(user.key_fingerprint, User::fingerprint(wire));
    }

    #[test]
    fn test_from_authorized_key_rejects_bare_names() {
        assert!(matches!(
            User::from_authorized_key("alice", "not-a-key"),
            Err(DirectoryError::WrongKeyFormat(_))
        ));
    }

    #[test]
    fn test_from_authorized_key_rejects_bad_base64() {
        assert!(matches!(
            User::from_authorized_key("alice", "ssh-rsa %%%%"),
            Err(DirectoryError::WrongKeyFormat(_))
        ));
    }
}
