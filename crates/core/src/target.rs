//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: jumpgate — Audited SSH access at the edge.
//

//! The target directory: named backend hosts and their credentials.
//!
//! A target is addressed as `user@host:port` and references a secret id in
//! the vault. Resolving a target decrypts that secret into live SSH
//! authentication material for the backend dial.

use crate::error::{DirectoryError, SecretError};
use crate::secret::{Secret, SecretPayload};
use crate::vault::{Vault, BUCKET_TARGETS};
use russh_keys::key::KeyPair;
use std::sync::Arc;

/// A backend SSH endpoint referenced by a secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub username: String,
    pub hostname: String,
    pub port: u16,
    pub secret_id: Option<String>,
}

/// Live authentication material for a backend dial.
pub enum TargetAuth {
    Password(String),
    Key(Arc<KeyPair>),
}

impl Target {
    /// Canonical identifier, `"<user>@<host>:<port>"`.
    pub fn id(&self) -> String {
        format!("{}@{}:{}", self.username, self.hostname, self.port)
    }

    /// Parse a target declaration of the form `user@host[:port]`.
    ///
    /// Exactly one `@` is required; the port defaults to 22 and must be a
    /// decimal number in `[1, 65535]`.
    pub fn parse(id: &str) -> Result<Target, DirectoryError> {
        let invalid = || DirectoryError::InvalidTarget(id.to_string());

        let mut at = id.split('@');
        let (username, rest) = match (at.next(), at.next(), at.next()) {
            (Some(user), Some(rest), None) if !user.is_empty() => (user, rest),
            _ => return Err(invalid()),
        };

        let mut colon = rest.split(':');
        let (hostname, port) = match (colon.next(), colon.next(), colon.next()) {
            (Some(host), None, _) if !host.is_empty() => (host, 22),
            (Some(host), Some(port), None) if !host.is_empty() => {
                let port: u16 = port.parse().map_err(|_| invalid())?;
                if port == 0 {
                    return Err(invalid());
                }
                (host, port)
            }
            _ => return Err(invalid()),
        };

        Ok(Target {
            username: username.to_string(),
            hostname: hostname.to_string(),
            port,
            secret_id: None,
        })
    }

    /// Persist the target → secret-id mapping. A target without a secret
    /// reference cannot be stored.
    pub fn store(&self, vault: &Vault) -> Result<(), DirectoryError> {
        let secret_id = self
            .secret_id
            .as_deref()
            .ok_or_else(|| SecretError::NoSecret(self.id()))?;
        vault
            .set(BUCKET_TARGETS, &self.id(), secret_id.as_bytes())
            .map_err(DirectoryError::from)
    }

    /// Remove the mapping for `id`.
    pub fn delete(vault: &Vault, id: &str) -> Result<(), DirectoryError> {
        vault.delete(BUCKET_TARGETS, id).map_err(DirectoryError::from)
    }

    /// Load the secret reference stored for this target, if any.
    pub fn load_secret_id(&mut self, vault: &Vault) -> Result<(), DirectoryError> {
        let id = self.id();
        self.secret_id = vault
            .get(BUCKET_TARGETS, &id)?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned())
            .filter(|s| !s.is_empty());
        Ok(())
    }

    /// Resolve this target to live authentication material, decrypting the
    /// referenced secret. A missing mapping or missing secret fails with
    /// [`SecretError::NoSecret`].
    pub fn resolve(&mut self, vault: &Vault) -> Result<TargetAuth, DirectoryError> {
        if self.secret_id.is_none() {
            self.load_secret_id(vault)?;
        }
        let secret_id = self
            .secret_id
            .as_deref()
            .ok_or_else(|| SecretError::NoSecret(self.id()))?;

        let secret = Secret::load(vault, secret_id)?;
        match secret.payload {
            SecretPayload::Password(password) => Ok(TargetAuth::Password(password)),
            SecretPayload::PrivateKey(_) => {
                let signer = secret
                    .signer()?
                    .ok_or_else(|| SecretError::NoSecret(secret_id.to_string()))?;
                Ok(TargetAuth::Key(signer))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_format() {
        let target = Target {
            username: "deploy".into(),
            hostname: "web01".into(),
            port: 2200,
            secret_id: None,
        };
        assert_eq!(target.id(), "deploy@web01:2200");
    }

    #[test]
    fn test_parse_with_default_port() {
        let target = Target::parse("alice@srv").expect("parse");
        assert_eq!(target.username, "alice");
        assert_eq!(target.hostname, "srv");
        assert_eq!(target.port, 22);
    }

    #[test]
    fn test_parse_with_explicit_port() {
        let target = Target::parse("alice@srv:2201").expect("parse");
        assert_eq!(target.port, 2201);
        assert_eq!(target.id(), "alice@srv:2201");
    }

    #[test]
    fn test_parse_rejects_malformed_input() {
        for input in [
            "alice",            // no '@'
            "a@b@c",            // multiple '@'
            "@srv",             // empty user
            "alice@",           // empty host
            "alice@srv:xx",     // non-numeric port
            "alice@srv:0",      // port below range
            "alice@srv:65536",  // port above range
            "alice@srv:22:22",  // trailing colon part
        ] {
            assert!(
                matches!(Target::parse(input), Err(DirectoryError::InvalidTarget(_))),
                "input '{}' should be rejected",
                input
            );
        }
    }

    #[test]
    fn test_store_requires_secret_reference() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = crate::vault::Vault::open(dir.path().join("vault")).expect("open");
        vault.unlock("hunter2".into()).expect("unlock");

        let target = Target::parse("alice@srv").expect("parse");
        assert!(matches!(
            target.store(&vault),
            Err(DirectoryError::Secret(SecretError::NoSecret(_)))
        ));
    }
}
