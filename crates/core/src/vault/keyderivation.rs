//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: jumpgate — Audited SSH access at the edge.
//

//! Master-key derivation for the vault.
//!
//! The unlock password never touches disk. What is persisted under
//! `meta/keyderivation` is a descriptor holding the PBKDF2 salt and iteration
//! count together with a bcrypt challenge of the password. On every unlock the
//! challenge gates the attempt; only then is the master key re-derived.

use crate::encoding::{hexlify, unhexlify};
use crate::error::VaultError;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Length of the derived master key in bytes.
pub const MASTER_KEY_LEN: usize = 32;

/// Length of the PBKDF2 salt in bytes.
pub const SALT_LEN: usize = 16;

/// PBKDF2 iteration count used for new descriptors.
pub const PBKDF2_ITERATIONS: u32 = 8192;

/// bcrypt cost factor for the unlock and admin challenges.
pub const BCRYPT_COST: u32 = 12;

const HASH_SHA256: &str = "sha256";

/// Persisted key-derivation descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyDerivation {
    /// Hex-encoded PBKDF2 salt.
    pub salt: String,
    /// PBKDF2 iteration count.
    pub iterations: u32,
    /// Hash tag; only "sha256" is understood.
    pub hash: String,
    /// bcrypt challenge of the unlock password.
    pub challenge: String,
}

impl KeyDerivation {
    /// First-unlock initialization: draw a fresh salt, derive the master key
    /// and compute the bcrypt challenge for later unlocks.
    pub fn initialize(password: &str) -> Result<(Self, [u8; MASTER_KEY_LEN]), VaultError> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);

        let descriptor = KeyDerivation {
            salt: hexlify(&salt),
            iterations: PBKDF2_ITERATIONS,
            hash: HASH_SHA256.to_string(),
            challenge: bcrypt::hash(password, BCRYPT_COST)?,
        };

        let master = descriptor.derive(password, &salt);
        Ok((descriptor, master))
    }

    /// Subsequent unlock: verify the bcrypt challenge, then re-derive the
    /// master key from the stored salt.
    pub fn verify(&self, password: &str) -> Result<[u8; MASTER_KEY_LEN], VaultError> {
        if self.hash != HASH_SHA256 {
            return Err(VaultError::UnknownHash(self.hash.clone()));
        }

        if !bcrypt::verify(password, &self.challenge)? {
            return Err(VaultError::PasswordMismatch);
        }

        let salt = unhexlify(&self.salt)
            .map_err(|_| VaultError::CorruptRecord("key derivation salt".into()))?;
        Ok(self.derive(password, &salt))
    }

    fn derive(&self, password: &str, salt: &[u8]) -> [u8; MASTER_KEY_LEN] {
        let mut master = [0u8; MASTER_KEY_LEN];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, self.iterations, &mut master);
        master
    }
}
