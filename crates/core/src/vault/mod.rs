//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: jumpgate — Audited SSH access at the edge.
//

//! The encrypted key/value vault.
//!
//! The vault is a set of named buckets persisted in an embedded sled
//! database, one tree per bucket path. Values written through the encrypted
//! path are envelope-encrypted under a password-derived master key
//! ([`envelope`]); the master key lives only in memory and is overwritten on
//! [`Vault::lock`]. Raw (unencrypted) operations back the bucket families
//! that must stay readable while the vault is locked, such as the key
//! derivation descriptor and the admin challenges.

pub mod envelope;
pub mod keyderivation;

use crate::error::VaultError;
use keyderivation::{KeyDerivation, MASTER_KEY_LEN};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tracing::info;
use zeroize::Zeroize;

/// Shared vault handle threaded through every component constructor.
pub type VaultHandle = Arc<Vault>;

pub const BUCKET_META: &[&str] = &["meta"];
pub const BUCKET_ADMINS: &[&str] = &["meta", "admins"];
pub const BUCKET_SECRETS: &[&str] = &["secrets"];
pub const BUCKET_TARGETS: &[&str] = &["targets"];
pub const BUCKET_USERS: &[&str] = &["users"];
pub const BUCKET_ROLES: &[&str] = &["roles"];
pub const BUCKET_SESSIONS: &[&str] = &["sessions"];
pub const BUCKET_CASTS: &[&str] = &["casts"];

/// Key under `meta` holding the key-derivation descriptor.
pub const KEY_DERIVATION: &str = "keyderivation";

/// Internal tree tracking which bucket paths have been materialized.
const BUCKET_REGISTRY: &str = "__buckets";

struct MasterKey {
    key: [u8; MASTER_KEY_LEN],
    locked: bool,
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Bucketed persistent KV store with envelope encryption and a
/// lock/unlock lifecycle.
pub struct Vault {
    db: sled::Db,
    registry: sled::Tree,
    trees: RwLock<HashMap<String, sled::Tree>>,
    master: Mutex<MasterKey>,
    unlocked: watch::Sender<bool>,
}

impl Vault {
    /// Open (or create) a vault at `path`. The standard bucket layout is
    /// materialized and the vault starts locked.
    pub fn open(path: impl AsRef<Path>) -> Result<VaultHandle, VaultError> {
        let db = sled::open(path)?;
        let registry = db.open_tree(BUCKET_REGISTRY)?;
        let (unlocked, _) = watch::channel(false);

        let vault = Vault {
            db,
            registry,
            trees: RwLock::new(HashMap::new()),
            master: Mutex::new(MasterKey {
                key: [0u8; MASTER_KEY_LEN],
                locked: true,
            }),
            unlocked,
        };

        // reopen buckets created in earlier runs
        let known: Vec<String> = vault
            .registry
            .iter()
            .keys()
            .map(|k| Ok(String::from_utf8_lossy(&k?).into_owned()))
            .collect::<Result<_, sled::Error>>()?;
        for path in known {
            vault.materialize(&path)?;
        }

        for bucket in [
            BUCKET_META,
            BUCKET_ADMINS,
            BUCKET_SECRETS,
            BUCKET_TARGETS,
            BUCKET_USERS,
            BUCKET_ROLES,
            BUCKET_SESSIONS,
            BUCKET_CASTS,
        ] {
            vault.create(bucket)?;
        }

        Ok(Arc::new(vault))
    }

    /// Materialize a (possibly nested) bucket path. Idempotent.
    pub fn create(&self, bucket: &[&str]) -> Result<(), VaultError> {
        if bucket.is_empty() {
            return Err(VaultError::NoBucket(String::new()));
        }

        let mut path = String::new();
        for part in bucket {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(part);
            self.materialize(&path)?;
        }
        Ok(())
    }

    fn materialize(&self, path: &str) -> Result<(), VaultError> {
        let mut trees = self.trees.write().expect("bucket map lock poisoned");
        if trees.contains_key(path) {
            return Ok(());
        }
        let tree = self.db.open_tree(path.as_bytes())?;
        self.registry.insert(path.as_bytes(), &b""[..])?;
        trees.insert(path.to_string(), tree);
        Ok(())
    }

    fn tree(&self, bucket: &[&str]) -> Result<sled::Tree, VaultError> {
        if bucket.is_empty() {
            return Err(VaultError::NoBucket(String::new()));
        }
        let path = bucket.join("/");
        let trees = self.trees.read().expect("bucket map lock poisoned");
        trees
            .get(&path)
            .cloned()
            .ok_or(VaultError::NoBucket(path))
    }

    fn ensure_unlocked(&self) -> Result<(), VaultError> {
        let guard = self.master.lock().expect("master key mutex poisoned");
        if guard.locked {
            return Err(VaultError::Locked);
        }
        Ok(())
    }

    fn with_master<T>(
        &self,
        f: impl FnOnce(&[u8; MASTER_KEY_LEN]) -> Result<T, VaultError>,
    ) -> Result<T, VaultError> {
        let guard = self.master.lock().expect("master key mutex poisoned");
        if guard.locked {
            return Err(VaultError::Locked);
        }
        f(&guard.key)
    }

    /// Store a raw (unencrypted) value.
    pub fn set_raw(&self, bucket: &[&str], key: &str, value: &[u8]) -> Result<(), VaultError> {
        self.tree(bucket)?.insert(key.as_bytes(), value)?;
        Ok(())
    }

    /// Fetch a raw (unencrypted) value.
    pub fn get_raw(&self, bucket: &[&str], key: &str) -> Result<Option<Vec<u8>>, VaultError> {
        Ok(self.tree(bucket)?.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    /// Envelope-encrypt and store a value. Fails with [`VaultError::Locked`]
    /// while the vault is locked.
    pub fn set(&self, bucket: &[&str], key: &str, plaintext: &[u8]) -> Result<(), VaultError> {
        let record = self.with_master(|master| envelope::seal(master, plaintext))?;
        self.set_raw(bucket, key, &record)
    }

    /// Fetch and decrypt a value. Fails with [`VaultError::Locked`] while the
    /// vault is locked; returns `Ok(None)` when the key is absent.
    pub fn get(&self, bucket: &[&str], key: &str) -> Result<Option<Vec<u8>>, VaultError> {
        self.ensure_unlocked()?;
        match self.get_raw(bucket, key)? {
            None => Ok(None),
            Some(record) => self
                .with_master(|master| envelope::open(master, &record))
                .map(Some),
        }
    }

    /// Delete a key from a bucket.
    pub fn delete(&self, bucket: &[&str], key: &str) -> Result<(), VaultError> {
        self.tree(bucket)?.remove(key.as_bytes())?;
        Ok(())
    }

    /// Ordered iteration over keys with the given byte prefix.
    ///
    /// The first `skip` matches are dropped and up to `limit` entries are
    /// returned (`limit <= 0` means unbounded). Values come back raw; the
    /// caller decrypts if it needs to. Sub-buckets live in their own trees,
    /// so their entries never appear here.
    pub fn scan(
        &self,
        bucket: &[&str],
        prefix: &str,
        skip: usize,
        limit: i64,
        sorted_asc: bool,
        values_too: bool,
    ) -> Result<Vec<(String, Vec<u8>)>, VaultError> {
        let tree = self.tree(bucket)?;
        let iter = tree.scan_prefix(prefix.as_bytes());
        let entries: Box<dyn Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>> =
            if sorted_asc {
                Box::new(iter)
            } else {
                Box::new(iter.rev())
            };

        let mut out = Vec::new();
        let mut skipped = 0usize;
        for item in entries {
            let (key, value) = item?;
            if skipped < skip {
                skipped += 1;
                continue;
            }
            if limit > 0 && out.len() as i64 >= limit {
                break;
            }
            out.push((
                String::from_utf8_lossy(&key).into_owned(),
                if values_too { value.to_vec() } else { Vec::new() },
            ));
        }
        Ok(out)
    }

    /// Overwrite the master key buffer and lock the vault.
    pub fn lock(&self) {
        {
            let mut guard = self.master.lock().expect("master key mutex poisoned");
            guard.key.zeroize();
            guard.locked = true;
        }
        self.unlocked.send_replace(false);
        info!("store: locked");
    }

    /// Unlock the vault with `password`.
    ///
    /// The first unlock initializes the key-derivation descriptor; later
    /// unlocks verify the stored bcrypt challenge before re-deriving the
    /// master key. The password buffer is overwritten before returning.
    pub fn unlock(&self, password: String) -> Result<(), VaultError> {
        let password = zeroize::Zeroizing::new(password);

        let mut master = match self.get_raw(BUCKET_META, KEY_DERIVATION)? {
            Some(raw) => {
                let descriptor: KeyDerivation = serde_json::from_slice(&raw)?;
                descriptor.verify(&password)?
            }
            None => {
                let (descriptor, master) = KeyDerivation::initialize(&password)?;
                self.set_raw(BUCKET_META, KEY_DERIVATION, &serde_json::to_vec(&descriptor)?)?;
                master
            }
        };

        {
            let mut guard = self.master.lock().expect("master key mutex poisoned");
            guard.key = master;
            guard.locked = false;
        }
        master.zeroize();
        self.unlocked.send_replace(true);
        info!("store: unlocked");
        Ok(())
    }

    /// Whether the vault is currently locked.
    pub fn is_locked(&self) -> bool {
        self.master
            .lock()
            .expect("master key mutex poisoned")
            .locked
    }

    /// Wait until the vault has been unlocked.
    pub async fn wait_unlocked(&self) {
        let mut rx = self.unlocked.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Compare `password` against the admin challenge stored under
    /// `meta/admins/<admin>`. Unknown admins simply fail the check.
    pub fn auth(&self, admin: &str, password: &str) -> Result<bool, VaultError> {
        match self.get_raw(BUCKET_ADMINS, admin)? {
            None => Ok(false),
            Some(challenge) => {
                let challenge = std::str::from_utf8(&challenge)
                    .map_err(|_| VaultError::CorruptRecord("admin challenge".into()))?;
                Ok(bcrypt::verify(password, challenge)?)
            }
        }
    }
}
