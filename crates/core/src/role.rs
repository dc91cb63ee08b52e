//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: jumpgate — Audited SSH access at the edge.
//

//! Regex-based connection authorization.
//!
//! A role pairs a user pattern with a target pattern; a session may connect
//! iff some role matches both. Patterns are compiled once when the role
//! enters the matcher and reused for every check.

use crate::error::DirectoryError;
use crate::vault::{Vault, BUCKET_ROLES};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};

/// Stored role record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    #[serde(rename = "rex_user")]
    pub user_regex: String,
    #[serde(rename = "rex_target")]
    pub target_regex: String,
    /// When set, the role only matches sessions that have elevated through a
    /// second factor.
    #[serde(default)]
    pub require_twofactor: bool,
}

struct CompiledRole {
    role: Role,
    user: Regex,
    target: Regex,
}

/// The set of active roles, compiled and ready for matching.
pub struct RoleMatcher {
    roles: Mutex<HashMap<String, CompiledRole>>,
}

impl Default for RoleMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RoleMatcher {
    pub fn new() -> Self {
        RoleMatcher {
            roles: Mutex::new(HashMap::new()),
        }
    }

    /// Load every stored role from the vault. Roles that fail to parse or
    /// compile are skipped with a warning so one bad record cannot take the
    /// matcher down.
    pub fn load(&self, vault: &Vault) -> Result<usize, DirectoryError> {
        info!("role_manager: startup, loading stored roles");
        let entries = vault.scan(BUCKET_ROLES, "", 0, -1, true, false)?;

        let mut loaded = 0usize;
        for (name, _) in entries {
            let raw = match vault.get(BUCKET_ROLES, &name)? {
                Some(raw) => raw,
                None => continue,
            };
            let role: Role = match serde_json::from_slice(&raw) {
                Ok(role) => role,
                Err(err) => {
                    warn!("role_manager: unable to parse role '{}': {}", name, err);
                    continue;
                }
            };
            if let Err(err) = self.add(role) {
                warn!("role_manager: unable to compile role '{}': {}", name, err);
                continue;
            }
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Compile and install a role, replacing any previous role of the same
    /// name.
    pub fn add(&self, role: Role) -> Result<(), DirectoryError> {
        let compiled = CompiledRole {
            user: Regex::new(&role.user_regex)?,
            target: Regex::new(&role.target_regex)?,
            role,
        };

        let mut roles = self.roles.lock().expect("role map lock poisoned");
        info!("role_manager: added role '{}'", compiled.role.name);
        roles.insert(compiled.role.name.clone(), compiled);
        Ok(())
    }

    /// Drop a role from the matcher.
    pub fn remove(&self, name: &str) {
        let mut roles = self.roles.lock().expect("role map lock poisoned");
        if roles.remove(name).is_some() {
            info!("role_manager: removed role '{}'", name);
        }
    }

    /// Check whether `user` may connect to `target`, returning the name of
    /// the first role whose patterns both match. Roles requiring a second
    /// factor are skipped unless the session has elevated.
    pub fn check(&self, user: &str, target: &str, two_factor: bool) -> Option<String> {
        let roles = self.roles.lock().expect("role map lock poisoned");
        for compiled in roles.values() {
            if compiled.role.require_twofactor && !two_factor {
                continue;
            }
            if compiled.user.is_match(user) && compiled.target.is_match(target) {
                return Some(compiled.role.name.clone());
            }
        }
        None
    }
}

impl Role {
    /// Install the role in the matcher and persist it.
    pub fn store(&self, vault: &Vault, matcher: &RoleMatcher) -> Result<(), DirectoryError> {
        matcher.add(self.clone())?;
        vault
            .set(BUCKET_ROLES, &self.name, &serde_json::to_vec(self)?)
            .map_err(DirectoryError::from)
    }

    /// Remove the role from the matcher and the vault.
    pub fn delete(&self, vault: &Vault, matcher: &RoleMatcher) -> Result<(), DirectoryError> {
        matcher.remove(&self.name);
        vault
            .delete(BUCKET_ROLES, &self.name)
            .map_err(DirectoryError::from)
    }
}
