//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: jumpgate — Audited SSH access at the edge.
//

//! Unified error hierarchy for the jumpgate workspace.

use thiserror::Error;

/// Top-level unified error type for jumpgate operations
#[derive(Error, Debug)]
pub enum JumpgateError {
    #[error("vault operation failed")]
    Vault(#[from] VaultError),

    #[error("secret operation failed")]
    Secret(#[from] SecretError),

    #[error("directory operation failed")]
    Directory(#[from] DirectoryError),

    #[error("session recording failed")]
    Recorder(#[from] RecorderError),

    #[error("SCP interpretation failed")]
    Scp(#[from] ScpError),

    #[error("second-factor verification failed")]
    TwoFactor(#[from] TwoFactorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors related to the encrypted key/value vault
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("store is locked")]
    Locked,

    #[error("bucket '{0}' does not exist")]
    NoBucket(String),

    #[error("unknown key derivation hash '{0}'")]
    UnknownHash(String),

    #[error("unknown cipher '{0}'")]
    UnknownCipher(String),

    #[error("password does not match stored challenge")]
    PasswordMismatch,

    #[error("corrupt vault record: {0}")]
    CorruptRecord(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Db(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("challenge error: {0}")]
    Challenge(#[from] bcrypt::BcryptError),
}

/// Errors related to typed vault secrets
#[derive(Error, Debug)]
pub enum SecretError {
    #[error("unknown secret type {0}")]
    UnknownSecretType(u8),

    #[error("unable to locate secret for '{0}'")]
    NoSecret(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors related to the user, target and role directories
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("unknown user for key {0}")]
    UnknownUser(String),

    #[error("wrong public key format: {0}")]
    WrongKeyFormat(String),

    #[error("invalid target '{0}'")]
    InvalidTarget(String),

    #[error("invalid role pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("secret error: {0}")]
    Secret(#[from] SecretError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors related to the session recorder and its spool files
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("unable to start recording: no session set")]
    NoSession,

    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors related to in-stream SCP header interpretation
#[derive(Error, Debug, Clone)]
pub enum ScpError {
    #[error("unable to parse SCP header, may be corrupted")]
    WrongHeader,

    #[error("unknown SCP header command '{0}'")]
    UnknownCommand(String),
}

/// Errors related to second-factor verification
#[derive(Error, Debug)]
pub enum TwoFactorError {
    #[error("invalid one-time token")]
    InvalidToken,

    #[error("second factor '{0}' is not available yet")]
    Unavailable(String),

    #[error("upstream verification failed: {0}")]
    Upstream(String),

    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("terminal error: {0}")]
    Io(#[from] std::io::Error),
}
