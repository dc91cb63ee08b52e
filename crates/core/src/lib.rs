//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: jumpgate — Audited SSH access at the edge.
//

//! # Jumpgate Core
//!
//! Core library for the jumpgate audited SSH jump proxy.
//!
//! Jumpgate terminates SSH client connections, authenticates them by public
//! key, authorizes them against regex role rules and bridges them to named
//! backend targets whose credentials live in an encrypted vault. Every byte
//! flowing from the backend to the client is recorded to an encrypted
//! journal and indexed into a replayable transcript after the session.
//!
//! ## Key Features
//!
//! - **Encrypted Vault**: bucketed KV store with per-record envelope
//!   encryption under a password-derived master key
//! - **Transparent Proxying**: channel and request bridging with faithful
//!   reply reflection and exit-status-aware teardown
//! - **Session Recording**: asciicast-style transcripts with per-chunk
//!   timing, spooled encrypted and indexed durably across restarts
//! - **SCP Auditing**: in-stream SCP interpretation producing per-file
//!   events with SHA-512 digests
//! - **Second Factors**: pluggable hardware-OTP gate with vault-fed
//!   configuration
//!
//! ## Architecture
//!
//! - [`vault`] - encrypted bucketed storage and the lock/unlock lifecycle
//! - [`secret`] - typed credentials (passwords, RSA private keys)
//! - [`user`] / [`target`] / [`role`] - the three directories consulted per
//!   session
//! - [`twofactor`] - pluggable second-factor verification
//! - [`ssh`] - listener, per-session flow, channel proxy and SCP interpreter
//! - [`cast`] / [`indexer`] - session recording and transcript indexing

pub mod cast;
pub mod encoding;
pub mod error;
pub mod indexer;
pub mod role;
pub mod secret;
pub mod ssh;
pub mod target;
pub mod twofactor;
pub mod user;
pub mod vault;

pub use cast::Cast;
pub use error::{
    DirectoryError, JumpgateError, RecorderError, ScpError, SecretError, TwoFactorError,
    VaultError,
};
pub use indexer::{Indexer, JobQueue};
pub use role::{Role, RoleMatcher};
pub use secret::{Secret, SecretKind, SecretPayload};
pub use ssh::{serve, SshSettings};
pub use target::{Target, TargetAuth};
pub use twofactor::{
    OtpUpstream, SecondFactor, TwoFactorRegistry, YubicoClient, YubikeyVerifier,
};
pub use user::User;
pub use vault::{Vault, VaultHandle};
