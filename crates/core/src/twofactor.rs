//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: jumpgate — Audited SSH access at the edge.
//

//! Pluggable second-factor verification.
//!
//! A [`SecondFactor`] gates session establishment for enrolled users; the
//! only kind shipped here is hardware OTP ("yubikey"). The upstream OTP
//! validation service is behind the [`OtpUpstream`] trait so deployments can
//! swap it out, and its credentials live in the vault: the verifier's
//! initializer waits for the first unlock, then polls once per second until
//! `config~yubikey_api` materializes.

use crate::error::TwoFactorError;
use crate::ssh::terminal::Terminal;
use crate::vault::{VaultHandle, BUCKET_META, BUCKET_USERS};
use async_trait::async_trait;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Kind tag of the hardware-OTP verifier.
pub const KIND_YUBIKEY: &str = "yubikey";

/// Vault key (in `meta`) holding `client_id:api_key` for the upstream
/// validation service.
pub const YUBIKEY_API_CONFIG: &str = "config~yubikey_api";

/// Length of the device public id prefixing every OTP.
const PUBLIC_ID_LEN: usize = 12;

/// Upstream one-time-password validation service.
#[async_trait]
pub trait OtpUpstream: Send + Sync {
    async fn verify(&self, otp: &str) -> Result<bool, TwoFactorError>;
}

/// Factory building the upstream verifier once its credentials materialize.
pub type UpstreamFactory =
    Box<dyn Fn(String, String) -> Arc<dyn OtpUpstream> + Send + Sync + 'static>;

/// A pluggable second factor, keyed by kind.
#[async_trait]
pub trait SecondFactor: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Whether `username` has enrolled with this factor.
    async fn enabled(&self, username: &str) -> Result<bool, TwoFactorError>;

    /// Verify a token for an enrolled user.
    async fn verify(&self, username: &str, token: &str) -> Result<bool, TwoFactorError>;

    /// Interactive enrollment on the session terminal.
    async fn setup(&self, username: &str, tty: &mut Terminal<'_>) -> Result<(), TwoFactorError>;
}

/// Registry of available second factors.
#[derive(Default)]
pub struct TwoFactorRegistry {
    verifiers: Mutex<HashMap<&'static str, Arc<dyn SecondFactor>>>,
}

impl TwoFactorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, verifier: Arc<dyn SecondFactor>) {
        let mut verifiers = self.verifiers.lock().expect("verifier map lock poisoned");
        verifiers.insert(verifier.kind(), verifier);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn SecondFactor>> {
        let verifiers = self.verifiers.lock().expect("verifier map lock poisoned");
        verifiers.get(kind).cloned()
    }

    /// The first factor `username` has enrolled with, if any.
    pub async fn enabled_for(
        &self,
        username: &str,
    ) -> Result<Option<Arc<dyn SecondFactor>>, TwoFactorError> {
        let candidates: Vec<Arc<dyn SecondFactor>> = {
            let verifiers = self.verifiers.lock().expect("verifier map lock poisoned");
            verifiers.values().cloned().collect()
        };
        for verifier in candidates {
            if verifier.enabled(username).await? {
                return Ok(Some(verifier));
            }
        }
        Ok(None)
    }
}

/// Hardware-OTP second factor backed by a pluggable upstream.
pub struct YubikeyVerifier {
    vault: VaultHandle,
    upstream: RwLock<Option<Arc<dyn OtpUpstream>>>,
}

fn kind_key(username: &str) -> String {
    format!("{username}~2fa~kind")
}

fn config_key(username: &str) -> String {
    format!("{username}~2fa~config")
}

impl YubikeyVerifier {
    pub fn new(vault: VaultHandle) -> Arc<Self> {
        Arc::new(YubikeyVerifier {
            vault,
            upstream: RwLock::new(None),
        })
    }

    /// Spawn the background initializer: wait for the vault to unlock, poll
    /// for the API credentials at one-second cadence, then install the
    /// upstream built by `factory`.
    pub fn spawn_initializer(self: &Arc<Self>, factory: UpstreamFactory) -> JoinHandle<()> {
        let verifier = self.clone();
        tokio::spawn(async move {
            verifier.vault.wait_unlocked().await;

            let raw = loop {
                match verifier.vault.get(BUCKET_META, YUBIKEY_API_CONFIG) {
                    Ok(Some(raw)) => break raw,
                    Ok(None) => {}
                    Err(err) => {
                        warn!("2fa: unable to read yubikey configuration: {}", err);
                    }
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            };

            let text = String::from_utf8_lossy(&raw);
            let Some((client_id, api_key)) = text.split_once(':') else {
                warn!("2fa: yubikey configuration is not 'client_id:api_key'");
                return;
            };

            let upstream = factory(client_id.to_string(), api_key.to_string());
            *verifier.upstream.write().await = Some(upstream);
            info!("2fa: yubikey verifier initialized");
        })
    }

    /// Install an upstream directly (tests, custom wiring).
    pub async fn set_upstream(&self, upstream: Arc<dyn OtpUpstream>) {
        *self.upstream.write().await = Some(upstream);
    }

    async fn upstream(&self) -> Result<Arc<dyn OtpUpstream>, TwoFactorError> {
        self.upstream
            .read()
            .await
            .clone()
            .ok_or_else(|| TwoFactorError::Unavailable(KIND_YUBIKEY.to_string()))
    }
}

#[async_trait]
impl SecondFactor for YubikeyVerifier {
    fn kind(&self) -> &'static str {
        KIND_YUBIKEY
    }

    async fn enabled(&self, username: &str) -> Result<bool, TwoFactorError> {
        match self.vault.get(BUCKET_USERS, &kind_key(username))? {
            Some(kind) => Ok(kind == KIND_YUBIKEY.as_bytes()),
            None => Ok(false),
        }
    }

    async fn verify(&self, username: &str, token: &str) -> Result<bool, TwoFactorError> {
        if !self.enabled(username).await? {
            return Ok(false);
        }
        if token.len() < PUBLIC_ID_LEN {
            return Err(TwoFactorError::InvalidToken);
        }

        // the first twelve characters of an OTP are the device public id
        let device = self
            .vault
            .get(BUCKET_USERS, &config_key(username))?
            .unwrap_or_default();
        if device != token.as_bytes()[..PUBLIC_ID_LEN] {
            return Ok(false);
        }

        self.upstream().await?.verify(token).await
    }

    async fn setup(&self, username: &str, tty: &mut Terminal<'_>) -> Result<(), TwoFactorError> {
        let token = tty.read_password("Enter YubiKey OTP: ").await?;
        let token = token.trim();
        if token.len() < PUBLIC_ID_LEN {
            tty.write_line("OTP too short").await?;
            return Err(TwoFactorError::InvalidToken);
        }

        if !self.upstream().await?.verify(token).await? {
            tty.write_line("OTP was rejected").await?;
            return Err(TwoFactorError::InvalidToken);
        }

        self.vault
            .set(BUCKET_USERS, &config_key(username), &token.as_bytes()[..PUBLIC_ID_LEN])?;
        self.vault
            .set(BUCKET_USERS, &kind_key(username), KIND_YUBIKEY.as_bytes())?;
        tty.write_line("YubiKey enrolled").await?;
        info!("2fa: enrolled yubikey for '{}'", username);
        Ok(())
    }
}

/// Upstream client speaking the YubiCloud validation protocol (wsapi 2.0).
///
/// The response is accepted when the service reports `status=OK` and echoes
/// both the OTP and our request nonce. Transport security comes from TLS to
/// the validation endpoint; the signed-response scheme is not used.
pub struct YubicoClient {
    http: reqwest::Client,
    client_id: String,
    #[allow(dead_code)] // reserved for the signed-response scheme
    api_key: String,
    endpoint: String,
}

const YUBICO_VERIFY_URL: &str = "https://api.yubico.com/wsapi/2.0/verify";

impl YubicoClient {
    pub fn new(client_id: String, api_key: String) -> Arc<Self> {
        Arc::new(YubicoClient {
            http: reqwest::Client::new(),
            client_id,
            api_key,
            endpoint: YUBICO_VERIFY_URL.to_string(),
        })
    }
}

#[async_trait]
impl OtpUpstream for YubicoClient {
    async fn verify(&self, otp: &str) -> Result<bool, TwoFactorError> {
        let mut nonce_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = crate::encoding::hexlify(&nonce_bytes);

        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("id", self.client_id.as_str()),
                ("otp", otp),
                ("nonce", nonce.as_str()),
            ])
            .send()
            .await
            .map_err(|e| TwoFactorError::Upstream(e.to_string()))?
            .text()
            .await
            .map_err(|e| TwoFactorError::Upstream(e.to_string()))?;

        let mut status = None;
        let mut echoed_otp = None;
        let mut echoed_nonce = None;
        for line in response.lines() {
            if let Some((key, value)) = line.trim().split_once('=') {
                match key {
                    "status" => status = Some(value.to_string()),
                    "otp" => echoed_otp = Some(value.to_string()),
                    "nonce" => echoed_nonce = Some(value.to_string()),
                    _ => {}
                }
            }
        }

        Ok(status.as_deref() == Some("OK")
            && echoed_otp.as_deref() == Some(otp)
            && echoed_nonce.as_deref() == Some(nonce.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::Vault;

    /// Upstream accepting exactly one token.
    struct FakeUpstream {
        accept: String,
    }

    #[async_trait]
    impl OtpUpstream for FakeUpstream {
        async fn verify(&self, otp: &str) -> Result<bool, TwoFactorError> {
            Ok(otp == self.accept)
        }
    }

    fn open_vault() -> (tempfile::TempDir, VaultHandle) {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = Vault::open(dir.path().join("vault")).expect("open");
        vault.unlock("hunter2".into()).expect("unlock");
        (dir, vault)
    }

    async fn enroll(vault: &VaultHandle, username: &str, device: &str) {
        vault
            .set(BUCKET_USERS, &config_key(username), device.as_bytes())
            .expect("set config");
        vault
            .set(BUCKET_USERS, &kind_key(username), KIND_YUBIKEY.as_bytes())
            .expect("set kind");
    }

    #[tokio::test]
    async fn test_unenrolled_user_is_not_enabled() {
        let (_dir, vault) = open_vault();
        let verifier = YubikeyVerifier::new(vault);
        assert!(!verifier.enabled("alice").await.expect("enabled"));
        assert!(!verifier.verify("alice", "cccccccccccc_token").await.expect("verify"));
    }

    #[tokio::test]
    async fn test_verify_checks_device_id_and_upstream() {
        let (_dir, vault) = open_vault();
        let verifier = YubikeyVerifier::new(vault.clone());
        enroll(&vault, "alice", "cccccccccccc").await;
        verifier
            .set_upstream(Arc::new(FakeUpstream {
                accept: "ccccccccccccrest".into(),
            }))
            .await;

        assert!(verifier.enabled("alice").await.expect("enabled"));
        // right device, accepted upstream
        assert!(verifier
            .verify("alice", "ccccccccccccrest")
            .await
            .expect("verify"));
        // right device, rejected upstream
        assert!(!verifier
            .verify("alice", "ccccccccccccother")
            .await
            .expect("verify"));
        // wrong device id prefix never reaches the upstream
        assert!(!verifier
            .verify("alice", "ddddddddddddrest")
            .await
            .expect("verify"));
    }

    #[tokio::test]
    async fn test_short_token_is_invalid() {
        let (_dir, vault) = open_vault();
        let verifier = YubikeyVerifier::new(vault.clone());
        enroll(&vault, "alice", "cccccccccccc").await;
        assert!(matches!(
            verifier.verify("alice", "short").await,
            Err(TwoFactorError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_missing_upstream_is_unavailable() {
        let (_dir, vault) = open_vault();
        let verifier = YubikeyVerifier::new(vault.clone());
        enroll(&vault, "alice", "cccccccccccc").await;
        assert!(matches!(
            verifier.verify("alice", "ccccccccccccrest").await,
            Err(TwoFactorError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_finds_enrolled_factor() {
        let (_dir, vault) = open_vault();
        let verifier = YubikeyVerifier::new(vault.clone());
        enroll(&vault, "alice", "cccccccccccc").await;

        let registry = TwoFactorRegistry::new();
        registry.register(verifier);

        assert!(registry
            .enabled_for("alice")
            .await
            .expect("enabled_for")
            .is_some());
        assert!(registry
            .enabled_for("bob")
            .await
            .expect("enabled_for")
            .is_none());
        assert!(registry.get(KIND_YUBIKEY).is_some());
        assert!(registry.get("totp").is_none());
    }
}
