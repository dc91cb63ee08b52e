//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: jumpgate — Audited SSH access at the edge.
//

//! The SSH front: listener, publickey authentication and session dispatch.
//!
//! Authentication is publickey-only. The callback fingerprints the offered
//! key, resolves it against the user directory and assigns the session its
//! 128-bit random id; the id is immutable for the life of the session and
//! appears in every audit line. The first `session` channel is handed to the
//! per-session flow ([`session`]); all other channel types are rejected.
//! Handler callbacks feed client events into the session task through an
//! unbounded channel, mirroring how the rest of the crate communicates.

pub(crate) mod proxy;
pub mod scp;
pub(crate) mod session;
pub mod terminal;

use crate::encoding::hexlify;
use crate::error::DirectoryError;
use crate::indexer::JobQueue;
use crate::role::RoleMatcher;
use crate::twofactor::TwoFactorRegistry;
use crate::user::User;
use crate::vault::VaultHandle;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::RngCore;
use russh::server::{Auth, Config, Handler, Msg, Server, Session};
use russh::{Channel, ChannelId, MethodSet, Pty, Sig};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct SshSettings {
    /// Bind address, e.g. `0.0.0.0:2022`.
    pub listen: String,
    /// Path to the PEM/OpenSSH host key file.
    pub hostkey: PathBuf,
    /// Directory receiving encrypted session spool files.
    pub spool_dir: PathBuf,
}

/// State shared by every connection.
pub(crate) struct Shared {
    pub vault: VaultHandle,
    pub roles: Arc<RoleMatcher>,
    pub twofactor: Arc<TwoFactorRegistry>,
    pub jobs: JobQueue,
    pub spool_dir: PathBuf,
}

/// Everything established during publickey authentication.
#[derive(Debug, Clone)]
pub(crate) struct SessionAuth {
    pub user: String,
    pub session: String,
    pub fingerprint: String,
    pub algo: String,
    /// The SSH login string, carrying the requested target or `config:` flow.
    pub login: String,
}

/// Events forwarded from the server handler callbacks to the session task.
#[derive(Debug)]
pub(crate) enum ClientEvent {
    Data(Vec<u8>),
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Shell,
    Exec {
        command: Vec<u8>,
    },
    Env {
        name: String,
        value: String,
    },
    Subsystem {
        name: String,
    },
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal(Sig),
    Eof,
    Close,
}

/// 128-bit random hex session id.
fn session_id() -> String {
    let mut id = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut id);
    hexlify(&id)
}

/// The accepting server: one [`ClientHandler`] per TCP connection.
pub struct SshProxy {
    shared: Arc<Shared>,
}

impl Server for SshProxy {
    type Handler = ClientHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> ClientHandler {
        match peer_addr {
            Some(addr) => info!("ssh: new connection from {}", addr),
            None => info!("ssh: new connection"),
        }
        ClientHandler {
            shared: self.shared.clone(),
            auth: None,
            channel: None,
            events: None,
        }
    }
}

/// Per-connection handler feeding the session task.
pub struct ClientHandler {
    shared: Arc<Shared>,
    auth: Option<SessionAuth>,
    channel: Option<ChannelId>,
    events: Option<mpsc::UnboundedSender<ClientEvent>>,
}

impl ClientHandler {
    fn forward(&self, channel: ChannelId, event: ClientEvent) {
        if self.channel == Some(channel) {
            if let Some(events) = &self.events {
                let _ = events.send(event);
            }
        }
    }
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        login: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = User::fingerprint(&public_key.public_key_bytes());
        match User::load(&self.shared.vault, &fingerprint) {
            Ok(user) => {
                let session = session_id();
                info!(
                    "ssh[{}]: user '{}' logged in with {} key {}",
                    session,
                    user.name,
                    public_key.name(),
                    fingerprint
                );
                self.auth = Some(SessionAuth {
                    user: user.name,
                    session,
                    fingerprint,
                    algo: public_key.name().to_string(),
                    login: login.to_string(),
                });
                Ok(Auth::Accept)
            }
            Err(DirectoryError::UnknownUser(_)) => {
                warn!("ssh: rejected unknown key {}", fingerprint);
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
            Err(err) => {
                warn!("ssh: unable to authenticate key {}: {}", fingerprint, err);
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.events.is_some() {
            // only the first session channel is bridged
            return Ok(false);
        }
        let auth = self
            .auth
            .clone()
            .context("session channel before authentication")?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.channel = Some(channel.id());
        self.events = Some(tx);

        tokio::spawn(session::run(
            self.shared.clone(),
            auth,
            session.handle(),
            channel.id(),
            rx,
        ));
        Ok(true)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ClientEvent::Data(data.to_vec()));
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ClientEvent::Pty {
                term: term.to_string(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes: modes.to_vec(),
            },
        );
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ClientEvent::Shell);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ClientEvent::Exec {
                command: data.to_vec(),
            },
        );
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ClientEvent::Env {
                name: variable_name.to_string(),
                value: variable_value.to_string(),
            },
        );
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ClientEvent::Subsystem {
                name: name.to_string(),
            },
        );
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ClientEvent::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            },
        );
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ClientEvent::Signal(signal));
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ClientEvent::Eof);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ClientEvent::Close);
        Ok(())
    }
}

/// Run the SSH listener until the task is aborted or the socket fails.
pub async fn serve(
    settings: SshSettings,
    vault: VaultHandle,
    roles: Arc<RoleMatcher>,
    twofactor: Arc<TwoFactorRegistry>,
    jobs: JobQueue,
) -> Result<()> {
    let hostkey = russh_keys::load_secret_key(&settings.hostkey, None)
        .with_context(|| format!("no host key found at {}", settings.hostkey.display()))?;

    let config = Config {
        methods: MethodSet::PUBLICKEY,
        keys: vec![hostkey],
        auth_rejection_time: Duration::from_secs(3),
        auth_rejection_time_initial: Some(Duration::ZERO),
        ..Default::default()
    };

    let mut server = SshProxy {
        shared: Arc::new(Shared {
            vault,
            roles,
            twofactor,
            jobs,
            spool_dir: settings.spool_dir.clone(),
        }),
    };

    info!("ssh: listening on {}", settings.listen);
    server
        .run_on_address(Arc::new(config), settings.listen.as_str())
        .await
        .context("ssh listener failed")?;
    Ok(())
}
