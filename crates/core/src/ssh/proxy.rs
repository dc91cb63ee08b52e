//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: jumpgate — Audited SSH access at the edge.
//

//! Bidirectional channel bridging between client and backend.
//!
//! A proxied session has one selector pumping both directions: client events
//! (fed by the server handler callbacks) flow to the backend channel, backend
//! channel messages flow back through the recorder to the client. Requests
//! are forwarded as they arrive and the backend's success/failure replies are
//! reflected to the requester, so reply order matches request order per
//! direction. Once an `exec` has been observed, teardown waits for the
//! backend's `exit-*` report before closing both sides.

use super::scp::{detect_mode, ScpInterpreter, ScpMode};
use super::ClientEvent;
use crate::cast::Cast;
use crate::indexer::JobQueue;
use anyhow::{Context, Result};
use async_trait::async_trait;
use russh::client;
use russh::server::Handle;
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec};
use russh_keys::key::PublicKey;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Client handler for the backend connection.
///
/// Host keys are not verified: targets are operator-curated vault records.
/// Channels the backend initiates (X11, port forwards) are bridged to the
/// client by a raw pump.
pub(crate) struct BackendHandler {
    pub session: String,
    pub client: Handle,
}

#[async_trait]
impl client::Handler for BackendHandler {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<()> {
        let toward_client = self
            .client
            .channel_open_forwarded_tcpip(
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            )
            .await
            .map_err(|_| anyhow::anyhow!("unable to open forwarded-tcpip channel to client"))?;
        info!(
            "ssh[{}]: bridging forwarded-tcpip channel for {}:{}",
            self.session, connected_address, connected_port
        );
        tokio::spawn(bridge_raw(self.session.clone(), toward_client, channel));
        Ok(())
    }

    async fn server_channel_open_x11(
        &mut self,
        channel: Channel<client::Msg>,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<()> {
        let toward_client = self
            .client
            .channel_open_x11(originator_address, originator_port)
            .await
            .map_err(|_| anyhow::anyhow!("unable to open x11 channel to client"))?;
        info!(
            "ssh[{}]: bridging x11 channel from {}:{}",
            self.session, originator_address, originator_port
        );
        tokio::spawn(bridge_raw(self.session.clone(), toward_client, channel));
        Ok(())
    }
}

/// Raw bidirectional pump for secondary channels. No recording, no
/// interpretation; EOF half-closes propagate and the first close tears both
/// sides down.
async fn bridge_raw(
    session: String,
    mut toward_client: Channel<russh::server::Msg>,
    mut from_backend: Channel<client::Msg>,
) {
    loop {
        tokio::select! {
            msg = toward_client.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if from_backend.data(&data[..]).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if from_backend.extended_data(ext, &data[..]).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::Eof) => {
                    let _ = from_backend.eof().await;
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
            msg = from_backend.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if toward_client.data(&data[..]).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if toward_client.extended_data(ext, &data[..]).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::Eof) => {
                    let _ = toward_client.eof().await;
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }
    let _ = toward_client.close().await;
    let _ = from_backend.close().await;
    debug!("ssh[{}]: secondary channel closed", session);
}

/// The per-session channel proxy.
pub(crate) struct ChannelProxy {
    session: String,
    handle: Handle,
    channel: ChannelId,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    pending: VecDeque<ClientEvent>,
    backend: Channel<client::Msg>,
    // keeps the backend connection alive for the life of the bridge
    _backend_conn: client::Handle<BackendHandler>,
    cast: Cast,
    jobs: JobQueue,

    exec_seen: bool,
    exit_seen: bool,
    client_closed: bool,
    backend_closed: bool,
    scp: Option<(ScpMode, ScpInterpreter)>,
}

enum Side {
    Client(Option<ClientEvent>),
    Backend(Option<ChannelMsg>),
}

impl ChannelProxy {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session: String,
        handle: Handle,
        channel: ChannelId,
        events: mpsc::UnboundedReceiver<ClientEvent>,
        pending: VecDeque<ClientEvent>,
        backend_conn: client::Handle<BackendHandler>,
        backend: Channel<client::Msg>,
        cast: Cast,
        jobs: JobQueue,
    ) -> Self {
        ChannelProxy {
            session,
            handle,
            channel,
            events,
            pending,
            backend,
            _backend_conn: backend_conn,
            cast,
            jobs,
            exec_seen: false,
            exit_seen: false,
            client_closed: false,
            backend_closed: false,
            scp: None,
        }
    }

    /// Bridge until both sides are done, then tear down and hand the
    /// recording to the indexer.
    pub(crate) async fn run(mut self) -> Result<()> {
        let outcome = self.pump().await;
        if let Err(err) = &outcome {
            warn!("ssh[{}]: proxy error: {:#}", self.session, err);
        }

        let _ = self.backend.close().await;
        let _ = self.handle.close(self.channel).await;

        let cast = self.cast;
        if let Err(err) = cast.stop(&self.jobs).await {
            warn!("ssh[{}]: unable to finalize recording: {}", self.session, err);
        }
        info!("ssh[{}]: session ended", self.session);
        outcome
    }

    async fn pump(&mut self) -> Result<()> {
        // events that raced ahead during the pre-session prompts
        while let Some(event) = self.pending.pop_front() {
            self.on_client(event).await?;
        }

        loop {
            let waiting_for_exit = self.exec_seen && !self.exit_seen && !self.backend_closed;
            if self.client_closed && self.backend_closed {
                break;
            }
            if (self.client_closed || self.backend_closed) && !waiting_for_exit {
                break;
            }
            if self.exec_seen && self.exit_seen {
                break;
            }

            let side = tokio::select! {
                event = self.events.recv(), if !self.client_closed => Side::Client(event),
                msg = self.backend.wait(), if !self.backend_closed => Side::Backend(msg),
            };

            match side {
                Side::Client(None) => self.client_closed = true,
                Side::Client(Some(event)) => self.on_client(event).await?,
                Side::Backend(None) => self.backend_closed = true,
                Side::Backend(Some(msg)) => self.on_backend(msg).await?,
            }
        }
        Ok(())
    }

    async fn on_client(&mut self, event: ClientEvent) -> Result<()> {
        match event {
            ClientEvent::Data(bytes) => {
                if let Some((ScpMode::Sink, interpreter)) = &mut self.scp {
                    if let Err(err) = interpreter.feed(&bytes) {
                        warn!("scp[{}]: unable to parse scp: {}", self.session, err);
                        self.scp = None;
                    }
                }
                self.backend
                    .data(&bytes[..])
                    .await
                    .context("short write to backend")?;
            }
            ClientEvent::Pty {
                term,
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes,
            } => {
                self.backend
                    .request_pty(
                        true, &term, col_width, row_height, pix_width, pix_height, &modes,
                    )
                    .await
                    .context("unable to forward pty request")?;
            }
            ClientEvent::Shell => {
                info!("ssh[{}]: shell requested", self.session);
                self.backend
                    .request_shell(true)
                    .await
                    .context("unable to forward shell request")?;
            }
            ClientEvent::Exec { command } => {
                let cmd = String::from_utf8_lossy(&command).into_owned();
                info!("ssh[{}]: executing command '{}'", self.session, cmd);
                self.exec_seen = true;
                if cmd.trim_start().starts_with("scp") {
                    match detect_mode(&cmd) {
                        Some(ScpMode::Source) => {
                            info!(
                                "scp[{}]: detected source mode copy: client <- server",
                                self.session
                            );
                            self.scp =
                                Some((ScpMode::Source, ScpInterpreter::new(&self.session)));
                        }
                        Some(ScpMode::Sink) => {
                            info!(
                                "scp[{}]: detected sink mode copy: client -> server",
                                self.session
                            );
                            self.scp = Some((ScpMode::Sink, ScpInterpreter::new(&self.session)));
                        }
                        None => warn!("scp[{}]: unable to detect mode", self.session),
                    }
                }
                self.backend
                    .exec(true, command)
                    .await
                    .context("unable to forward exec request")?;
            }
            ClientEvent::Env { name, value } => {
                self.backend
                    .set_env(false, &name, &value)
                    .await
                    .context("unable to forward env request")?;
            }
            ClientEvent::Subsystem { name } => {
                info!("ssh[{}]: subsystem '{}' requested", self.session, name);
                self.backend
                    .request_subsystem(true, &name)
                    .await
                    .context("unable to forward subsystem request")?;
            }
            ClientEvent::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            } => {
                self.backend
                    .window_change(col_width, row_height, pix_width, pix_height)
                    .await
                    .context("unable to forward window change")?;
            }
            ClientEvent::Signal(signal) => {
                self.backend
                    .signal(signal)
                    .await
                    .context("unable to forward signal")?;
            }
            ClientEvent::Eof => {
                let _ = self.backend.eof().await;
            }
            ClientEvent::Close => self.client_closed = true,
        }
        Ok(())
    }

    async fn on_backend(&mut self, msg: ChannelMsg) -> Result<()> {
        match msg {
            ChannelMsg::Data { data } => {
                self.cast.record(&data);
                if let Some((ScpMode::Source, interpreter)) = &mut self.scp {
                    if let Err(err) = interpreter.feed(&data) {
                        warn!("scp[{}]: unable to parse scp: {}", self.session, err);
                        self.scp = None;
                    }
                }
                self.handle
                    .data(self.channel, CryptoVec::from_slice(&data))
                    .await
                    .map_err(|_| anyhow::anyhow!("short write to client"))?;
            }
            ChannelMsg::ExtendedData { data, ext } => {
                self.handle
                    .extended_data(self.channel, ext, CryptoVec::from_slice(&data))
                    .await
                    .map_err(|_| anyhow::anyhow!("short write to client"))?;
            }
            ChannelMsg::Success => {
                self.handle
                    .channel_success(self.channel)
                    .await
                    .map_err(|_| anyhow::anyhow!("unable to reflect reply to client"))?;
            }
            ChannelMsg::Failure => {
                self.handle
                    .channel_failure(self.channel)
                    .await
                    .map_err(|_| anyhow::anyhow!("unable to reflect reply to client"))?;
            }
            ChannelMsg::Eof => {
                let _ = self.handle.eof(self.channel).await;
            }
            ChannelMsg::Close => self.backend_closed = true,
            ChannelMsg::ExitStatus { exit_status } => {
                info!(
                    "ssh[{}]: command exited with status {}",
                    self.session, exit_status
                );
                let _ = self
                    .handle
                    .exit_status_request(self.channel, exit_status)
                    .await;
                self.exit_seen = true;
            }
            ChannelMsg::ExitSignal { signal_name, .. } => {
                info!(
                    "ssh[{}]: command exited on signal {:?}",
                    self.session, signal_name
                );
                self.exit_seen = true;
            }
            _ => {}
        }
        Ok(())
    }
}
