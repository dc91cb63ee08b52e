//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: jumpgate — Audited SSH access at the edge.
//

//! Per-session flow after the first session channel is accepted.
//!
//! In order: second-factor gate, `config:` sub-flows, target parsing, role
//! check, secret resolution, recorder start, backend dial, proxy handoff.
//! Any failure short-circuits to closing the channel; the audit log carries
//! the reason.

use super::proxy::{BackendHandler, ChannelProxy};
use super::terminal::Terminal;
use super::{ClientEvent, SessionAuth, Shared};
use crate::cast::Cast;
use crate::error::DirectoryError;
use crate::target::{Target, TargetAuth};
use anyhow::{bail, Context, Result};
use russh::client;
use russh::server::Handle;
use russh::{Channel, ChannelId};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Entry point spawned for every accepted session channel.
pub(crate) async fn run(
    shared: Arc<Shared>,
    auth: SessionAuth,
    handle: Handle,
    channel: ChannelId,
    events: mpsc::UnboundedReceiver<ClientEvent>,
) {
    let session = auth.session.clone();
    if let Err(err) = drive(shared, auth, handle.clone(), channel, events).await {
        warn!("ssh[{}]: {:#}", session, err);
        let _ = handle.close(channel).await;
    }
}

async fn drive(
    shared: Arc<Shared>,
    auth: SessionAuth,
    handle: Handle,
    channel: ChannelId,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
) -> Result<()> {
    debug!(
        "ssh[{}]: session for '{}' ({} key {})",
        auth.session, auth.user, auth.algo, auth.fingerprint
    );

    let mut pending = VecDeque::new();
    let mut elevated = false;

    // second-factor gate, before anything else happens on the channel
    if let Some(verifier) = shared.twofactor.enabled_for(&auth.user).await? {
        let mut tty = Terminal::new(handle.clone(), channel, &mut events, &mut pending);
        tty.write_line("jumpgate: two-factor authentication required").await?;
        let token = tty.read_password("Enter OTP: ").await?;
        if !verifier.verify(&auth.user, token.trim()).await? {
            warn!(
                "ssh[{}]: two-factor verification failed for '{}'",
                auth.session, auth.user
            );
            tty.write_line("two-factor verification failed").await?;
            let _ = handle.close(channel).await;
            return Ok(());
        }
        elevated = true;
        info!("ssh[{}]: two-factor verified for '{}'", auth.session, auth.user);
    }

    // configuration sub-flows claim the whole session
    if let Some(request) = auth.login.strip_prefix("config:") {
        if let Some(kind) = request.strip_prefix("2fa:") {
            let verifier = shared
                .twofactor
                .get(kind)
                .with_context(|| format!("unknown second-factor kind '{kind}'"))?;
            let mut tty = Terminal::new(handle.clone(), channel, &mut events, &mut pending);
            verifier.setup(&auth.user, &mut tty).await?;
            info!(
                "ssh[{}]: second-factor setup '{}' completed for '{}'",
                auth.session, kind, auth.user
            );
            let _ = handle.close(channel).await;
            return Ok(());
        }
        bail!("unsupported config request '{}'", auth.login);
    }

    // resolve and authorize the requested target
    let mut target = match Target::parse(&auth.login) {
        Ok(target) => target,
        Err(DirectoryError::InvalidTarget(id)) => {
            warn!("ssh[{}]: unable to parse target '{}'", auth.session, id);
            let _ = handle.close(channel).await;
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    let Some(role) = shared.roles.check(&auth.user, &target.id(), elevated) else {
        warn!(
            "ssh[{}]: permission denied for '{}' to '{}'",
            auth.session,
            auth.user,
            target.id()
        );
        let _ = handle.close(channel).await;
        return Ok(());
    };
    info!(
        "ssh[{}]: role '{}' grants '{}' access to '{}'",
        auth.session,
        role,
        auth.user,
        target.id()
    );

    let target_auth = target
        .resolve(&shared.vault)
        .with_context(|| format!("unable to resolve secret for '{}'", target.id()))?;

    // the recorder runs for the whole bridged session
    let cast = Cast::start(shared.vault.clone(), &shared.spool_dir, &auth.session).await?;

    let (backend, backend_channel) =
        connect_backend(&auth.session, &target, target_auth, handle.clone()).await?;
    info!(
        "ssh[{}]: connected to target '{}'",
        auth.session,
        target.id()
    );

    ChannelProxy::new(
        auth.session.clone(),
        handle,
        channel,
        events,
        pending,
        backend,
        backend_channel,
        cast,
        shared.jobs.clone(),
    )
    .run()
    .await
}

/// Dial the backend and open the session channel that will be bridged. The
/// connection handle is returned alongside the channel so it stays alive for
/// the whole bridged session.
async fn connect_backend(
    session: &str,
    target: &Target,
    auth: TargetAuth,
    client_handle: Handle,
) -> Result<(client::Handle<BackendHandler>, Channel<client::Msg>)> {
    let config = Arc::new(client::Config::default());
    let handler = BackendHandler {
        session: session.to_string(),
        client: client_handle,
    };

    let mut backend = client::connect(
        config,
        (target.hostname.as_str(), target.port),
        handler,
    )
    .await
    .with_context(|| format!("unable to reach '{}'", target.id()))?;

    let authenticated = match auth {
        TargetAuth::Password(password) => backend
            .authenticate_password(&target.username, password)
            .await
            .context("backend password authentication failed")?,
        TargetAuth::Key(key) => backend
            .authenticate_publickey(&target.username, key)
            .await
            .context("backend publickey authentication failed")?,
    };
    if !authenticated {
        bail!("backend rejected credentials for '{}'", target.id());
    }

    let channel = backend
        .channel_open_session()
        .await
        .context("unable to open session channel on backend")?;

    Ok((backend, channel))
}
