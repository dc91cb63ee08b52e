//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: jumpgate — Audited SSH access at the edge.
//

use anyhow::{bail, Context, Result};
use clap::Parser;
use jumpgate_core::indexer::{Indexer, JobQueue};
use jumpgate_core::role::RoleMatcher;
use jumpgate_core::ssh::{self, SshSettings};
use jumpgate_core::twofactor::{TwoFactorRegistry, YubicoClient, YubikeyVerifier};
use jumpgate_core::vault::{Vault, VaultHandle, BUCKET_ADMINS};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::EnvFilter;

// ---- CLI --------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "jumpgate-server",
    version,
    about = "Audited SSH jump proxy with an encrypted credential vault"
)]
struct Args {
    /// Address the SSH listener binds to
    #[arg(short, long, default_value = "0.0.0.0:2022")]
    listen: String,

    /// Path to the SSH host key file
    #[arg(long, default_value = "jumpgate_host_key")]
    hostkey: PathBuf,

    /// Path to the vault database
    #[arg(long, default_value = "jumpgate.db")]
    vault: PathBuf,

    /// Directory for encrypted session spool files (defaults to the system
    /// temp directory)
    #[arg(long)]
    spool_dir: Option<PathBuf>,

    /// Run the first-time setup prompts and exit
    #[arg(long)]
    setup: bool,

    /// Prompt for the vault password and unlock at startup
    #[arg(long)]
    unlock: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

// ---- First-time setup -------------------------------------------------------

/// Prompt for the unlock and admin passwords, initialize the key-derivation
/// descriptor and seed the default admin account.
fn setup(vault: &VaultHandle) -> Result<()> {
    let password = rpassword::prompt_password("Vault password: ")?;
    let confirm = rpassword::prompt_password("Repeat vault password: ")?;
    if password != confirm {
        bail!("passwords do not match");
    }

    vault
        .unlock(password)
        .context("unable to initialize the vault")?;

    let admin = rpassword::prompt_password("Admin password: ")?;
    let challenge = bcrypt::hash(&admin, jumpgate_core::vault::keyderivation::BCRYPT_COST)?;
    vault.set_raw(BUCKET_ADMINS, "admin", challenge.as_bytes())?;

    vault.lock();
    println!("vault initialized; admin account 'admin' seeded");
    Ok(())
}

// ---- Main -------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("unable to install SIGINT handler");
    };
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("unable to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_timer(ChronoUtc::rfc_3339())
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let vault = Vault::open(&args.vault).context("unable to open vault database")?;

    if args.setup {
        return setup(&vault);
    }

    if args.unlock {
        let password = rpassword::prompt_password("Vault password: ")?;
        vault.unlock(password).context("unable to unlock vault")?;
    }

    // roles can only be decrypted once the vault is unlocked
    let roles = Arc::new(RoleMatcher::new());
    {
        let vault = vault.clone();
        let roles = roles.clone();
        tokio::spawn(async move {
            vault.wait_unlocked().await;
            match roles.load(&vault) {
                Ok(count) => info!("role_manager: {} roles loaded", count),
                Err(err) => error!("role_manager: unable to load roles: {}", err),
            }
        });
    }

    let twofactor = Arc::new(TwoFactorRegistry::new());
    let yubikey = YubikeyVerifier::new(vault.clone());
    let _ = yubikey.spawn_initializer(Box::new(
        |client_id, api_key| -> Arc<dyn jumpgate_core::twofactor::OtpUpstream> {
            YubicoClient::new(client_id, api_key)
        },
    ));
    twofactor.register(yubikey);

    let (jobs, job_rx) = JobQueue::channel();
    let indexer = Indexer::new(vault.clone());
    let recovered = indexer.recover(&jobs)?;
    if recovered > 0 {
        info!("indexer: {} pending jobs recovered", recovered);
    }
    let _ = indexer.spawn(job_rx);

    let settings = SshSettings {
        listen: args.listen,
        hostkey: args.hostkey,
        spool_dir: args.spool_dir.unwrap_or_else(std::env::temp_dir),
    };

    tokio::select! {
        result = ssh::serve(settings, vault.clone(), roles, twofactor, jobs) => result?,
        _ = shutdown_signal() => info!("shutdown signal received"),
    }

    vault.lock();
    Ok(())
}
