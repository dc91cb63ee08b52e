//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: jumpgate — Audited SSH access at the edge.
//

//! Turning recorded spool files into replayable transcripts.
//!
//! The job queue is an in-memory channel, but the pending jobs themselves are
//! durable: a `job~<sid>` record exists in the vault from recording start
//! until indexing succeeds, so [`Indexer::recover`] can re-enqueue everything
//! that was in flight when the process died. The worker runs once the vault
//! has been unlocked and leaves a failing job queued for a later retry.

use crate::cast::{job_key, jobmeta_key, CastEntry, CastHeader, JobRecord, RECORD_CHUNK};
use crate::encoding::unhexlify;
use crate::error::{JumpgateError, VaultError};
use crate::vault::{VaultHandle, BUCKET_CASTS};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20Legacy;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Handoff of pending indexing jobs, keyed by session id.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<String>,
}

impl JobQueue {
    /// Create the queue and its consuming end.
    pub fn channel() -> (JobQueue, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (JobQueue { tx }, rx)
    }

    /// Enqueue the indexing job for `session`. Never blocks.
    pub fn enqueue(&self, session: &str) {
        let _ = self.tx.send(session.to_string());
    }
}

/// Finalized transcript, as stored under `casts/<sid>`.
#[derive(Debug, Serialize)]
struct CastTranscript {
    duration: f64,
    stdout: Vec<(f64, String)>,
    width: u32,
    height: u32,
    version: u32,
}

/// The single long-running indexing worker.
pub struct Indexer {
    vault: VaultHandle,
}

impl Indexer {
    pub fn new(vault: VaultHandle) -> Self {
        Indexer { vault }
    }

    /// Re-enqueue every `job~` record left over from a previous run.
    pub fn recover(&self, jobs: &JobQueue) -> Result<usize, VaultError> {
        let pending = self.vault.scan(BUCKET_CASTS, "job~", 0, -1, true, false)?;
        for (key, _) in &pending {
            let session = key.trim_start_matches("job~");
            info!("indexer: recovered pending job for session {}", session);
            jobs.enqueue(session);
        }
        Ok(pending.len())
    }

    /// Spawn the worker. It waits for the first unlock, then drains the
    /// queue for the life of the process; a failing job is logged and left
    /// in place for a restart-triggered retry.
    pub fn spawn(self, mut jobs: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.vault.wait_unlocked().await;
            info!("indexer: worker started");

            while let Some(session) = jobs.recv().await {
                if let Err(err) = self.index(&session).await {
                    error!("indexer[{}]: unable to index session: {}", session, err);
                }
            }
        })
    }

    /// Index a single session: decrypt the spool file, rebuild the records,
    /// store the transcript and clean up the job state.
    async fn index(&self, session: &str) -> Result<(), JumpgateError> {
        let job: JobRecord = serde_json::from_slice(
            &self
                .vault
                .get(BUCKET_CASTS, &job_key(session))?
                .ok_or_else(|| {
                    VaultError::CorruptRecord(format!("missing job record for {session}"))
                })?,
        )?;
        let header: CastHeader = serde_json::from_slice(
            &self
                .vault
                .get(BUCKET_CASTS, &jobmeta_key(session))?
                .ok_or_else(|| {
                    VaultError::CorruptRecord(format!("missing jobmeta record for {session}"))
                })?,
        )?;

        let key = unhexlify(&job.key)
            .map_err(|_| VaultError::CorruptRecord("job key".into()))?;
        let nonce = unhexlify(&job.nonce)
            .map_err(|_| VaultError::CorruptRecord("job nonce".into()))?;
        let mut cipher = ChaCha20Legacy::new_from_slices(&key, &nonce)
            .map_err(|_| VaultError::CorruptRecord("job key or nonce length".into()))?;

        let mut records = Vec::new();
        let mut duration = 0f64;

        // decrypt the spool chunk-wise and split it into JSONL entries
        let mut file = tokio::fs::File::open(&job.path).await?;
        let mut pending = Vec::new();
        let mut buf = vec![0u8; RECORD_CHUNK];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            cipher.apply_keystream(&mut buf[..n]);
            pending.extend_from_slice(&buf[..n]);

            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                let entry: CastEntry = serde_json::from_slice(&line[..line.len() - 1])?;
                let data = unhexlify(&entry.data)
                    .map_err(|_| VaultError::CorruptRecord("cast entry data".into()))?;
                duration += entry.delay;
                records.push((entry.delay, String::from_utf8_lossy(&data).into_owned()));
            }
        }

        let transcript = CastTranscript {
            duration,
            stdout: records,
            width: header.width,
            height: header.height,
            version: header.version,
        };
        self.vault
            .set(BUCKET_CASTS, session, &serde_json::to_vec(&transcript)?)?;
        self.vault.set(
            BUCKET_CASTS,
            &format!("start~{}~{}", header.start, session),
            session.as_bytes(),
        )?;

        self.vault.delete(BUCKET_CASTS, &job_key(session))?;
        self.vault.delete(BUCKET_CASTS, &jobmeta_key(session))?;
        tokio::fs::remove_file(&job.path).await?;

        info!(
            "indexer[{}]: stored transcript ({} records, {:.3}s)",
            session,
            transcript.stdout.len(),
            transcript.duration
        );
        Ok(())
    }
}
