//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: jumpgate — Audited SSH access at the edge.
//

//! Session recording into encrypted spool files.
//!
//! While a session runs, every server→client chunk is handed to a background
//! task which stamps it with the interval since the previous chunk and
//! appends it, ChaCha20-encrypted, to a spool file. The vault carries a
//! `job~<sid>` record describing how to decrypt that file and a
//! `jobmeta~<sid>` record holding the transcript header, so a crash between
//! session end and indexing loses nothing. After the session the indexer
//! rewrites the spool into a replayable transcript (asciicast v1 layout, as
//! consumed by an asciinema-style player).
//!
//! The delay attributed to a chunk is the wall-clock interval between
//! successive arrivals at the recorder task, not between bytes on the wire;
//! that approximation is deliberate.

use crate::encoding::hexlify;
use crate::error::RecorderError;
use crate::indexer::JobQueue;
use crate::vault::{VaultHandle, BUCKET_CASTS};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20Legacy;
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use zeroize::Zeroize;

/// Chunk size of the recording byte pump.
pub const RECORD_CHUNK: usize = 32 * 1024;

/// Default terminal geometry recorded in every transcript header.
pub const CAST_WIDTH: u32 = 80;
pub const CAST_HEIGHT: u32 = 24;
pub const CAST_VERSION: u32 = 1;

const SPOOL_KEY_LEN: usize = 32;
const SPOOL_NONCE_LEN: usize = 8;
const SPOOL_ROUNDS: u32 = 20;

/// Vault key for the pending-job descriptor of a session.
pub(crate) fn job_key(session: &str) -> String {
    format!("job~{session}")
}

/// Vault key for the partial transcript header of a session.
pub(crate) fn jobmeta_key(session: &str) -> String {
    format!("jobmeta~{session}")
}

/// Pending-job descriptor: everything needed to decrypt a spool file.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct JobRecord {
    pub key: String,
    pub nonce: String,
    pub rounds: u32,
    pub path: String,
}

/// Transcript header written at recording start.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CastHeader {
    pub session: String,
    pub start: String,
    pub width: u32,
    pub height: u32,
    pub version: u32,
    pub duration: f64,
}

/// One recorded chunk, as persisted in the spool file (JSONL).
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CastEntry {
    pub delay: f64,
    pub data: String,
}

enum CastEvent {
    Chunk(String),
    Stop,
}

/// Append-only spool file encrypting everything through a ChaCha20 stream.
struct SpoolFile {
    file: File,
    cipher: ChaCha20Legacy,
}

impl SpoolFile {
    async fn create(path: &Path, key: &[u8], nonce: &[u8]) -> Result<Self, RecorderError> {
        let cipher = ChaCha20Legacy::new_from_slices(key, nonce).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad spool key or nonce")
        })?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        Ok(SpoolFile { file, cipher })
    }

    async fn append(&mut self, line: &[u8]) -> Result<(), RecorderError> {
        let mut buf = line.to_vec();
        self.cipher.apply_keystream(&mut buf);
        self.file.write_all(&buf).await?;
        Ok(())
    }
}

/// A live session recording.
pub struct Cast {
    session: String,
    vault: VaultHandle,
    events: mpsc::UnboundedSender<CastEvent>,
    writer: JoinHandle<f64>,
}

impl Cast {
    /// Start recording for `session`: create the spool file, register the
    /// `job~` and `jobmeta~` records and spawn the background writer.
    pub async fn start(
        vault: VaultHandle,
        spool_dir: &Path,
        session: &str,
    ) -> Result<Cast, RecorderError> {
        if session.is_empty() {
            return Err(RecorderError::NoSession);
        }

        let mut key = [0u8; SPOOL_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        let mut nonce = [0u8; SPOOL_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let path: PathBuf = spool_dir.join(format!("jumpgate-{session}.rec"));
        let spool = SpoolFile::create(&path, &key, &nonce).await?;

        let job = JobRecord {
            key: hexlify(&key),
            nonce: hexlify(&nonce),
            rounds: SPOOL_ROUNDS,
            path: path.to_string_lossy().into_owned(),
        };
        vault.set(BUCKET_CASTS, &job_key(session), &serde_json::to_vec(&job)?)?;
        key.zeroize();

        let header = CastHeader {
            session: session.to_string(),
            start: Utc::now().to_rfc3339(),
            width: CAST_WIDTH,
            height: CAST_HEIGHT,
            version: CAST_VERSION,
            duration: 0.0,
        };
        vault.set(
            BUCKET_CASTS,
            &jobmeta_key(session),
            &serde_json::to_vec(&header)?,
        )?;

        info!("ssh[{}]: storing recording into {}", session, path.display());

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(session.to_string(), spool, rx));

        Ok(Cast {
            session: session.to_string(),
            vault,
            events: tx,
            writer,
        })
    }

    /// Enqueue a chunk for recording. Never blocks; if the writer is gone
    /// the chunk is silently dropped (the session keeps flowing).
    pub fn record(&self, chunk: &[u8]) {
        let _ = self.events.send(CastEvent::Chunk(hexlify(chunk)));
    }

    /// Cooperative byte pump from `src` to `dst` that records everything it
    /// forwards. Reads up to 32 KiB at a time, enqueues the chunk without
    /// blocking, then writes exactly what was read before reading again. A
    /// short write is fatal.
    pub async fn copy<R, W>(&self, dst: &mut W, src: &mut R) -> Result<u64, RecorderError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; RECORD_CHUNK];
        let mut written = 0u64;
        loop {
            let n = src.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.record(&buf[..n]);
            dst.write_all(&buf[..n]).await?;
            written += n as u64;
        }
        dst.flush().await?;
        Ok(written)
    }

    /// Stop recording: flush the writer, settle the recorded duration into
    /// `jobmeta~<sid>` and enqueue the indexing job.
    pub async fn stop(self, jobs: &JobQueue) -> Result<(), RecorderError> {
        let _ = self.events.send(CastEvent::Stop);
        let duration = self.writer.await.unwrap_or(0.0);

        if let Some(raw) = self.vault.get(BUCKET_CASTS, &jobmeta_key(&self.session))? {
            if let Ok(mut header) = serde_json::from_slice::<CastHeader>(&raw) {
                header.duration = duration;
                self.vault.set(
                    BUCKET_CASTS,
                    &jobmeta_key(&self.session),
                    &serde_json::to_vec(&header)?,
                )?;
            }
        }

        info!("ssh[{}]: recording stopped", self.session);
        jobs.enqueue(&self.session);
        Ok(())
    }

    pub fn session(&self) -> &str {
        &self.session
    }
}

/// Background writer: stamp each chunk with the interval since the previous
/// one, encrypt and append it, and accumulate the total duration.
async fn run_writer(
    session: String,
    mut spool: SpoolFile,
    mut events: mpsc::UnboundedReceiver<CastEvent>,
) -> f64 {
    let mut duration = 0f64;
    let mut last = Instant::now();

    loop {
        let event = match events.recv().await {
            None | Some(CastEvent::Stop) => break,
            Some(CastEvent::Chunk(data)) => data,
        };

        let now = Instant::now();
        let delay = now.duration_since(last).as_secs_f64();
        last = now;

        let entry = CastEntry { delay, data: event };
        let mut line = match serde_json::to_vec(&entry) {
            Ok(line) => line,
            Err(err) => {
                warn!("ssh[{}]: unable to encode cast entry: {}", session, err);
                continue;
            }
        };
        line.push(b'\n');

        if let Err(err) = spool.append(&line).await {
            warn!("ssh[{}]: unable to append to recording: {}", session, err);
            break;
        }
        duration += delay;
    }

    if let Err(err) = spool.file.flush().await {
        warn!("ssh[{}]: unable to flush recording: {}", session, err);
    }
    duration
}
