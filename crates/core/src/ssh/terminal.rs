//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: jumpgate — Audited SSH access at the edge.
//

//! Minimal line terminal over an accepted session channel.
//!
//! Used for the interactive moments before a session is bridged: the
//! second-factor prompt and the `config:` sub-flows. Input arrives as client
//! events; anything that is not keyboard data (pty/shell/exec requests racing
//! ahead of the prompt) is re-queued so the channel proxy sees it later.

use super::ClientEvent;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use std::collections::VecDeque;
use std::io;
use tokio::sync::mpsc;

pub struct Terminal<'a> {
    handle: Handle,
    channel: ChannelId,
    events: &'a mut mpsc::UnboundedReceiver<ClientEvent>,
    pending: &'a mut VecDeque<ClientEvent>,
}

fn client_gone() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "client closed the channel")
}

impl<'a> Terminal<'a> {
    pub(crate) fn new(
        handle: Handle,
        channel: ChannelId,
        events: &'a mut mpsc::UnboundedReceiver<ClientEvent>,
        pending: &'a mut VecDeque<ClientEvent>,
    ) -> Self {
        Terminal {
            handle,
            channel,
            events,
            pending,
        }
    }

    /// Write raw text to the client terminal.
    pub async fn write(&self, text: &str) -> io::Result<()> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(text.as_bytes()))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "unable to write to client"))
    }

    /// Write a line followed by CRLF.
    pub async fn write_line(&self, text: &str) -> io::Result<()> {
        self.write(text).await?;
        self.write("\r\n").await
    }

    /// Prompt for a line without echoing it back (one-time tokens).
    ///
    /// Backspace editing is honored; the line ends at CR or LF. Non-data
    /// events received while prompting are queued for the proxy.
    pub async fn read_password(&mut self, prompt: &str) -> io::Result<String> {
        self.write(prompt).await?;

        let mut line = String::new();
        loop {
            let event = self.events.recv().await.ok_or_else(client_gone)?;
            match event {
                ClientEvent::Data(bytes) => {
                    for byte in bytes {
                        match byte {
                            b'\r' | b'\n' => {
                                self.write("\r\n").await?;
                                return Ok(line);
                            }
                            0x08 | 0x7f => {
                                line.pop();
                            }
                            byte if byte >= 0x20 => line.push(byte as char),
                            _ => {}
                        }
                    }
                }
                ClientEvent::Eof | ClientEvent::Close => return Err(client_gone()),
                other => self.pending.push_back(other),
            }
        }
    }
}
