//! Data-channel management for FTP transfers.
//!
//! - Passive-mode handshake: parse the `227` tuple and aim the data socket at
//!   the control connection's peer.
//! - Transfer contexts that own the local sink/source of a running LIST,
//!   RETR or STOR.
//! - The completion phase that joins the control-channel "226" with the data
//!   socket close, whichever arrives first.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::FtpCommandKind;
use lazy_static::lazy_static;
use regex::Regex;
use std::fs::File;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

lazy_static! {
    static ref PASV_TUPLE: Regex =
        Regex::new(r"\((\s*\d+\s*),(\s*\d+\s*),(\s*\d+\s*),(\s*\d+\s*),(\s*\d+\s*),(\s*\d+\s*)\)")
            .unwrap();
}

/// Identifies one data connection; events from older ones are stale.
pub type DataChannelId = u64;

// ─── PASV ────────────────────────────────────────────────────────────

/// Parse `(h1,h2,h3,h4,p1,p2)` from a 227 reply and return the port.
///
/// The announced host is not returned: devices behind NAT (or with a
/// misconfigured stack) announce addresses the client cannot reach.
pub fn parse_pasv_port(text: &str) -> FtpResult<u16> {
    let caps = PASV_TUPLE
        .captures(text)
        .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse PASV: {}", text)))?;

    let nums: Vec<u8> = (1..=6)
        .map(|i| {
            caps[i]
                .trim()
                .parse::<u8>()
                .map_err(|_| FtpError::protocol_error(format!("PASV number out of range: {}", text)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok((nums[4] as u16) * 256 + (nums[5] as u16))
}

/// Data address for a passive transfer: control peer + announced port.
pub fn passive_address(control_peer: IpAddr, port: u16) -> SocketAddr {
    SocketAddr::new(control_peer, port)
}

// ─── Transfer contexts ───────────────────────────────────────────────

/// Where downloaded bytes go.
#[derive(Debug)]
pub enum DownloadSink {
    File { path: PathBuf, file: File },
    Memory(Vec<u8>),
}

/// Local resources bound to a queued command.
#[derive(Debug)]
pub enum CommandPayload {
    None,
    Download(DownloadSink),
    Upload { path: PathBuf, file: File, size: u64 },
}

impl CommandPayload {
    /// Release the bound handle and, for downloads to disk, remove the
    /// partial file.
    pub fn discard(self) {
        match self {
            CommandPayload::Download(DownloadSink::File { path, file }) => {
                drop(file);
                if let Err(e) = std::fs::remove_file(&path) {
                    log::debug!("Could not remove partial file {}: {}", path.display(), e);
                }
            }
            CommandPayload::Download(DownloadSink::Memory(_)) => {}
            CommandPayload::Upload { file, .. } => drop(file),
            CommandPayload::None => {}
        }
    }
}

/// State of the transfer currently using the data channel.
#[derive(Debug)]
pub enum TransferContext {
    List {
        path: String,
        buffer: Vec<u8>,
    },
    Retrieve {
        remote_path: String,
        sink: DownloadSink,
        received: u64,
        total: Option<u64>,
    },
    Store {
        remote_path: String,
        local_path: PathBuf,
        file: File,
        sent: u64,
        total: u64,
        /// Server acknowledged STOR with 150/125; bytes may flow.
        started: bool,
        /// Local file exhausted, data socket closed by us.
        finished_writing: bool,
    },
}

impl TransferContext {
    /// Move the command's payload into a context for the transfer it starts.
    pub fn start(kind: FtpCommandKind, arg: &str, payload: CommandPayload) -> FtpResult<Self> {
        match (kind, payload) {
            (FtpCommandKind::List, CommandPayload::None) => Ok(TransferContext::List {
                path: arg.to_string(),
                buffer: Vec::new(),
            }),
            (FtpCommandKind::Retr, CommandPayload::Download(sink)) => {
                Ok(TransferContext::Retrieve {
                    remote_path: arg.to_string(),
                    sink,
                    received: 0,
                    total: None,
                })
            }
            (FtpCommandKind::Stor, CommandPayload::Upload { path, file, size }) => {
                Ok(TransferContext::Store {
                    remote_path: arg.to_string(),
                    local_path: path,
                    file,
                    sent: 0,
                    total: size,
                    started: false,
                    finished_writing: false,
                })
            }
            (kind, payload) => {
                payload.discard();
                Err(FtpError::protocol_error(format!(
                    "{} has no matching transfer payload",
                    kind.verb()
                )))
            }
        }
    }

    /// Append bytes received on the data channel.
    pub fn absorb(&mut self, chunk: &[u8]) -> FtpResult<()> {
        match self {
            TransferContext::List { buffer, .. } => {
                buffer.extend_from_slice(chunk);
                Ok(())
            }
            TransferContext::Retrieve { sink, received, .. } => {
                match sink {
                    DownloadSink::File { file, path } => file.write_all(chunk).map_err(|e| {
                        FtpError::io_error(format!("Write to {} failed: {}", path.display(), e))
                    })?,
                    DownloadSink::Memory(buf) => buf.extend_from_slice(chunk),
                }
                *received += chunk.len() as u64;
                Ok(())
            }
            TransferContext::Store { .. } => {
                log::debug!("Ignoring {} bytes received during STOR", chunk.len());
                Ok(())
            }
        }
    }

    /// Read the next upload chunk. An empty vector means end of file.
    pub fn next_chunk(&mut self, chunk_size: usize) -> FtpResult<Vec<u8>> {
        match self {
            TransferContext::Store {
                file, local_path, ..
            } => {
                let mut buf = vec![0u8; chunk_size.max(1)];
                let n = file.read(&mut buf).map_err(|e| {
                    FtpError::io_error(format!("Read from {} failed: {}", local_path.display(), e))
                })?;
                buf.truncate(n);
                Ok(buf)
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Release local resources after a failure.
    pub fn discard(self) {
        match self {
            TransferContext::Retrieve { sink, .. } => CommandPayload::Download(sink).discard(),
            TransferContext::Store { file, .. } => drop(file),
            TransferContext::List { .. } => {}
        }
    }

    pub fn is_store(&self) -> bool {
        matches!(self, TransferContext::Store { .. })
    }
}

/// Completion phase of the running data transfer.
///
/// The final control reply and the data socket close can arrive in either
/// order; the transfer finishes only once both are seen.
#[derive(Debug)]
pub enum DataPhase {
    Idle,
    /// PASV accepted, data socket connecting; the transfer command waits in
    /// the queue until the connection is up.
    Connecting { channel: DataChannelId },
    /// Data socket open, transfer command sent; neither final signal seen.
    Streaming {
        channel: DataChannelId,
        ctx: TransferContext,
    },
    /// Data socket closed (or failed); waiting for the final control reply.
    AwaitingControl {
        ctx: TransferContext,
        failure: Option<FtpError>,
    },
    /// Final control reply arrived first; waiting for the data socket to
    /// drain and close.
    AwaitingData {
        channel: DataChannelId,
        ctx: TransferContext,
    },
}

impl DataPhase {
    pub fn channel(&self) -> Option<DataChannelId> {
        match self {
            DataPhase::Connecting { channel }
            | DataPhase::Streaming { channel, .. }
            | DataPhase::AwaitingData { channel, .. } => Some(*channel),
            DataPhase::Idle | DataPhase::AwaitingControl { .. } => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, DataPhase::Idle)
    }

    /// Tear down, releasing any local resources.
    pub fn reset(&mut self) {
        match std::mem::replace(self, DataPhase::Idle) {
            DataPhase::Streaming { ctx, .. }
            | DataPhase::AwaitingControl { ctx, .. }
            | DataPhase::AwaitingData { ctx, .. } => ctx.discard(),
            DataPhase::Idle | DataPhase::Connecting { .. } => {}
        }
    }
}
