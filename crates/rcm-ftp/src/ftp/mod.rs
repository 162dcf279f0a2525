//! # rcm-ftp: FTP transfer engine
//!
//! Event-driven RFC 959 client for the device's built-in FTP server, plus
//! the batch scheduler that turns its primitives into recursive,
//! cancellable transfers.
//!
//! Architecture:
//! - `types`: data structures, enums, config, events
//! - `error`: FTP-specific error type
//! - `protocol`: command formatting, reply assembly, control socket halves
//! - `parser`: Unix LIST response parsing
//! - `transfer`: PASV handshake, transfer contexts, data phase
//! - `client`: the protocol state machine (no I/O)
//! - `connection`: tokio driver owning the sockets and the client
//! - `local`: local tree walking for recursive uploads
//! - `queue`: batch transfer scheduler (no I/O)
//! - `service`: task owning the scheduler

pub mod types;
pub mod error;
pub mod protocol;
pub mod parser;
pub mod transfer;
pub mod client;
pub mod connection;
pub mod local;
pub mod queue;
pub mod service;

// Re-exports for lib.rs consumers
pub use types::*;
pub use error::{FtpError, FtpErrorKind, FtpResult};
pub use client::FtpClient;
pub use connection::{FtpConnection, FtpHandle, FtpRequest};
pub use queue::{FtpOperations, TransferQueue};
pub use service::{TransferService, TransferServiceHandle};
