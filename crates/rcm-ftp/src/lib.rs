//! # rcm-ftp – FTP Transfer Engine
//!
//! File transfer to and from a network-attached retro computer over its
//! built-in FTP server:
//!   • Event-driven RFC 959 client (USER/PASS, PWD/CWD, TYPE, PASV)
//!   • LIST / RETR / STOR over short-lived passive data connections
//!   • Completion handling that tolerates 226 and data close in any order
//!   • Batch scheduler for recursive upload, download and delete
//!   • Overwrite and folder-exists prompts, cancellation, retry

pub mod ftp;
