//! Low-level FTP command/reply codec (RFC 959 §4).
//!
//! Handles:
//! - Formatting FTP commands terminated with `\r\n`
//! - Assembling single-line and multi-line replies from control lines
//! - Parsing the 3-digit reply code and a few reply payloads

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::{FtpCommandKind, FtpReply};
use lazy_static::lazy_static;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

lazy_static! {
    static ref TRANSFER_SIZE: Regex = Regex::new(r"\((\d+) bytes\)").unwrap();
}

/// Render a command line without the trailing CRLF.
pub fn format_command(kind: FtpCommandKind, arg: &str) -> String {
    if arg.is_empty() {
        kind.verb().to_string()
    } else {
        format!("{} {}", kind.verb(), arg)
    }
}

/// Command line as it may appear in logs.
pub fn loggable(line: &str) -> &str {
    if line.starts_with("PASS ") {
        "PASS ****"
    } else {
        line
    }
}

/// Incrementally assembles replies from control-channel lines.
///
/// Multi-line replies look like:
/// ```text
/// 220-Welcome to my FTP server
/// 220-This is line 2
/// 220 End of greeting
/// ```
#[derive(Debug, Default)]
pub struct ReplyAssembler {
    pending: Option<(u16, Vec<String>)>,
}

impl ReplyAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (with or without CRLF). Returns a reply once complete.
    pub fn push_line(&mut self, raw: &str) -> FtpResult<Option<FtpReply>> {
        let line = raw.trim_end_matches(['\r', '\n']);

        if let Some((code, mut lines)) = self.pending.take() {
            lines.push(line.to_string());
            let terminator = format!("{} ", code);
            if line.starts_with(&terminator) || line == code.to_string() {
                return Ok(Some(FtpReply { code, lines }));
            }
            self.pending = Some((code, lines));
            return Ok(None);
        }

        let code = parse_code(line)?;
        // "NNN-" means more lines follow until "NNN " is seen.
        if line.as_bytes().get(3) == Some(&b'-') {
            self.pending = Some((code, vec![line.to_string()]));
            return Ok(None);
        }
        Ok(Some(FtpReply {
            code,
            lines: vec![line.to_string()],
        }))
    }

    /// Drop any half-assembled reply.
    pub fn clear(&mut self) {
        self.pending = None;
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_none()
    }
}

/// Parse the 3-digit reply code from the start of a line.
pub fn parse_code(line: &str) -> FtpResult<u16> {
    if line.len() < 3 || !line.is_char_boundary(3) {
        return Err(FtpError::protocol_error(format!(
            "Reply too short to contain code: '{}'",
            line
        )));
    }
    let digits = &line[..3];
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FtpError::protocol_error(format!(
            "Invalid reply code in: '{}'",
            line
        )));
    }
    digits
        .parse::<u16>()
        .map_err(|_| FtpError::protocol_error(format!("Invalid reply code in: '{}'", line)))
}

/// Parse `257 "/some/path"` into the path string.
pub fn parse_quoted_path(text: &str) -> Option<String> {
    let start = text.find('"')?;
    let end = text[start + 1..].find('"')?;
    Some(text[start + 1..start + 1 + end].to_string())
}

/// Extract the announced size from `150 Opening BINARY mode data connection for x (1234 bytes)`.
pub fn parse_transfer_size(text: &str) -> Option<u64> {
    TRANSFER_SIZE
        .captures(text)
        .and_then(|caps| caps[1].parse::<u64>().ok())
}

// ─── Socket halves ───────────────────────────────────────────────────

/// Read side of the control connection.
pub struct ControlReader {
    reader: BufReader<OwnedReadHalf>,
}

impl ControlReader {
    pub fn new(half: OwnedReadHalf) -> Self {
        Self {
            reader: BufReader::new(half),
        }
    }

    /// Read a single line (including CRLF). `None` on EOF.
    pub async fn read_line(&mut self) -> FtpResult<Option<String>> {
        let mut buf = String::new();
        let n = self.reader.read_line(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf))
    }
}

/// Write side of the control connection.
pub struct ControlWriter {
    writer: OwnedWriteHalf,
}

impl ControlWriter {
    pub fn new(half: OwnedWriteHalf) -> Self {
        Self { writer: half }
    }

    /// Send a raw FTP command line (without trailing CRLF; we add it).
    pub async fn send_command(&mut self, cmd: &str) -> FtpResult<()> {
        let line = format!("{}\r\n", cmd);
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        log::trace!(">>> {}", loggable(cmd));
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_reply() {
        let mut asm = ReplyAssembler::new();
        let reply = asm.push_line("220 Ultimate FTP ready\r\n").unwrap().unwrap();
        assert_eq!(reply.code, 220);
        assert_eq!(reply.lines, vec!["220 Ultimate FTP ready"]);
        assert!(asm.is_empty());
    }

    #[test]
    fn multi_line_reply() {
        let mut asm = ReplyAssembler::new();
        assert!(asm.push_line("220-Welcome\r\n").unwrap().is_none());
        assert!(asm.push_line("220-second line").unwrap().is_none());
        assert!(asm.push_line(" 220 indented, not the end").unwrap().is_none());
        let reply = asm.push_line("220 done").unwrap().unwrap();
        assert_eq!(reply.code, 220);
        assert_eq!(reply.lines.len(), 4);
        assert_eq!(reply.text().lines().last(), Some("220 done"));
    }

    #[test]
    fn garbage_line_is_protocol_error() {
        let mut asm = ReplyAssembler::new();
        assert!(asm.push_line("hello").is_err());
        assert!(asm.push_line("22").is_err());
        assert!(asm.push_line("").is_err());
    }

    #[test]
    fn quoted_path() {
        assert_eq!(
            parse_quoted_path("257 \"/Usb0/games\" is current directory").as_deref(),
            Some("/Usb0/games")
        );
        assert_eq!(parse_quoted_path("257 no quotes"), None);
    }

    #[test]
    fn transfer_size() {
        assert_eq!(
            parse_transfer_size("150 Opening BINARY mode data connection for a.prg (1234 bytes)"),
            Some(1234)
        );
        assert_eq!(parse_transfer_size("150 Here comes the data"), None);
    }

    #[test]
    fn command_formatting() {
        assert_eq!(format_command(FtpCommandKind::Pasv, ""), "PASV");
        assert_eq!(format_command(FtpCommandKind::Cwd, "/my dir"), "CWD /my dir");
        assert_eq!(loggable("PASS hunter2"), "PASS ****");
        assert_eq!(loggable("USER bob"), "USER bob");
    }
}
