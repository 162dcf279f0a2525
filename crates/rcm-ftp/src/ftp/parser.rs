//! LIST response parser.
//!
//! Understands **Unix-style** (`ls -l`) lines:
//! `-rwxr-xr-x 1 owner group 1234 Jan  1 12:00 file.txt`
//!
//! The device's firmware emits this shape; anything else is kept as a bare
//! file name so an odd listing never hides entries.

use crate::ftp::types::FtpEntry;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// ```text
    /// drwxr-xr-x   2 user group  4096 Jan  1 12:00 dirname
    /// -rw-r--r--   1 user group  1234 Jan  1  2025 file with spaces.prg
    /// ```
    static ref UNIX_LINE: Regex = Regex::new(
        r"(?x)
        ^([d-])([rwxsStT-]{9})\s+        # type flag + permissions
        (?:\d+\s+)?                      # link count
        (?:\S+\s+){0,2}?                 # owner, group
        (\d+)\s+                         # size
        (?:\w{3}\s+\d{1,2}\s+[\d:]+)\s   # date
        (.+)$                            # name (may contain spaces)
        "
    )
    .unwrap();
}

/// Parse a full multi-line LIST response body.
pub fn parse_listing(raw: &str) -> Vec<FtpEntry> {
    raw.lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty())
        .filter(|l| !l.starts_with("total "))
        .map(parse_line)
        .filter(|e| !e.name.is_empty() && e.name != "." && e.name != "..")
        .collect()
}

/// Parse a single line from a listing.
fn parse_line(line: &str) -> FtpEntry {
    if let Some(entry) = parse_unix(line) {
        return entry;
    }
    // Fallback: treat the whole line as a filename
    FtpEntry::file(line.trim(), 0)
}

fn parse_unix(line: &str) -> Option<FtpEntry> {
    let caps = UNIX_LINE.captures(line)?;

    let is_directory = caps.get(1)?.as_str() == "d";
    let permissions = caps.get(2)?.as_str().to_string();
    let size = caps.get(3)?.as_str().parse::<u64>().unwrap_or(0);
    let name = caps.get(4)?.as_str().trim_start().to_string();

    Some(FtpEntry {
        name,
        is_directory,
        size,
        permissions: Some(permissions),
    })
}
