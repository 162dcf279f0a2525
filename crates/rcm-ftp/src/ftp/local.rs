//! Local filesystem side of recursive transfers.

use crate::ftp::error::{FtpError, FtpResult};
use std::path::{Path, PathBuf};

/// A directory to create remotely, relative to the upload root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDir {
    /// `/`-separated path below the root; empty for the root itself.
    pub relative: String,
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    /// Relative path of the containing directory.
    pub parent: String,
    pub name: String,
    pub size: u64,
}

/// Snapshot of a local directory tree.
#[derive(Debug, Default)]
pub struct LocalTree {
    /// Parents before children.
    pub directories: Vec<LocalDir>,
    pub files: Vec<LocalFile>,
}

impl LocalTree {
    /// Files that live directly in `relative`.
    pub fn files_in<'a>(&'a self, relative: &'a str) -> impl Iterator<Item = &'a LocalFile> + 'a {
        self.files.iter().filter(move |f| f.parent == relative)
    }
}

/// Walk `root` and collect its directories (sorted by depth) and files.
pub fn walk_local_tree(root: &Path) -> FtpResult<LocalTree> {
    if !root.is_dir() {
        return Err(FtpError::io_error(format!(
            "'{}' is not a directory",
            root.display()
        )));
    }

    let mut tree = LocalTree::default();
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| FtpError::io_error(format!("Walking {}: {}", root.display(), e)))?;
        let relative = relative_path(root, entry.path());

        if entry.file_type().is_dir() {
            tree.directories.push(LocalDir {
                relative,
                depth: entry.depth(),
            });
        } else if entry.file_type().is_file() {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let (parent, name) = match relative.rsplit_once('/') {
                Some((p, n)) => (p.to_string(), n.to_string()),
                None => (String::new(), relative.clone()),
            };
            tree.files.push(LocalFile {
                path: entry.path().to_path_buf(),
                parent,
                name,
                size,
            });
        }
    }

    // Sort by depth so parents are created first
    tree.directories.sort_by_key(|d| d.depth);
    Ok(tree)
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .map(|rel| {
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default()
}

/// Whether a server-supplied entry name is a single, plain path component.
pub fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// Append a `/`-separated relative path to a local base.
///
/// Components that could leave `base` (`..`, backslashes) are rejected.
pub fn local_join(base: &Path, relative: &str) -> FtpResult<PathBuf> {
    let mut path = base.to_path_buf();
    for part in relative.split('/').filter(|c| !c.is_empty() && *c != ".") {
        if part == ".." || part.contains('\\') {
            return Err(FtpError::io_error(format!(
                "Refusing to write outside {}: '{}'",
                base.display(),
                relative
            )));
        }
        path.push(part);
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn walks_parents_first() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("demos");
        fs::create_dir_all(root.join("sub/deeper")).unwrap();
        fs::write(root.join("a.prg"), b"12345").unwrap();
        fs::write(root.join("sub/b.prg"), b"1").unwrap();
        fs::write(root.join("sub/deeper/c.sid"), b"").unwrap();

        let tree = walk_local_tree(&root).unwrap();
        let dirs: Vec<&str> = tree.directories.iter().map(|d| d.relative.as_str()).collect();
        assert_eq!(dirs, vec!["", "sub", "sub/deeper"]);

        let top: Vec<_> = tree.files_in("").collect();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].name, "a.prg");
        assert_eq!(top[0].size, 5);
        assert_eq!(tree.files_in("sub/deeper").next().unwrap().name, "c.sid");
    }

    #[test]
    fn rejects_plain_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x.prg");
        fs::write(&file, b"x").unwrap();
        assert!(walk_local_tree(&file).is_err());
        assert!(walk_local_tree(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn joins_relative_paths() {
        let base = Path::new("/tmp/out");
        assert_eq!(local_join(base, "a/b.prg").unwrap(), Path::new("/tmp/out/a/b.prg"));
        assert_eq!(local_join(base, "").unwrap(), base);
        assert_eq!(local_join(base, "/x//./y/").unwrap(), Path::new("/tmp/out/x/y"));
    }

    #[test]
    fn join_stays_below_base() {
        let base = Path::new("/tmp/out");
        assert!(local_join(base, "games/../../escape.prg").is_err());
        assert!(local_join(base, "..").is_err());
        assert!(local_join(base, "a\\..\\b.prg").is_err());
    }

    #[test]
    fn plain_names() {
        assert!(is_plain_name("GAME.PRG"));
        assert!(is_plain_name("a b..prg"));
        assert!(!is_plain_name(""));
        assert!(!is_plain_name("."));
        assert!(!is_plain_name(".."));
        assert!(!is_plain_name("../../escape.prg"));
        assert!(!is_plain_name("sub/x.prg"));
        assert!(!is_plain_name("c:\\x.prg"));
    }
}
