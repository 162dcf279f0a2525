//! Batch transfer scheduler.
//!
//! Turns single-shot FTP primitives into recursive, cancellable,
//! conflict-aware batches and drives the protocol client one command at a
//! time. The queue is synchronous: callers feed it [`FtpEvent`]s and user
//! decisions, and collect [`QueueEvent`]s with [`TransferQueue::take_events`].
//!
//! Batches run strictly in submission order. Directory batches pass
//! through extra phases before their items run:
//!
//! - download/delete: breadth-first `LIST` scan
//! - upload: destination check, then `MKD` for every level, parents first

use crate::ftp::error::FtpError;
use crate::ftp::local::{self, LocalDir, LocalTree};
use crate::ftp::types::*;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// The protocol-client primitives the scheduler needs.
#[cfg_attr(test, mockall::automock)]
pub trait FtpOperations {
    fn is_logged_in(&self) -> bool;
    fn list(&mut self, path: &str);
    fn make_directory(&mut self, path: &str);
    fn remove_directory(&mut self, path: &str);
    fn download(&mut self, remote_path: &str, local_path: &Path);
    fn upload(&mut self, local_path: &Path, remote_path: &str);
    fn remove(&mut self, path: &str);
    fn abort(&mut self);
}

// ─── Remote paths ────────────────────────────────────────────────────

/// Drop trailing slashes; the root stays `/`.
pub fn normalize_remote(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/".into()
    } else {
        trimmed.to_string()
    }
}

pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

pub fn remote_name(path: &str) -> String {
    let norm = normalize_remote(path);
    match norm.rsplit_once('/') {
        Some((_, name)) => name.to_string(),
        None => norm,
    }
}

pub fn remote_parent(path: &str) -> String {
    let norm = normalize_remote(path);
    match norm.rsplit_once('/') {
        Some(("", _)) => "/".into(),
        Some((parent, _)) => parent.to_string(),
        None => String::new(),
    }
}

/// Path of `path` below `root`, `/`-separated, without a leading slash.
fn remote_relative(root: &str, path: &str) -> String {
    let root = normalize_remote(root);
    path.strip_prefix(root.as_str())
        .unwrap_or(path)
        .trim_start_matches('/')
        .to_string()
}

// ─── Internal state ──────────────────────────────────────────────────

/// The protocol reply the queue is waiting for.
#[derive(Debug, Clone, PartialEq)]
enum Awaiting {
    Scan { batch: u64, path: String },
    Destination { batch: u64, parent: String },
    Mkdir { batch: u64, path: String },
    ConflictCheck { item: String, parent: String },
    Item { id: String },
}

/// A question put to the user.
#[derive(Debug, Clone, PartialEq)]
enum Prompt {
    Overwrite { item: String },
    FolderExists { batch: u64 },
}

#[derive(Debug)]
struct Batch {
    id: u64,
    kind: TransferKind,
    description: String,
    is_directory: bool,
    phase: BatchPhase,
    progress: BatchProgress,
    /// Download: local destination. Upload: local source.
    local_root: PathBuf,
    /// Download/delete: remote source. Upload: remote destination.
    remote_root: String,
    scan_queue: VecDeque<String>,
    /// Directories listed so far, breadth-first.
    scanned_dirs: Vec<String>,
    destination_checked: bool,
    creation: VecDeque<LocalDir>,
    tree: Option<LocalTree>,
}

impl Batch {
    fn new(id: u64, kind: TransferKind, description: String, is_directory: bool) -> Self {
        Self {
            id,
            kind,
            description,
            is_directory,
            phase: BatchPhase::Queued,
            progress: BatchProgress {
                batch_id: id,
                ..BatchProgress::default()
            },
            local_root: PathBuf::new(),
            remote_root: String::new(),
            scan_queue: VecDeque::new(),
            scanned_dirs: Vec::new(),
            destination_checked: false,
            creation: VecDeque::new(),
            tree: None,
        }
    }

    fn info(&self) -> BatchInfo {
        BatchInfo {
            id: self.id,
            kind: self.kind,
            description: self.description.clone(),
            is_directory: self.is_directory,
            phase: self.phase,
            progress: self.progress.clone(),
        }
    }
}

// ─── Queue ───────────────────────────────────────────────────────────

pub struct TransferQueue<F: FtpOperations> {
    ftp: F,
    config: QueueConfig,
    batches: Vec<Batch>,
    items: Vec<TransferItem>,
    next_batch_id: u64,
    awaiting: Option<Awaiting>,
    prompt: Option<Prompt>,
    /// Remote listings by normalized directory path.
    remote_cache: HashMap<String, Vec<FtpEntry>>,
    /// Aborts sent but not yet acknowledged with `FtpEvent::Aborted`.
    unacked_aborts: usize,
    processing: bool,
    events: Vec<QueueEvent>,
}

impl<F: FtpOperations> TransferQueue<F> {
    pub fn new(ftp: F, config: QueueConfig) -> Self {
        Self {
            ftp,
            config,
            batches: Vec::new(),
            items: Vec::new(),
            next_batch_id: 1,
            awaiting: None,
            prompt: None,
            remote_cache: HashMap::new(),
            unacked_aborts: 0,
            processing: false,
            events: Vec::new(),
        }
    }

    pub fn ftp(&self) -> &F {
        &self.ftp
    }

    pub fn take_events(&mut self) -> Vec<QueueEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn set_auto_overwrite(&mut self, enabled: bool) {
        self.config.auto_overwrite = enabled;
    }

    pub fn set_auto_merge(&mut self, enabled: bool) {
        self.config.auto_merge = enabled;
    }

    // ─── Enqueue ─────────────────────────────────────────────────

    /// Upload one file to the full remote path `remote_path`.
    pub fn enqueue_upload(&mut self, local_path: &Path, remote_path: &str) -> Option<u64> {
        if !self.accepting() {
            return None;
        }
        let size = std::fs::metadata(local_path).map(|m| m.len()).ok();
        let id = self.add_batch(
            TransferKind::Upload,
            format!("Upload {}", remote_name(remote_path)),
            false,
        );
        self.push_item(id, TransferKind::Upload, local_path.to_path_buf(), remote_path.to_string(), false, size);
        self.start_single(id)
    }

    /// Download one file to the full local path `local_path`.
    pub fn enqueue_download(&mut self, local_path: &Path, remote_path: &str) -> Option<u64> {
        if !self.accepting() {
            return None;
        }
        let id = self.add_batch(
            TransferKind::Download,
            format!("Download {}", remote_name(remote_path)),
            false,
        );
        self.push_item(id, TransferKind::Download, local_path.to_path_buf(), remote_path.to_string(), false, None);
        self.start_single(id)
    }

    /// Upload `local_dir` into `remote_dir`, as `remote_dir/<name of local_dir>`.
    pub fn enqueue_recursive_upload(&mut self, local_dir: &Path, remote_dir: &str) -> Option<u64> {
        if !self.accepting() {
            return None;
        }
        let name = local_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = self.add_batch(TransferKind::Upload, format!("Upload folder {}", name), true);
        if let Some(batch) = self.batch_mut(id) {
            batch.local_root = local_dir.to_path_buf();
            batch.remote_root = join_remote(&normalize_remote(remote_dir), &name);
        }
        self.enqueued(id)
    }

    /// Download `remote_dir` into `local_dir`, as `local_dir/<name of remote_dir>`.
    pub fn enqueue_recursive_download(&mut self, local_dir: &Path, remote_dir: &str) -> Option<u64> {
        if !self.accepting() {
            return None;
        }
        let name = remote_name(remote_dir);
        let id = self.add_batch(TransferKind::Download, format!("Download folder {}", name), true);
        if let Some(batch) = self.batch_mut(id) {
            batch.local_root = local_dir.join(&name);
            batch.remote_root = normalize_remote(remote_dir);
        }
        self.enqueued(id)
    }

    pub fn enqueue_delete(&mut self, remote_path: &str, is_directory: bool) -> Option<u64> {
        if is_directory {
            return self.enqueue_recursive_delete(remote_path);
        }
        if !self.accepting() {
            return None;
        }
        let id = self.add_batch(
            TransferKind::Delete,
            format!("Delete {}", remote_name(remote_path)),
            false,
        );
        self.push_item(id, TransferKind::Delete, PathBuf::new(), remote_path.to_string(), false, None);
        if let Some(batch) = self.batch_mut(id) {
            batch.progress.delete_total = 1;
        }
        self.start_single(id)
    }

    pub fn enqueue_recursive_delete(&mut self, remote_path: &str) -> Option<u64> {
        if !self.accepting() {
            return None;
        }
        let id = self.add_batch(
            TransferKind::Delete,
            format!("Delete folder {}", remote_name(remote_path)),
            true,
        );
        if let Some(batch) = self.batch_mut(id) {
            batch.remote_root = normalize_remote(remote_path);
        }
        self.enqueued(id)
    }

    fn accepting(&self) -> bool {
        if self.ftp.is_logged_in() {
            true
        } else {
            log::debug!("Transfer request ignored: not connected");
            false
        }
    }

    fn add_batch(&mut self, kind: TransferKind, description: String, is_directory: bool) -> u64 {
        let id = self.next_batch_id;
        self.next_batch_id += 1;
        log::info!("Queued batch {}: {}", id, description);
        self.batches.push(Batch::new(id, kind, description, is_directory));
        id
    }

    fn start_single(&mut self, id: u64) -> Option<u64> {
        if let Some(batch) = self.batch_mut(id) {
            batch.phase = BatchPhase::Transferring;
        }
        self.enqueued(id)
    }

    fn enqueued(&mut self, id: u64) -> Option<u64> {
        self.events.push(QueueEvent::QueueChanged);
        self.process_next();
        Some(id)
    }

    fn push_item(
        &mut self,
        batch_id: u64,
        kind: TransferKind,
        local_path: PathBuf,
        remote_path: String,
        is_directory: bool,
        total_bytes: Option<u64>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        self.items.push(TransferItem {
            id: id.clone(),
            batch_id,
            kind,
            local_path,
            remote_path,
            is_directory,
            status: TransferStatus::Pending,
            bytes_transferred: 0,
            total_bytes,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        });
        if let Some(batch) = self.batch_mut(batch_id) {
            batch.progress.total_items += 1;
        }
        id
    }

    // ─── Dispatch ────────────────────────────────────────────────

    /// Advance the head batch until the queue waits on the client or the user.
    fn process_next(&mut self) {
        while self.awaiting.is_none() && self.prompt.is_none() {
            let idx = match self.batches.iter().position(|b| !b.phase.is_finished()) {
                Some(i) => i,
                None => {
                    if self.processing {
                        self.processing = false;
                        log::info!("All transfer batches finished");
                        self.events.push(QueueEvent::AllOperationsCompleted);
                    }
                    return;
                }
            };
            self.processing = true;

            match self.batches[idx].phase {
                BatchPhase::Queued => self.start_batch(idx),
                BatchPhase::Scanning => match self.batches[idx].scan_queue.front().cloned() {
                    Some(path) => {
                        self.awaiting = Some(Awaiting::Scan {
                            batch: self.batches[idx].id,
                            path: path.clone(),
                        });
                        self.ftp.list(&path);
                    }
                    None => self.finish_scan(idx),
                },
                BatchPhase::CheckingDestination => self.check_destination(idx),
                BatchPhase::CreatingDirectories => self.create_next_directory(idx),
                BatchPhase::Transferring => {
                    let batch_id = self.batches[idx].id;
                    let next = self
                        .items
                        .iter()
                        .find(|i| i.batch_id == batch_id && i.status == TransferStatus::Pending)
                        .map(|i| i.id.clone());
                    match next {
                        Some(item) => self.start_item(&item),
                        None => self.finish_batch(idx),
                    }
                }
                BatchPhase::Completed | BatchPhase::Cancelled => {}
            }
        }
    }

    fn start_batch(&mut self, idx: usize) {
        let batch = &mut self.batches[idx];
        log::info!("Starting batch {}: {}", batch.id, batch.description);
        match (batch.kind, batch.is_directory) {
            (TransferKind::Download, true) | (TransferKind::Delete, true) => {
                batch.phase = BatchPhase::Scanning;
                batch.scan_queue.push_back(batch.remote_root.clone());
                batch.progress.discovered_directories = 1;
                if batch.kind == TransferKind::Download {
                    if let Err(e) = std::fs::create_dir_all(&batch.local_root) {
                        let error = FtpError::from(e).to_string();
                        self.fail_batch(idx, error);
                        return;
                    }
                }
                let (id, p) = (batch.id, batch.progress.clone());
                self.events.push(QueueEvent::ScanProgress {
                    batch_id: id,
                    scanned: p.scanned_directories,
                    discovered: p.discovered_directories,
                });
            }
            (TransferKind::Upload, true) => {
                if batch.destination_checked {
                    self.begin_creation(idx);
                } else {
                    batch.phase = BatchPhase::CheckingDestination;
                }
            }
            _ => batch.phase = BatchPhase::Transferring,
        }
    }

    /// The batch produced nothing to run; report it and move on.
    fn fail_batch(&mut self, idx: usize, error: String) {
        let batch = &mut self.batches[idx];
        log::warn!("Batch {} failed: {}", batch.id, error);
        batch.phase = BatchPhase::Completed;
        batch.progress.failed_items += 1;
        self.events.push(QueueEvent::OperationFailed {
            file: batch.description.clone(),
            kind: batch.kind,
            error,
        });
        self.events.push(QueueEvent::QueueChanged);
    }

    fn finish_batch(&mut self, idx: usize) {
        let batch = &mut self.batches[idx];
        batch.phase = BatchPhase::Completed;
        log::info!(
            "Batch {} finished: {} done, {} failed",
            batch.id,
            batch.progress.completed_items,
            batch.progress.failed_items
        );
        self.events.push(QueueEvent::QueueChanged);
    }

    // ─── Scan phase ──────────────────────────────────────────────

    fn on_scan_listing(&mut self, batch_id: u64, path: &str, entries: &[FtpEntry]) {
        self.awaiting = None;
        let idx = match self.batch_index(batch_id) {
            Some(i) => i,
            None => return,
        };
        let (kind, root, local_root) = {
            let b = &mut self.batches[idx];
            b.scan_queue.pop_front();
            b.progress.scanned_directories += 1;
            b.scanned_dirs.push(path.to_string());
            (b.kind, b.remote_root.clone(), b.local_root.clone())
        };

        if kind == TransferKind::Download {
            match local::local_join(&local_root, &remote_relative(&root, path)) {
                Ok(dir) => {
                    if let Err(e) = std::fs::create_dir_all(&dir) {
                        log::warn!("Cannot create {}: {}", dir.display(), e);
                    }
                }
                Err(e) => log::warn!("{}", e),
            }
        }

        for entry in entries {
            if !local::is_plain_name(&entry.name) {
                log::warn!("Skipping listing entry '{}' in {}", entry.name, path);
                continue;
            }
            let child = join_remote(path, &entry.name);
            if entry.is_directory {
                let b = &mut self.batches[idx];
                b.scan_queue.push_back(child);
                b.progress.discovered_directories += 1;
            } else if kind == TransferKind::Download {
                match local::local_join(&local_root, &remote_relative(&root, &child)) {
                    Ok(local) => {
                        self.push_item(batch_id, kind, local, child, false, Some(entry.size));
                    }
                    Err(e) => log::warn!("{}", e),
                }
            } else {
                self.push_item(batch_id, kind, PathBuf::new(), child, false, None);
            }
        }

        let p = &self.batches[idx].progress;
        self.events.push(QueueEvent::ScanProgress {
            batch_id,
            scanned: p.scanned_directories,
            discovered: p.discovered_directories,
        });
        self.events.push(QueueEvent::QueueChanged);
    }

    fn on_scan_failed(&mut self, batch_id: u64, path: &str, error: &FtpError) {
        self.awaiting = None;
        let idx = match self.batch_index(batch_id) {
            Some(i) => i,
            None => return,
        };
        let b = &mut self.batches[idx];
        b.scan_queue.pop_front();
        b.progress.scanned_directories += 1;
        if normalize_remote(path) == b.remote_root {
            self.fail_batch(idx, error.to_string());
        } else {
            log::warn!("Skipping unreadable directory {}: {}", path, error);
        }
    }

    fn finish_scan(&mut self, idx: usize) {
        let batch_id = self.batches[idx].id;
        if self.batches[idx].kind == TransferKind::Delete {
            // Files first, then directories deepest first.
            let dirs: Vec<String> = self.batches[idx].scanned_dirs.iter().rev().cloned().collect();
            for dir in dirs {
                self.push_item(batch_id, TransferKind::Delete, PathBuf::new(), dir, true, None);
            }
            let total = self.items.iter().filter(|i| i.batch_id == batch_id).count();
            self.batches[idx].progress.delete_total = total;
        }
        let b = &mut self.batches[idx];
        log::debug!(
            "Batch {} scan finished: {} directories, {} items",
            b.id,
            b.progress.scanned_directories,
            b.progress.total_items
        );
        b.phase = BatchPhase::Transferring;
    }

    // ─── Upload destination & directory creation ─────────────────

    fn check_destination(&mut self, idx: usize) {
        let parent = remote_parent(&self.batches[idx].remote_root);
        let exists = self
            .remote_cache
            .get(&normalize_remote(&parent))
            .map(|entries| {
                let name = remote_name(&self.batches[idx].remote_root);
                entries.iter().any(|e| e.is_directory && e.name == name)
            });
        match exists {
            Some(exists) => self.decide_destination(idx, exists),
            None => {
                self.awaiting = Some(Awaiting::Destination {
                    batch: self.batches[idx].id,
                    parent: parent.clone(),
                });
                self.ftp.list(&parent);
            }
        }
    }

    fn decide_destination(&mut self, idx: usize, exists: bool) {
        self.batches[idx].destination_checked = true;
        if !exists || self.config.auto_merge {
            self.begin_creation(idx);
            return;
        }
        let batch = self.batches[idx].id;
        self.prompt = Some(Prompt::FolderExists { batch });
        self.events.push(QueueEvent::FolderExistsConfirmationNeeded {
            names: vec![remote_name(&self.batches[idx].remote_root)],
        });
    }

    fn begin_creation(&mut self, idx: usize) {
        match local::walk_local_tree(&self.batches[idx].local_root) {
            Ok(tree) => {
                let b = &mut self.batches[idx];
                b.creation = tree.directories.iter().cloned().collect();
                b.progress.directories_to_create = b.creation.len();
                b.tree = Some(tree);
                b.phase = BatchPhase::CreatingDirectories;
                self.events.push(QueueEvent::CreationProgress {
                    batch_id: b.id,
                    created: 0,
                    to_create: b.progress.directories_to_create,
                });
            }
            Err(e) => self.fail_batch(idx, e.to_string()),
        }
    }

    fn create_next_directory(&mut self, idx: usize) {
        let b = &mut self.batches[idx];
        match b.creation.front() {
            Some(dir) => {
                let path = if dir.relative.is_empty() {
                    b.remote_root.clone()
                } else {
                    join_remote(&b.remote_root, &dir.relative)
                };
                self.awaiting = Some(Awaiting::Mkdir {
                    batch: b.id,
                    path: path.clone(),
                });
                self.ftp.make_directory(&path);
            }
            None => b.phase = BatchPhase::Transferring,
        }
    }

    /// A directory level was acknowledged; its files may now be queued.
    fn on_directory_ready(&mut self, batch_id: u64, path: &str, outcome: Result<bool, String>) {
        self.awaiting = None;
        let idx = match self.batch_index(batch_id) {
            Some(i) => i,
            None => return,
        };
        let (dir, files) = {
            let b = &mut self.batches[idx];
            let dir = match b.creation.pop_front() {
                Some(d) => d,
                None => return,
            };
            b.progress.created_directories += 1;
            let files: Vec<_> = b
                .tree
                .as_ref()
                .map(|t| t.files_in(&dir.relative).cloned().collect())
                .unwrap_or_default();
            self.events.push(QueueEvent::CreationProgress {
                batch_id,
                created: b.progress.created_directories,
                to_create: b.progress.directories_to_create,
            });
            (dir, files)
        };

        match &outcome {
            Ok(true) => {
                // Freshly created: known to be empty.
                self.remote_cache.insert(normalize_remote(path), Vec::new());
                self.cache_add(path, FtpEntry::directory(remote_name(path)));
            }
            Ok(false) => log::debug!("Directory {} already exists", path),
            Err(e) => log::warn!("Could not create {}: {}", path, e),
        }

        for file in files {
            let remote = join_remote(path, &file.name);
            let id = self.push_item(batch_id, TransferKind::Upload, file.path.clone(), remote, false, Some(file.size));
            if let Err(e) = &outcome {
                self.finish_item(&id, Err(format!("Directory '{}' was not created: {}", dir.relative, e)));
            }
        }
        self.events.push(QueueEvent::QueueChanged);
    }

    // ─── Items ───────────────────────────────────────────────────

    fn start_item(&mut self, id: &str) {
        let item = match self.items.iter().find(|i| i.id == id) {
            Some(i) => i.clone(),
            None => return,
        };
        if !self.config.auto_overwrite {
            let conflict = match item.kind {
                TransferKind::Download => Some(item.local_path.exists()),
                TransferKind::Upload => {
                    let parent = remote_parent(&item.remote_path);
                    match self.remote_cache.get(&normalize_remote(&parent)) {
                        Some(entries) => {
                            let name = remote_name(&item.remote_path);
                            Some(entries.iter().any(|e| !e.is_directory && e.name == name))
                        }
                        None => {
                            self.awaiting = Some(Awaiting::ConflictCheck {
                                item: item.id.clone(),
                                parent: parent.clone(),
                            });
                            self.ftp.list(&parent);
                            return;
                        }
                    }
                }
                TransferKind::Delete => None,
            };
            if conflict == Some(true) {
                self.prompt = Some(Prompt::Overwrite { item: item.id.clone() });
                self.events.push(QueueEvent::OverwriteConfirmationNeeded {
                    file: item.display_name(),
                    kind: item.kind,
                });
                return;
            }
        }
        self.run_item(id);
    }

    fn run_item(&mut self, id: &str) {
        let item = match self.items.iter_mut().find(|i| i.id == id) {
            Some(i) => i,
            None => return,
        };
        item.status = TransferStatus::InProgress;
        item.started_at = Some(Utc::now());
        let item = item.clone();
        log::debug!("Starting {:?} of {}", item.kind, item.remote_path);

        self.awaiting = Some(Awaiting::Item { id: item.id.clone() });
        self.events.push(QueueEvent::OperationStarted {
            file: item.display_name(),
            kind: item.kind,
        });
        self.events.push(QueueEvent::QueueChanged);

        match (item.kind, item.is_directory) {
            (TransferKind::Download, _) => self.ftp.download(&item.remote_path, &item.local_path),
            (TransferKind::Upload, _) => self.ftp.upload(&item.local_path, &item.remote_path),
            (TransferKind::Delete, true) => self.ftp.remove_directory(&item.remote_path),
            (TransferKind::Delete, false) => self.ftp.remove(&item.remote_path),
        }
    }

    /// Record an item's outcome and emit its events.
    fn finish_item(&mut self, id: &str, result: Result<(), String>) {
        let item = match self.items.iter_mut().find(|i| i.id == id) {
            Some(i) => i,
            None => return,
        };
        item.completed_at = Some(Utc::now());
        match &result {
            Ok(()) => {
                item.status = TransferStatus::Completed;
                if let Some(total) = item.total_bytes {
                    item.bytes_transferred = total;
                }
            }
            Err(e) => {
                item.status = TransferStatus::Failed;
                item.error = Some(e.clone());
            }
        }
        let item = item.clone();

        let mut delete_progress = None;
        if let Some(idx) = self.batch_index(item.batch_id) {
            let p = &mut self.batches[idx].progress;
            match result {
                Ok(()) => p.completed_items += 1,
                Err(_) => p.failed_items += 1,
            }
            if item.kind == TransferKind::Delete {
                p.delete_progress += 1;
                delete_progress = Some((p.delete_progress, p.delete_total));
            }
        }

        match &item.error {
            None => {
                log::debug!("{:?} of {} completed", item.kind, item.remote_path);
                self.events.push(QueueEvent::OperationCompleted {
                    file: item.display_name(),
                    kind: item.kind,
                });
            }
            Some(error) => {
                log::warn!("{:?} of {} failed: {}", item.kind, item.remote_path, error);
                self.events.push(QueueEvent::OperationFailed {
                    file: item.display_name(),
                    kind: item.kind,
                    error: error.clone(),
                });
            }
        }
        if let Some((current, total)) = delete_progress {
            self.events.push(QueueEvent::DeleteProgress {
                file: item.display_name(),
                current,
                total,
            });
        }
        self.events.push(QueueEvent::QueueChanged);
    }

    fn active_item(&self) -> Option<&TransferItem> {
        match &self.awaiting {
            Some(Awaiting::Item { id }) => self.items.iter().find(|i| &i.id == id),
            _ => None,
        }
    }

    /// The running item, if it targets `remote_path` (and `local_path`, when known).
    fn active_item_for(&self, remote_path: &str, local_path: Option<&Path>) -> Option<String> {
        self.active_item()
            .filter(|i| i.remote_path == remote_path)
            .filter(|i| local_path.map_or(true, |l| i.local_path == l))
            .map(|i| i.id.clone())
    }

    fn complete_active(&mut self, remote_path: &str, local_path: Option<&Path>, result: Result<(), String>) -> bool {
        match self.active_item_for(remote_path, local_path) {
            Some(id) => {
                self.awaiting = None;
                self.finish_item(&id, result);
                true
            }
            None => false,
        }
    }

    // ─── Remote listing cache ────────────────────────────────────

    fn cache_add(&mut self, path: &str, entry: FtpEntry) {
        if let Some(entries) = self.remote_cache.get_mut(&normalize_remote(&remote_parent(path))) {
            if !entries.iter().any(|e| e.name == entry.name) {
                entries.push(entry);
            }
        }
    }

    fn cache_remove(&mut self, path: &str) {
        let name = remote_name(path);
        if let Some(entries) = self.remote_cache.get_mut(&normalize_remote(&remote_parent(path))) {
            entries.retain(|e| e.name != name);
        }
        self.remote_cache.remove(&normalize_remote(path));
    }

    // ─── Protocol events ─────────────────────────────────────────

    /// Feed one protocol-client event into the scheduler.
    pub fn handle_ftp_event(&mut self, event: &FtpEvent) {
        match event {
            FtpEvent::StateChanged {
                state: ConnectionState::Disconnected,
            } => {
                self.remote_cache.clear();
                if self.batches.iter().any(|b| !b.phase.is_finished()) {
                    log::warn!("Connection lost; cancelling all transfer batches");
                    self.cancel_batches(None, "Connection lost");
                }
                self.unacked_aborts = 0;
                return;
            }
            FtpEvent::Aborted => {
                self.unacked_aborts = self.unacked_aborts.saturating_sub(1);
                return;
            }
            _ if self.unacked_aborts > 0 => {
                log::debug!("Dropping FTP event from before an abort: {:?}", event);
                return;
            }
            FtpEvent::DirectoryListed { path, entries } => {
                let key = normalize_remote(path);
                self.remote_cache.insert(key.clone(), entries.clone());
                match self.awaiting.clone() {
                    Some(Awaiting::Scan { batch, path: p }) if normalize_remote(&p) == key => {
                        self.on_scan_listing(batch, &p, entries);
                    }
                    Some(Awaiting::Destination { batch, parent }) if normalize_remote(&parent) == key => {
                        self.awaiting = None;
                        if let Some(idx) = self.batch_index(batch) {
                            let name = remote_name(&self.batches[idx].remote_root);
                            let exists = entries.iter().any(|e| e.is_directory && e.name == name);
                            self.decide_destination(idx, exists);
                        }
                    }
                    Some(Awaiting::ConflictCheck { parent, .. }) if normalize_remote(&parent) == key => {
                        // start_item re-runs against the fresh cache
                        self.awaiting = None;
                    }
                    _ => return,
                }
            }
            FtpEvent::DirectoryCreated { path } => match self.awaiting.clone() {
                Some(Awaiting::Mkdir { batch, path: p }) if &p == path => {
                    self.on_directory_ready(batch, &p, Ok(true));
                }
                _ => return,
            },
            FtpEvent::DownloadProgress {
                remote_path,
                received,
                total,
            } => {
                if let Some(id) = self.active_item_for(remote_path, None) {
                    if let Some(item) = self.items.iter_mut().find(|i| i.id == id) {
                        item.bytes_transferred = *received;
                        if total.is_some() {
                            item.total_bytes = *total;
                        }
                    }
                }
                return;
            }
            FtpEvent::UploadProgress {
                remote_path,
                sent,
                total,
            } => {
                if let Some(id) = self.active_item_for(remote_path, None) {
                    if let Some(item) = self.items.iter_mut().find(|i| i.id == id) {
                        item.bytes_transferred = *sent;
                        item.total_bytes = Some(*total);
                    }
                }
                return;
            }
            FtpEvent::DownloadFinished {
                remote_path,
                local_path,
            } => {
                if !self.complete_active(remote_path, Some(local_path), Ok(())) {
                    return;
                }
            }
            FtpEvent::UploadFinished {
                local_path,
                remote_path,
            } => {
                let size = self
                    .active_item()
                    .filter(|i| &i.remote_path == remote_path)
                    .and_then(|i| i.total_bytes)
                    .unwrap_or(0);
                if !self.complete_active(remote_path, Some(local_path), Ok(())) {
                    return;
                }
                self.cache_add(remote_path, FtpEntry::file(remote_name(remote_path), size));
            }
            FtpEvent::FileRemoved { path } | FtpEvent::DirectoryRemoved { path } => {
                self.cache_remove(path);
                if !self.complete_active(path, None, Ok(())) {
                    return;
                }
            }
            FtpEvent::Error {
                operation: Some(operation),
                error,
            } => {
                if !self.on_ftp_error(operation, error) {
                    return;
                }
            }
            _ => return,
        }
        self.process_next();
    }

    /// Returns whether the error belonged to what the queue was waiting on.
    fn on_ftp_error(&mut self, operation: &FtpOperation, error: &FtpError) -> bool {
        match (self.awaiting.clone(), operation) {
            (Some(Awaiting::Scan { batch, path }), FtpOperation::List(p)) if &path == p => {
                self.on_scan_failed(batch, &path, error);
                true
            }
            (Some(Awaiting::Destination { batch, parent }), FtpOperation::List(p)) if &parent == p => {
                self.awaiting = None;
                if let Some(idx) = self.batch_index(batch) {
                    self.decide_destination(idx, false);
                }
                true
            }
            (Some(Awaiting::ConflictCheck { item, parent }), FtpOperation::List(p)) if &parent == p => {
                self.awaiting = None;
                self.run_item(&item);
                true
            }
            (Some(Awaiting::Mkdir { batch, path }), FtpOperation::MakeDirectory(p)) if &path == p => {
                let outcome = if error.is_duplicate_directory() {
                    Ok(false)
                } else {
                    Err(error.to_string())
                };
                self.on_directory_ready(batch, &path, outcome);
                true
            }
            (Some(Awaiting::Item { .. }), FtpOperation::Download(p))
            | (Some(Awaiting::Item { .. }), FtpOperation::Upload(p))
            | (Some(Awaiting::Item { .. }), FtpOperation::Remove(p))
            | (Some(Awaiting::Item { .. }), FtpOperation::RemoveDirectory(p)) => {
                self.complete_active(p, None, Err(error.to_string()))
            }
            _ => {
                log::debug!("Ignoring unrelated FTP error for {:?}: {}", operation, error);
                false
            }
        }
    }

    // ─── User decisions ──────────────────────────────────────────

    pub fn respond_to_overwrite(&mut self, choice: OverwriteChoice) {
        let item = match &self.prompt {
            Some(Prompt::Overwrite { item }) => item.clone(),
            _ => {
                log::debug!("No overwrite question pending");
                return;
            }
        };
        self.prompt = None;
        match choice {
            OverwriteChoice::Overwrite => self.run_item(&item),
            OverwriteChoice::OverwriteAll => {
                self.config.auto_overwrite = true;
                self.run_item(&item);
            }
            OverwriteChoice::Skip => {
                if let Some(i) = self.items.iter_mut().find(|i| i.id == item) {
                    i.status = TransferStatus::Skipped;
                    i.completed_at = Some(Utc::now());
                    let batch_id = i.batch_id;
                    if let Some(idx) = self.batch_index(batch_id) {
                        self.batches[idx].progress.completed_items += 1;
                    }
                }
                self.events.push(QueueEvent::QueueChanged);
            }
            OverwriteChoice::Cancel => {
                let batch = self.items.iter().find(|i| i.id == item).map(|i| i.batch_id);
                if let Some(batch) = batch {
                    self.cancel_batch(batch);
                    return;
                }
            }
        }
        self.process_next();
    }

    pub fn respond_to_folder_exists(&mut self, choice: FolderExistsChoice) {
        let batch = match &self.prompt {
            Some(Prompt::FolderExists { batch }) => *batch,
            _ => {
                log::debug!("No folder-exists question pending");
                return;
            }
        };
        self.prompt = None;
        let idx = match self.batch_index(batch) {
            Some(i) => i,
            None => return,
        };
        match choice {
            FolderExistsChoice::Merge => self.begin_creation(idx),
            FolderExistsChoice::Replace => {
                let target = self.batches[idx].remote_root.clone();
                log::info!("Replacing remote folder {}", target);
                let id = self.next_batch_id;
                self.next_batch_id += 1;
                let mut delete = Batch::new(
                    id,
                    TransferKind::Delete,
                    format!("Delete folder {}", remote_name(&target)),
                    true,
                );
                delete.remote_root = target;
                self.batches.insert(idx, delete);
                self.batches[idx + 1].phase = BatchPhase::Queued;
                self.events.push(QueueEvent::QueueChanged);
            }
            FolderExistsChoice::Cancel => {
                self.cancel_batch(batch);
                return;
            }
        }
        self.process_next();
    }

    // ─── Cancellation & housekeeping ─────────────────────────────

    pub fn cancel_batch(&mut self, batch_id: u64) {
        self.cancel_batches(Some(batch_id), "Cancelled");
    }

    pub fn cancel_all(&mut self) {
        self.cancel_batches(None, "Cancelled");
    }

    /// Cancel one batch, or every unfinished batch when `only` is `None`.
    fn cancel_batches(&mut self, only: Option<u64>, reason: &str) {
        let targets: Vec<u64> = self
            .batches
            .iter()
            .filter(|b| !b.phase.is_finished() && only.map_or(true, |id| id == b.id))
            .map(|b| b.id)
            .collect();
        if targets.is_empty() {
            return;
        }

        let in_flight = match &self.awaiting {
            Some(Awaiting::Scan { batch, .. })
            | Some(Awaiting::Destination { batch, .. })
            | Some(Awaiting::Mkdir { batch, .. }) => targets.contains(batch),
            Some(Awaiting::ConflictCheck { item, .. }) | Some(Awaiting::Item { id: item }) => self
                .items
                .iter()
                .any(|i| &i.id == item && targets.contains(&i.batch_id)),
            None => false,
        };
        let prompt_hit = match &self.prompt {
            Some(Prompt::FolderExists { batch }) => targets.contains(batch),
            Some(Prompt::Overwrite { item }) => self
                .items
                .iter()
                .any(|i| &i.id == item && targets.contains(&i.batch_id)),
            None => false,
        };
        if prompt_hit {
            self.prompt = None;
        }

        let running: Vec<String> = self
            .items
            .iter()
            .filter(|i| targets.contains(&i.batch_id) && i.status == TransferStatus::InProgress)
            .map(|i| i.id.clone())
            .collect();
        for id in &running {
            self.finish_item(id, Err(reason.to_string()));
        }
        let before = self.items.len();
        self.items
            .retain(|i| !(targets.contains(&i.batch_id) && i.status == TransferStatus::Pending));
        let discarded = before - self.items.len();

        for b in self.batches.iter_mut().filter(|b| targets.contains(&b.id)) {
            b.phase = BatchPhase::Cancelled;
            b.scan_queue.clear();
            b.creation.clear();
            b.tree = None;
        }
        log::info!(
            "Cancelled {} batch(es), discarded {} pending item(s)",
            targets.len(),
            discarded
        );

        if in_flight {
            self.awaiting = None;
            // A disconnected client drops the abort without acknowledging it.
            if self.ftp.is_logged_in() {
                self.unacked_aborts += 1;
            }
            self.ftp.abort();
        }
        if !self.batches.iter().any(|b| !b.phase.is_finished()) {
            self.processing = false;
        }
        self.events.push(QueueEvent::OperationsCancelled);
        self.events.push(QueueEvent::QueueChanged);
        self.process_next();
    }

    /// Drop finished items that succeeded or were skipped.
    pub fn remove_completed(&mut self) {
        self.items
            .retain(|i| !matches!(i.status, TransferStatus::Completed | TransferStatus::Skipped));
        let items = &self.items;
        self.batches
            .retain(|b| !b.phase.is_finished() || items.iter().any(|i| i.batch_id == b.id));
        self.events.push(QueueEvent::QueueChanged);
    }

    /// Cancel everything and forget all batches.
    pub fn clear(&mut self) {
        self.cancel_all();
        self.items.clear();
        self.batches.clear();
        self.events.push(QueueEvent::QueueChanged);
    }

    /// Re-enqueue the failed items of finished batches, one new batch per kind.
    pub fn retry_failed(&mut self) -> Vec<u64> {
        if !self.accepting() {
            return Vec::new();
        }
        let finished: Vec<u64> = self
            .batches
            .iter()
            .filter(|b| b.phase.is_finished())
            .map(|b| b.id)
            .collect();
        let (failed, kept): (Vec<TransferItem>, Vec<TransferItem>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|i| i.status == TransferStatus::Failed && finished.contains(&i.batch_id));
        self.items = kept;

        let mut created = Vec::new();
        for kind in [TransferKind::Upload, TransferKind::Download, TransferKind::Delete] {
            let group: Vec<&TransferItem> = failed.iter().filter(|i| i.kind == kind).collect();
            if group.is_empty() {
                continue;
            }
            let id = self.add_batch(kind, format!("Retry {} failed item(s)", group.len()), false);
            for item in group {
                self.push_item(
                    id,
                    kind,
                    item.local_path.clone(),
                    item.remote_path.clone(),
                    item.is_directory,
                    item.total_bytes,
                );
            }
            if let Some(b) = self.batch_mut(id) {
                b.phase = BatchPhase::Transferring;
                if kind == TransferKind::Delete {
                    b.progress.delete_total = b.progress.total_items;
                }
            }
            created.push(id);
        }
        if !created.is_empty() {
            self.events.push(QueueEvent::QueueChanged);
            self.process_next();
        }
        created
    }

    // ─── Introspection ───────────────────────────────────────────

    pub fn items(&self) -> &[TransferItem] {
        &self.items
    }

    pub fn batch(&self, id: u64) -> Option<BatchInfo> {
        self.batches.iter().find(|b| b.id == id).map(Batch::info)
    }

    pub fn pending_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.status == TransferStatus::Pending)
            .count()
    }

    pub fn active_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.status == TransferStatus::InProgress)
            .count()
    }

    /// Pending and running items of batches that have not finished.
    pub fn active_and_pending_count(&self) -> usize {
        let live: Vec<u64> = self
            .batches
            .iter()
            .filter(|b| !b.phase.is_finished())
            .map(|b| b.id)
            .collect();
        self.items
            .iter()
            .filter(|i| live.contains(&i.batch_id) && !i.status.is_finished())
            .count()
    }

    pub fn is_processing(&self) -> bool {
        self.batches.iter().any(|b| !b.phase.is_finished())
    }

    pub fn is_scanning(&self) -> bool {
        self.batches.iter().any(|b| b.phase == BatchPhase::Scanning)
    }

    /// Whether the queue waits for an overwrite or folder-exists answer.
    pub fn awaiting_decision(&self) -> bool {
        self.prompt.is_some()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            batches: self.batches.iter().map(Batch::info).collect(),
            items: self.items.clone(),
            pending_count: self.pending_count(),
            active_count: self.active_count(),
            active_and_pending_count: self.active_and_pending_count(),
            is_processing: self.is_processing(),
            is_scanning: self.is_scanning(),
            auto_overwrite: self.config.auto_overwrite,
            auto_merge: self.config.auto_merge,
        }
    }

    fn batch_index(&self, id: u64) -> Option<usize> {
        self.batches.iter().position(|b| b.id == id)
    }

    fn batch_mut(&mut self, id: u64) -> Option<&mut Batch> {
        self.batches.iter_mut().find(|b| b.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        List(String),
        Mkdir(String),
        Rmdir(String),
        Download(String, PathBuf),
        Upload(PathBuf, String),
        Remove(String),
        Abort,
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Call>,
    }

    impl FtpOperations for Recorder {
        fn is_logged_in(&self) -> bool {
            true
        }
        fn list(&mut self, path: &str) {
            self.calls.push(Call::List(path.into()));
        }
        fn make_directory(&mut self, path: &str) {
            self.calls.push(Call::Mkdir(path.into()));
        }
        fn remove_directory(&mut self, path: &str) {
            self.calls.push(Call::Rmdir(path.into()));
        }
        fn download(&mut self, remote_path: &str, local_path: &Path) {
            self.calls.push(Call::Download(remote_path.into(), local_path.into()));
        }
        fn upload(&mut self, local_path: &Path, remote_path: &str) {
            self.calls.push(Call::Upload(local_path.into(), remote_path.into()));
        }
        fn remove(&mut self, path: &str) {
            self.calls.push(Call::Remove(path.into()));
        }
        fn abort(&mut self) {
            self.calls.push(Call::Abort);
        }
    }

    fn queue() -> TransferQueue<Recorder> {
        TransferQueue::new(Recorder::default(), QueueConfig::default())
    }

    fn last_call(q: &TransferQueue<Recorder>) -> Call {
        q.ftp().calls.last().cloned().expect("a call was made")
    }

    fn listed(path: &str, entries: Vec<FtpEntry>) -> FtpEvent {
        FtpEvent::DirectoryListed {
            path: path.into(),
            entries,
        }
    }

    fn failed(operation: FtpOperation, code: u16) -> FtpEvent {
        FtpEvent::Error {
            operation: Some(operation),
            error: FtpError::from_reply(code, "failed"),
        }
    }

    /// Drive a recursive download of /Usb0/games (a.prg, sub/b.prg) to completion.
    fn run_recursive_download(remote: &str, local: &Path) -> (TransferQueue<Recorder>, Vec<QueueEvent>) {
        let mut q = queue();
        q.enqueue_recursive_download(local, remote).unwrap();
        assert_eq!(last_call(&q), Call::List("/Usb0/games".into()));
        assert!(q.is_scanning());

        q.handle_ftp_event(&listed(
            "/Usb0/games",
            vec![FtpEntry::file("a.prg", 3), FtpEntry::directory("sub")],
        ));
        assert_eq!(last_call(&q), Call::List("/Usb0/games/sub".into()));
        assert!(q.items().iter().all(|i| i.status == TransferStatus::Pending));

        q.handle_ftp_event(&listed("/Usb0/games/sub", vec![FtpEntry::file("b.prg", 5)]));
        assert!(!q.is_scanning());

        let mut events = q.take_events();
        for _ in 0..2 {
            let (remote_path, local_path) = match last_call(&q) {
                Call::Download(r, l) => (r, l),
                other => panic!("expected a download, got {:?}", other),
            };
            q.handle_ftp_event(&FtpEvent::DownloadFinished {
                remote_path,
                local_path,
            });
            events.extend(q.take_events());
        }
        (q, events)
    }

    #[test]
    fn remote_path_helpers() {
        assert_eq!(normalize_remote("/Usb0/games/"), "/Usb0/games");
        assert_eq!(normalize_remote("/"), "/");
        assert_eq!(join_remote("/", "a"), "/a");
        assert_eq!(join_remote("/Usb0", "a b.prg"), "/Usb0/a b.prg");
        assert_eq!(remote_name("/Usb0/games/"), "games");
        assert_eq!(remote_parent("/Usb0/games"), "/Usb0");
        assert_eq!(remote_parent("/Usb0"), "/");
        assert_eq!(remote_relative("/Usb0/games/", "/Usb0/games/sub/b.prg"), "sub/b.prg");
    }

    #[test]
    fn enqueue_without_connection_does_nothing() {
        let mut ftp = MockFtpOperations::new();
        ftp.expect_is_logged_in().return_const(false);
        let mut q = TransferQueue::new(ftp, QueueConfig::default());

        assert_eq!(q.enqueue_download(Path::new("/tmp/a"), "/a.prg"), None);
        assert_eq!(q.enqueue_upload(Path::new("/tmp/a"), "/a.prg"), None);
        assert_eq!(q.enqueue_recursive_download(Path::new("/tmp"), "/Usb0"), None);
        assert_eq!(q.enqueue_recursive_upload(Path::new("/tmp"), "/Usb0"), None);
        assert_eq!(q.enqueue_delete("/a.prg", false), None);
        assert_eq!(q.enqueue_recursive_delete("/Usb0"), None);
        assert!(q.take_events().is_empty());
        assert_eq!(q.snapshot().batches.len(), 0);
        assert!(!q.is_processing());
    }

    #[test]
    fn recursive_download_scans_before_transferring() {
        let dir = tempfile::tempdir().unwrap();
        let (q, events) = run_recursive_download("/Usb0/games", dir.path());

        let first_download = q
            .ftp()
            .calls
            .iter()
            .position(|c| matches!(c, Call::Download(..)))
            .unwrap();
        let last_list = q
            .ftp()
            .calls
            .iter()
            .rposition(|c| matches!(c, Call::List(..)))
            .unwrap();
        assert!(last_list < first_download);

        assert!(q.items().iter().all(|i| i.status == TransferStatus::Completed));
        assert_eq!(q.items().len(), 2);
        assert!(dir.path().join("games/sub").is_dir());
        assert!(events.contains(&QueueEvent::AllOperationsCompleted));
        assert!(events.contains(&QueueEvent::ScanProgress {
            batch_id: 1,
            scanned: 2,
            discovered: 2,
        }));
        assert!(!q.is_processing());
    }

    #[test]
    fn trailing_slash_keeps_layout() {
        let plain = tempfile::tempdir().unwrap();
        let slashed = tempfile::tempdir().unwrap();
        let (a, _) = run_recursive_download("/Usb0/games", plain.path());
        let (b, _) = run_recursive_download("/Usb0/games/", slashed.path());

        let shape = |q: &TransferQueue<Recorder>, base: &Path| -> Vec<(String, PathBuf)> {
            let mut v: Vec<_> = q
                .items()
                .iter()
                .map(|i| (i.remote_path.clone(), i.local_path.strip_prefix(base).unwrap().to_path_buf()))
                .collect();
            v.sort();
            v
        };
        let expected = vec![
            ("/Usb0/games/a.prg".to_string(), PathBuf::from("games/a.prg")),
            ("/Usb0/games/sub/b.prg".to_string(), PathBuf::from("games/sub/b.prg")),
        ];
        assert_eq!(shape(&a, plain.path()), expected);
        assert_eq!(shape(&b, slashed.path()), expected);
    }

    #[test]
    fn cancel_marks_running_item_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut q = queue();
        q.enqueue_download(&dir.path().join("a.prg"), "/a.prg").unwrap();
        q.enqueue_download(&dir.path().join("b.prg"), "/b.prg").unwrap();
        assert_eq!(q.active_count(), 1);
        assert_eq!(q.active_and_pending_count(), 2);
        q.take_events();

        q.cancel_all();
        assert_eq!(last_call(&q), Call::Abort);
        assert!(!q.is_processing());
        assert!(!q.is_scanning());
        assert_eq!(q.items().len(), 1);
        assert_eq!(q.items()[0].status, TransferStatus::Failed);
        assert_eq!(q.active_and_pending_count(), 0);

        let events = q.take_events();
        assert!(events.contains(&QueueEvent::OperationsCancelled));
        assert!(!events.contains(&QueueEvent::AllOperationsCompleted));

        // A late completion for the aborted transfer changes nothing.
        q.handle_ftp_event(&FtpEvent::DownloadFinished {
            remote_path: "/a.prg".into(),
            local_path: dir.path().join("a.prg"),
        });
        assert_eq!(q.items()[0].status, TransferStatus::Failed);
    }

    #[test]
    fn cancel_during_scan() {
        let mut q = queue();
        let id = q.enqueue_recursive_delete("/Usb0/old").unwrap();
        assert!(q.is_scanning());
        q.cancel_batch(id);
        assert!(!q.is_scanning());
        assert!(!q.is_processing());
        assert_eq!(last_call(&q), Call::Abort);
        assert_eq!(q.batch(id).unwrap().phase, BatchPhase::Cancelled);
    }

    #[test]
    fn events_from_before_an_abort_do_not_finish_the_next_item() {
        let dir = tempfile::tempdir().unwrap();
        let (x, y) = (dir.path().join("x.prg"), dir.path().join("y.prg"));
        let mut q = queue();
        let first = q.enqueue_download(&x, "/a.prg").unwrap();
        q.enqueue_download(&y, "/a.prg").unwrap();

        q.cancel_batch(first);
        assert_eq!(
            q.ftp().calls,
            vec![
                Call::Download("/a.prg".into(), x.clone()),
                Call::Abort,
                Call::Download("/a.prg".into(), y.clone()),
            ]
        );

        // Emitted by the client before it applied the abort.
        q.handle_ftp_event(&FtpEvent::DownloadFinished {
            remote_path: "/a.prg".into(),
            local_path: x.clone(),
        });
        q.handle_ftp_event(&failed(FtpOperation::Download("/a.prg".into()), 426));
        assert_eq!(q.items()[1].status, TransferStatus::InProgress);

        q.handle_ftp_event(&FtpEvent::Aborted);
        // Same remote file, different destination: not this item's transfer.
        q.handle_ftp_event(&FtpEvent::DownloadFinished {
            remote_path: "/a.prg".into(),
            local_path: x.clone(),
        });
        assert_eq!(q.items()[1].status, TransferStatus::InProgress);
        assert_eq!(q.active_count(), 1);

        q.handle_ftp_event(&FtpEvent::DownloadFinished {
            remote_path: "/a.prg".into(),
            local_path: y,
        });
        assert_eq!(q.items()[0].status, TransferStatus::Failed);
        assert_eq!(q.items()[1].status, TransferStatus::Completed);
        assert!(q.take_events().contains(&QueueEvent::AllOperationsCompleted));
    }

    #[test]
    fn connection_loss_forgets_unacknowledged_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let mut q = queue();
        q.enqueue_download(&dir.path().join("a.prg"), "/a.prg").unwrap();
        q.cancel_all();
        q.handle_ftp_event(&FtpEvent::StateChanged {
            state: ConnectionState::Disconnected,
        });

        // After reconnecting, events are handled again without an Aborted.
        q.enqueue_delete("/b.prg", false).unwrap();
        q.handle_ftp_event(&FtpEvent::FileRemoved { path: "/b.prg".into() });
        assert_eq!(q.items().last().unwrap().status, TransferStatus::Completed);
    }

    #[test]
    fn listing_names_cannot_leave_the_download_root() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let mut q = queue();
        q.enqueue_recursive_download(&out, "/Usb0/games").unwrap();
        q.handle_ftp_event(&listed(
            "/Usb0/games",
            vec![
                FtpEntry::file("../../escape.prg", 4),
                FtpEntry::file("sub/nested.prg", 4),
                FtpEntry::directory(".."),
                FtpEntry::file("ok.prg", 4),
            ],
        ));

        assert!(!q.is_scanning());
        assert_eq!(q.items().len(), 1);
        assert_eq!(q.items()[0].remote_path, "/Usb0/games/ok.prg");
        for call in &q.ftp().calls {
            if let Call::Download(remote, local) = call {
                assert!(!remote.contains(".."));
                assert!(local.starts_with(out.join("games")));
            }
        }
        assert_eq!(
            last_call(&q),
            Call::Download("/Usb0/games/ok.prg".into(), out.join("games/ok.prg"))
        );
    }

    #[test]
    fn recursive_upload_creates_directories_first() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("demos");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/x.prg"), b"xyz").unwrap();

        let mut q = queue();
        q.enqueue_recursive_upload(&root, "/Usb0").unwrap();
        assert_eq!(last_call(&q), Call::List("/Usb0".into()));
        q.handle_ftp_event(&listed("/Usb0", vec![FtpEntry::file("other.prg", 1)]));
        assert_eq!(last_call(&q), Call::Mkdir("/Usb0/demos".into()));
        q.handle_ftp_event(&FtpEvent::DirectoryCreated {
            path: "/Usb0/demos".into(),
        });
        assert_eq!(last_call(&q), Call::Mkdir("/Usb0/demos/sub".into()));
        assert!(q.items().is_empty());
        q.handle_ftp_event(&FtpEvent::DirectoryCreated {
            path: "/Usb0/demos/sub".into(),
        });

        assert_eq!(
            q.ftp().calls,
            vec![
                Call::List("/Usb0".into()),
                Call::Mkdir("/Usb0/demos".into()),
                Call::Mkdir("/Usb0/demos/sub".into()),
                Call::Upload(root.join("sub/x.prg"), "/Usb0/demos/sub/x.prg".into()),
            ]
        );
        assert!(q.take_events().contains(&QueueEvent::CreationProgress {
            batch_id: 1,
            created: 2,
            to_create: 2,
        }));

        q.handle_ftp_event(&FtpEvent::UploadFinished {
            local_path: root.join("sub/x.prg"),
            remote_path: "/Usb0/demos/sub/x.prg".into(),
        });
        assert_eq!(q.items()[0].status, TransferStatus::Completed);
        assert_eq!(q.items()[0].bytes_transferred, 3);
        assert!(!q.is_processing());
    }

    #[test]
    fn existing_directory_and_file_with_auto_merge() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("demos");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("x.prg"), b"x").unwrap();

        let mut q = queue();
        q.set_auto_merge(true);
        q.enqueue_recursive_upload(&root, "/Usb0").unwrap();
        q.handle_ftp_event(&listed("/Usb0", vec![FtpEntry::directory("demos")]));
        assert_eq!(last_call(&q), Call::Mkdir("/Usb0/demos".into()));

        // Duplicate name counts as success.
        q.handle_ftp_event(&failed(FtpOperation::MakeDirectory("/Usb0/demos".into()), 550));
        assert_eq!(last_call(&q), Call::List("/Usb0/demos".into()));
        q.handle_ftp_event(&listed("/Usb0/demos", vec![FtpEntry::file("x.prg", 1)]));

        let events = q.take_events();
        assert!(events.contains(&QueueEvent::OverwriteConfirmationNeeded {
            file: "x.prg".into(),
            kind: TransferKind::Upload,
        }));
        assert!(q.awaiting_decision());

        q.respond_to_overwrite(OverwriteChoice::Skip);
        assert_eq!(q.items()[0].status, TransferStatus::Skipped);
        assert!(!q.ftp().calls.iter().any(|c| matches!(c, Call::Upload(..))));
        assert!(!q.is_processing());
    }

    #[test]
    fn folder_exists_replace_deletes_first() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("demos");
        fs::create_dir_all(&root).unwrap();

        let mut q = queue();
        q.enqueue_recursive_upload(&root, "/Usb0").unwrap();
        q.handle_ftp_event(&listed("/Usb0", vec![FtpEntry::directory("demos")]));
        assert!(q.take_events().contains(&QueueEvent::FolderExistsConfirmationNeeded {
            names: vec!["demos".into()],
        }));

        q.respond_to_folder_exists(FolderExistsChoice::Replace);
        assert_eq!(last_call(&q), Call::List("/Usb0/demos".into()));
        q.handle_ftp_event(&listed("/Usb0/demos", vec![FtpEntry::file("old.prg", 1)]));
        assert_eq!(last_call(&q), Call::Remove("/Usb0/demos/old.prg".into()));
        q.handle_ftp_event(&FtpEvent::FileRemoved {
            path: "/Usb0/demos/old.prg".into(),
        });
        assert_eq!(last_call(&q), Call::Rmdir("/Usb0/demos".into()));
        q.handle_ftp_event(&FtpEvent::DirectoryRemoved {
            path: "/Usb0/demos".into(),
        });
        assert_eq!(last_call(&q), Call::Mkdir("/Usb0/demos".into()));
    }

    #[test]
    fn recursive_delete_is_bottom_up() {
        let mut q = queue();
        q.enqueue_recursive_delete("/Usb0/old").unwrap();
        q.handle_ftp_event(&listed(
            "/Usb0/old",
            vec![FtpEntry::directory("sub"), FtpEntry::file("a.prg", 1)],
        ));
        q.handle_ftp_event(&listed("/Usb0/old/sub", vec![FtpEntry::file("b.prg", 1)]));

        let mut progress = Vec::new();
        loop {
            let event = match last_call(&q) {
                Call::Remove(path) => FtpEvent::FileRemoved { path },
                Call::Rmdir(path) => FtpEvent::DirectoryRemoved { path },
                _ => break,
            };
            q.handle_ftp_event(&event);
            progress.extend(q.take_events().into_iter().filter_map(|e| match e {
                QueueEvent::DeleteProgress { current, total, .. } => Some((current, total)),
                _ => None,
            }));
            if !q.is_processing() {
                break;
            }
        }

        let deletes: Vec<Call> = q
            .ftp()
            .calls
            .iter()
            .filter(|c| !matches!(c, Call::List(_)))
            .cloned()
            .collect();
        assert_eq!(
            deletes,
            vec![
                Call::Remove("/Usb0/old/a.prg".into()),
                Call::Remove("/Usb0/old/sub/b.prg".into()),
                Call::Rmdir("/Usb0/old/sub".into()),
                Call::Rmdir("/Usb0/old".into()),
            ]
        );
        assert_eq!(progress, vec![(1, 4), (2, 4), (3, 4), (4, 4)]);
    }

    #[test]
    fn download_over_existing_file_asks_first() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.prg");
        fs::write(&local, b"old").unwrap();

        let mut q = queue();
        q.enqueue_download(&local, "/a.prg").unwrap();
        assert!(q.ftp().calls.is_empty());
        assert!(q.take_events().contains(&QueueEvent::OverwriteConfirmationNeeded {
            file: "a.prg".into(),
            kind: TransferKind::Download,
        }));

        q.respond_to_overwrite(OverwriteChoice::OverwriteAll);
        assert!(q.config().auto_overwrite);
        assert_eq!(last_call(&q), Call::Download("/a.prg".into(), local));
    }

    #[test]
    fn failure_moves_on_and_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut q = queue();
        q.enqueue_download(&dir.path().join("a.prg"), "/a.prg").unwrap();
        q.enqueue_download(&dir.path().join("b.prg"), "/b.prg").unwrap();

        q.handle_ftp_event(&failed(FtpOperation::Download("/a.prg".into()), 550));
        assert!(matches!(last_call(&q), Call::Download(ref r, _) if r == "/b.prg"));
        let events = q.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, QueueEvent::OperationFailed { file, .. } if file == "a.prg")));
        // The failed batch is finished, so its item no longer counts.
        assert_eq!(q.active_and_pending_count(), 1);

        q.handle_ftp_event(&FtpEvent::DownloadFinished {
            remote_path: "/b.prg".into(),
            local_path: dir.path().join("b.prg"),
        });
        assert!(q.take_events().contains(&QueueEvent::AllOperationsCompleted));

        let retried = q.retry_failed();
        assert_eq!(retried.len(), 1);
        assert!(matches!(last_call(&q), Call::Download(ref r, _) if r == "/a.prg"));
        q.remove_completed();
        assert_eq!(q.items().len(), 1);
        assert_eq!(q.items()[0].status, TransferStatus::InProgress);
    }

    #[test]
    fn connection_loss_cancels_batches() {
        let mut q = queue();
        q.enqueue_delete("/a.prg", false).unwrap();
        q.handle_ftp_event(&FtpEvent::StateChanged {
            state: ConnectionState::Disconnected,
        });
        assert!(!q.is_processing());
        assert_eq!(q.items()[0].status, TransferStatus::Failed);
        assert_eq!(q.items()[0].error.as_deref(), Some("Connection lost"));
    }

    #[test]
    fn snapshot_serializes() {
        let mut q = queue();
        q.enqueue_delete("/a.prg", false).unwrap();
        let json = serde_json::to_value(q.snapshot()).unwrap();
        assert_eq!(json["pendingCount"], 0);
        assert_eq!(json["activeCount"], 1);
        assert_eq!(json["batches"][0]["phase"], "transferring");
        assert_eq!(json["isProcessing"], true);
    }
}
