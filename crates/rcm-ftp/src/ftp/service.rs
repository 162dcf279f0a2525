//! High-level orchestrator: one task owning the transfer queue.
//!
//! Protocol events from the connection driver and requests from the UI are
//! dispatched on the same task, so the queue never needs a lock.

use crate::ftp::connection::FtpHandle;
use crate::ftp::queue::TransferQueue;
use crate::ftp::types::*;
use log::info;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};

enum TransferCommand {
    EnqueueUpload {
        local_path: PathBuf,
        remote_path: String,
        reply: oneshot::Sender<Option<u64>>,
    },
    EnqueueDownload {
        local_path: PathBuf,
        remote_path: String,
        reply: oneshot::Sender<Option<u64>>,
    },
    EnqueueRecursiveUpload {
        local_dir: PathBuf,
        remote_dir: String,
        reply: oneshot::Sender<Option<u64>>,
    },
    EnqueueRecursiveDownload {
        local_dir: PathBuf,
        remote_dir: String,
        reply: oneshot::Sender<Option<u64>>,
    },
    EnqueueDelete {
        remote_path: String,
        is_directory: bool,
        reply: oneshot::Sender<Option<u64>>,
    },
    CancelBatch(u64),
    CancelAll,
    RemoveCompleted,
    Clear,
    RetryFailed(oneshot::Sender<Vec<u64>>),
    SetAutoOverwrite(bool),
    SetAutoMerge(bool),
    RespondToOverwrite(OverwriteChoice),
    RespondToFolderExists(FolderExistsChoice),
    Snapshot(oneshot::Sender<QueueSnapshot>),
}

/// Cloneable front end of the transfer service.
#[derive(Clone)]
pub struct TransferServiceHandle {
    commands: mpsc::UnboundedSender<TransferCommand>,
    ftp: FtpHandle,
}

impl TransferServiceHandle {
    /// The protocol connection the queue drives.
    pub fn ftp(&self) -> &FtpHandle {
        &self.ftp
    }

    fn send(&self, command: TransferCommand) {
        if self.commands.send(command).is_err() {
            log::warn!("Transfer service has stopped; request dropped");
        }
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> TransferCommand) -> Result<T, String> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| "Transfer service has stopped".to_string())?;
        rx.await.map_err(|_| "Transfer service has stopped".to_string())
    }

    pub async fn enqueue_upload(&self, local_path: PathBuf, remote_path: String) -> Result<Option<u64>, String> {
        self.ask(|reply| TransferCommand::EnqueueUpload {
            local_path,
            remote_path,
            reply,
        })
        .await
    }

    pub async fn enqueue_download(&self, local_path: PathBuf, remote_path: String) -> Result<Option<u64>, String> {
        self.ask(|reply| TransferCommand::EnqueueDownload {
            local_path,
            remote_path,
            reply,
        })
        .await
    }

    pub async fn enqueue_recursive_upload(&self, local_dir: PathBuf, remote_dir: String) -> Result<Option<u64>, String> {
        self.ask(|reply| TransferCommand::EnqueueRecursiveUpload {
            local_dir,
            remote_dir,
            reply,
        })
        .await
    }

    pub async fn enqueue_recursive_download(&self, local_dir: PathBuf, remote_dir: String) -> Result<Option<u64>, String> {
        self.ask(|reply| TransferCommand::EnqueueRecursiveDownload {
            local_dir,
            remote_dir,
            reply,
        })
        .await
    }

    pub async fn enqueue_delete(&self, remote_path: String, is_directory: bool) -> Result<Option<u64>, String> {
        self.ask(|reply| TransferCommand::EnqueueDelete {
            remote_path,
            is_directory,
            reply,
        })
        .await
    }

    pub async fn enqueue_recursive_delete(&self, remote_path: String) -> Result<Option<u64>, String> {
        self.enqueue_delete(remote_path, true).await
    }

    pub async fn retry_failed(&self) -> Result<Vec<u64>, String> {
        self.ask(TransferCommand::RetryFailed).await
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, String> {
        self.ask(TransferCommand::Snapshot).await
    }

    pub fn cancel_batch(&self, batch_id: u64) {
        self.send(TransferCommand::CancelBatch(batch_id));
    }

    pub fn cancel_all(&self) {
        self.send(TransferCommand::CancelAll);
    }

    pub fn remove_completed(&self) {
        self.send(TransferCommand::RemoveCompleted);
    }

    pub fn clear(&self) {
        self.send(TransferCommand::Clear);
    }

    pub fn set_auto_overwrite(&self, enabled: bool) {
        self.send(TransferCommand::SetAutoOverwrite(enabled));
    }

    pub fn set_auto_merge(&self, enabled: bool) {
        self.send(TransferCommand::SetAutoMerge(enabled));
    }

    pub fn respond_to_overwrite(&self, choice: OverwriteChoice) {
        self.send(TransferCommand::RespondToOverwrite(choice));
    }

    pub fn respond_to_folder_exists(&self, choice: FolderExistsChoice) {
        self.send(TransferCommand::RespondToFolderExists(choice));
    }
}

pub struct TransferService {
    queue: TransferQueue<FtpHandle>,
    events: mpsc::UnboundedSender<QueueEvent>,
}

impl TransferService {
    /// Start the dispatcher task over a running connection.
    pub fn spawn(
        ftp: FtpHandle,
        ftp_events: mpsc::UnboundedReceiver<FtpEvent>,
        config: QueueConfig,
    ) -> (TransferServiceHandle, mpsc::UnboundedReceiver<QueueEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let service = TransferService {
            queue: TransferQueue::new(ftp.clone(), config),
            events: events_tx,
        };
        tokio::spawn(service.run(commands_rx, ftp_events));

        let handle = TransferServiceHandle {
            commands: commands_tx,
            ftp,
        };
        (handle, events_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<TransferCommand>,
        mut ftp_events: mpsc::UnboundedReceiver<FtpEvent>,
    ) {
        info!("Transfer service started");
        loop {
            tokio::select! {
                event = ftp_events.recv() => match event {
                    Some(event) => self.queue.handle_ftp_event(&event),
                    None => break,
                },
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
            }
            self.publish();
        }
        self.queue.cancel_all();
        self.publish();
        info!("Transfer service stopped");
    }

    fn on_command(&mut self, command: TransferCommand) {
        let q = &mut self.queue;
        match command {
            TransferCommand::EnqueueUpload {
                local_path,
                remote_path,
                reply,
            } => {
                let _ = reply.send(q.enqueue_upload(&local_path, &remote_path));
            }
            TransferCommand::EnqueueDownload {
                local_path,
                remote_path,
                reply,
            } => {
                let _ = reply.send(q.enqueue_download(&local_path, &remote_path));
            }
            TransferCommand::EnqueueRecursiveUpload {
                local_dir,
                remote_dir,
                reply,
            } => {
                let _ = reply.send(q.enqueue_recursive_upload(&local_dir, &remote_dir));
            }
            TransferCommand::EnqueueRecursiveDownload {
                local_dir,
                remote_dir,
                reply,
            } => {
                let _ = reply.send(q.enqueue_recursive_download(&local_dir, &remote_dir));
            }
            TransferCommand::EnqueueDelete {
                remote_path,
                is_directory,
                reply,
            } => {
                let _ = reply.send(q.enqueue_delete(&remote_path, is_directory));
            }
            TransferCommand::CancelBatch(id) => q.cancel_batch(id),
            TransferCommand::CancelAll => q.cancel_all(),
            TransferCommand::RemoveCompleted => q.remove_completed(),
            TransferCommand::Clear => q.clear(),
            TransferCommand::RetryFailed(reply) => {
                let _ = reply.send(q.retry_failed());
            }
            TransferCommand::SetAutoOverwrite(enabled) => q.set_auto_overwrite(enabled),
            TransferCommand::SetAutoMerge(enabled) => q.set_auto_merge(enabled),
            TransferCommand::RespondToOverwrite(choice) => q.respond_to_overwrite(choice),
            TransferCommand::RespondToFolderExists(choice) => q.respond_to_folder_exists(choice),
            TransferCommand::Snapshot(reply) => {
                let _ = reply.send(q.snapshot());
            }
        }
    }

    fn publish(&mut self) {
        for event in self.queue.take_events() {
            if self.events.send(event).is_err() {
                log::debug!("Queue event receiver dropped");
            }
        }
    }
}
