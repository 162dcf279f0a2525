//! Stateful FTP client: the protocol state machine.
//!
//! The client never touches sockets itself. The connection driver feeds it
//! [`Input`]s (control lines, data-socket events) and executes the
//! [`Action`]s it queues (send a command, open/close the data socket).
//! Notifications for the host are collected as [`FtpEvent`]s.
//!
//! Lifecycle: `connect_to_host()` → greeting → USER/PASS → PWD → Ready.
//! Every public operation expands into a short sequence of commands that
//! share an operation id; a failed step drops the rest of its sequence and
//! the queue moves on.

use crate::ftp::error::FtpError;
use crate::ftp::parser;
use crate::ftp::protocol::{self, ReplyAssembler};
use crate::ftp::transfer::{
    self, CommandPayload, DataChannelId, DataPhase, DownloadSink, TransferContext,
};
use crate::ftp::types::*;
use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Socket-level happenings reported by the connection driver.
#[derive(Debug)]
pub enum Input {
    ControlConnected { generation: u64, peer: IpAddr },
    ControlConnectFailed { generation: u64, error: FtpError },
    ControlLine { generation: u64, line: String },
    ControlClosed { generation: u64 },
    ControlError { generation: u64, error: FtpError },
    DataConnected { channel: DataChannelId },
    DataReceived { channel: DataChannelId, bytes: Vec<u8> },
    DataClosed { channel: DataChannelId },
    DataError { channel: DataChannelId, error: FtpError },
    DataWritten { channel: DataChannelId },
}

/// Work the connection driver must carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    OpenControl {
        generation: u64,
        host: String,
        port: u16,
        timeout: Duration,
    },
    SendCommand(String),
    CloseControl,
    OpenData {
        channel: DataChannelId,
        addr: SocketAddr,
        timeout: Duration,
    },
    WriteData {
        channel: DataChannelId,
        bytes: Vec<u8>,
    },
    CloseData {
        channel: DataChannelId,
    },
}

/// One queued protocol request.
#[derive(Debug)]
struct PendingCommand {
    op_id: u64,
    operation: FtpOperation,
    kind: FtpCommandKind,
    arg: String,
    payload: CommandPayload,
    /// Final step of its logical operation.
    last: bool,
}

/// The command whose reply we are waiting for. Its payload, if any, has
/// moved into the data phase.
#[derive(Debug, Clone)]
struct InFlight {
    op_id: u64,
    operation: FtpOperation,
    kind: FtpCommandKind,
    arg: String,
    last: bool,
}

/// FTP protocol client for one device.
pub struct FtpClient {
    config: FtpConnectionConfig,
    state: ConnectionState,
    current_directory: String,
    generation: u64,
    peer: Option<IpAddr>,
    replies: ReplyAssembler,
    queue: VecDeque<PendingCommand>,
    in_flight: Option<InFlight>,
    data: DataPhase,
    next_channel: DataChannelId,
    next_op: u64,
    /// Replies still owed by commands cut off by `abort()`.
    discard_replies: usize,
    events: Vec<FtpEvent>,
    actions: Vec<Action>,
}

impl FtpClient {
    pub fn new(config: FtpConnectionConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            current_directory: "/".into(),
            generation: 0,
            peer: None,
            replies: ReplyAssembler::new(),
            queue: VecDeque::new(),
            in_flight: None,
            data: DataPhase::Idle,
            next_channel: 0,
            next_op: 0,
            discard_replies: 0,
            events: Vec::new(),
            actions: Vec::new(),
        }
    }

    // ─── Accessors ───────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.is_logged_in()
    }

    pub fn current_directory(&self) -> &str {
        &self.current_directory
    }

    pub fn config(&self) -> &FtpConnectionConfig {
        &self.config
    }

    /// Commands waiting behind the one in flight.
    pub fn queued_commands(&self) -> usize {
        self.queue.len()
    }

    pub fn take_events(&mut self) -> Vec<FtpEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    // ─── Connection lifecycle ────────────────────────────────────

    pub fn set_host(&mut self, host: impl Into<String>, port: u16) {
        self.config.host = host.into();
        self.config.port = port;
    }

    pub fn set_credentials(&mut self, username: impl Into<String>, password: impl Into<String>) {
        self.config.username = username.into();
        self.config.password = password.into();
    }

    /// Start connecting. Ignored unless disconnected.
    pub fn connect_to_host(&mut self) {
        if self.state != ConnectionState::Disconnected {
            log::debug!("connect_to_host ignored in state {:?}", self.state);
            return;
        }
        if self.config.host.is_empty() {
            self.emit_error(
                Some(FtpOperation::Connect),
                FtpError::invalid_config("Host must not be empty"),
            );
            return;
        }
        self.generation += 1;
        log::info!("FTP connecting to {}:{}", self.config.host, self.config.port);
        self.set_state(ConnectionState::Connecting);
        self.actions.push(Action::OpenControl {
            generation: self.generation,
            host: self.config.host.clone(),
            port: self.config.port,
            timeout: Duration::from_secs(self.config.connect_timeout_sec),
        });
    }

    /// Close the session without waiting for the server.
    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        if self.is_logged_in() {
            self.actions.push(Action::SendCommand(protocol::format_command(
                FtpCommandKind::Quit,
                "",
            )));
        }
        log::info!("FTP disconnecting from {}", self.config.host);
        self.teardown(None);
    }

    /// Cancel everything queued and the running transfer.
    ///
    /// Without a logged-in session there is nothing to abort and the state
    /// is left untouched.
    pub fn abort(&mut self) {
        if !self.is_logged_in() {
            log::debug!("abort ignored in state {:?}", self.state);
            return;
        }

        let mut owed = 0;
        if let Some(cmd) = self.in_flight.take() {
            // A data command that already got its final reply owes nothing more.
            let answered = cmd.kind.uses_data_channel()
                && matches!(self.data, DataPhase::AwaitingData { .. });
            if !answered {
                owed += 1;
            }
        }
        let transfer_active = !self.data.is_idle();
        if owed > 0 || transfer_active {
            self.actions.push(Action::SendCommand("ABOR".into()));
            owed += 1;
        }
        self.discard_replies += owed;

        self.clear_queue();
        self.close_data();
        self.set_state(ConnectionState::Ready);
        self.events.push(FtpEvent::Aborted);
        log::info!("FTP transfer aborted ({} replies to discard)", self.discard_replies);
    }

    // ─── Operations ──────────────────────────────────────────────

    pub fn list(&mut self, path: &str) {
        let op = FtpOperation::List(path.to_string());
        if !self.require_login(&op) {
            return;
        }
        let id = self.op_id();
        self.push(id, &op, FtpCommandKind::Type, TransferType::Ascii.code(), CommandPayload::None, false);
        self.push(id, &op, FtpCommandKind::Pasv, "", CommandPayload::None, false);
        self.push(id, &op, FtpCommandKind::List, path, CommandPayload::None, true);
        self.pump();
    }

    pub fn change_directory(&mut self, path: &str) {
        let op = FtpOperation::ChangeDirectory(path.to_string());
        if !self.require_login(&op) {
            return;
        }
        let id = self.op_id();
        self.push(id, &op, FtpCommandKind::Cwd, path, CommandPayload::None, false);
        self.push(id, &op, FtpCommandKind::Pwd, "", CommandPayload::None, true);
        self.pump();
    }

    pub fn make_directory(&mut self, path: &str) {
        self.single(FtpOperation::MakeDirectory(path.to_string()), FtpCommandKind::Mkd, path);
    }

    pub fn remove_directory(&mut self, path: &str) {
        self.single(FtpOperation::RemoveDirectory(path.to_string()), FtpCommandKind::Rmd, path);
    }

    pub fn remove(&mut self, path: &str) {
        self.single(FtpOperation::Remove(path.to_string()), FtpCommandKind::Dele, path);
    }

    pub fn rename(&mut self, from: &str, to: &str) {
        let op = FtpOperation::Rename(from.to_string());
        if !self.require_login(&op) {
            return;
        }
        let id = self.op_id();
        self.push(id, &op, FtpCommandKind::Rnfr, from, CommandPayload::None, false);
        self.push(id, &op, FtpCommandKind::Rnto, to, CommandPayload::None, true);
        self.pump();
    }

    /// Download `remote_path` into `local_path`. The local file is created
    /// before anything is queued.
    pub fn download(&mut self, remote_path: &str, local_path: &Path) {
        let op = FtpOperation::Download(remote_path.to_string());
        if !self.require_login(&op) {
            return;
        }
        let file = match File::create(local_path) {
            Ok(f) => f,
            Err(e) => {
                self.emit_error(
                    Some(op),
                    FtpError::io_error(format!("Cannot open {} for writing: {}", local_path.display(), e)),
                );
                return;
            }
        };
        let sink = DownloadSink::File {
            path: local_path.to_path_buf(),
            file,
        };
        self.queue_transfer(op, FtpCommandKind::Retr, remote_path, CommandPayload::Download(sink));
    }

    pub fn download_to_memory(&mut self, remote_path: &str) {
        let op = FtpOperation::DownloadToMemory(remote_path.to_string());
        if !self.require_login(&op) {
            return;
        }
        let sink = DownloadSink::Memory(Vec::new());
        self.queue_transfer(op, FtpCommandKind::Retr, remote_path, CommandPayload::Download(sink));
    }

    /// Upload `local_path` to `remote_path`. The local file is opened
    /// before anything is queued.
    pub fn upload(&mut self, local_path: &Path, remote_path: &str) {
        let op = FtpOperation::Upload(remote_path.to_string());
        if !self.require_login(&op) {
            return;
        }
        let opened = File::open(local_path).and_then(|f| {
            let size = f.metadata()?.len();
            Ok((f, size))
        });
        let (file, size) = match opened {
            Ok(v) => v,
            Err(e) => {
                self.emit_error(
                    Some(op),
                    FtpError::io_error(format!("Cannot open {} for reading: {}", local_path.display(), e)),
                );
                return;
            }
        };
        let payload = CommandPayload::Upload {
            path: local_path.to_path_buf(),
            file,
            size,
        };
        self.queue_transfer(op, FtpCommandKind::Stor, remote_path, payload);
    }

    // ─── Input dispatch ──────────────────────────────────────────

    pub fn handle(&mut self, input: Input) {
        match input {
            Input::ControlConnected { generation, peer } => {
                if generation != self.generation || self.state != ConnectionState::Connecting {
                    return;
                }
                log::debug!("FTP control connection up ({})", peer);
                self.peer = Some(peer);
                self.set_state(ConnectionState::Connected);
            }
            Input::ControlConnectFailed { generation, error } => {
                if generation != self.generation || self.state != ConnectionState::Connecting {
                    return;
                }
                self.teardown(Some(error));
            }
            Input::ControlLine { generation, line } => {
                if generation != self.generation || self.state == ConnectionState::Disconnected {
                    return;
                }
                log::trace!("<<< {}", line.trim_end());
                match self.replies.push_line(&line) {
                    Ok(Some(reply)) => self.on_reply(reply),
                    Ok(None) => {}
                    Err(e) => log::warn!("Ignoring malformed control line: {}", e),
                }
            }
            Input::ControlClosed { generation } => {
                if generation != self.generation || self.state == ConnectionState::Disconnected {
                    return;
                }
                self.teardown(Some(FtpError::disconnected("Server closed the connection")));
            }
            Input::ControlError { generation, error } => {
                if generation != self.generation || self.state == ConnectionState::Disconnected {
                    return;
                }
                self.teardown(Some(error));
            }
            Input::DataConnected { channel } => self.on_data_connected(channel),
            Input::DataReceived { channel, bytes } => self.on_data_received(channel, bytes),
            Input::DataClosed { channel } => self.on_data_closed(channel),
            Input::DataError { channel, error } => self.on_data_error(channel, error),
            Input::DataWritten { channel } => self.on_data_written(channel),
        }
    }

    // ─── Control replies ─────────────────────────────────────────

    fn on_reply(&mut self, reply: FtpReply) {
        if self.discard_replies > 0 && !reply.is_preliminary() {
            log::debug!("Discarding reply after abort: {}", reply.text());
            self.discard_replies -= 1;
            if self.discard_replies == 0 {
                self.pump();
            }
            return;
        }

        match self.state {
            ConnectionState::Connected => self.on_greeting(reply),
            ConnectionState::LoggingIn => self.on_login_reply(reply),
            ConnectionState::Ready | ConnectionState::Busy => self.on_command_reply(reply),
            ConnectionState::Connecting | ConnectionState::Disconnected => {
                log::warn!("Unexpected reply in state {:?}: {}", self.state, reply.text());
            }
        }
    }

    fn on_greeting(&mut self, reply: FtpReply) {
        match reply.code {
            120 => {}
            220 => {
                self.set_state(ConnectionState::LoggingIn);
                let user = self.config.username.clone();
                self.send_now(FtpOperation::Connect, FtpCommandKind::User, &user);
            }
            code => self.teardown(Some(
                FtpError::connection_failed(format!("Server refused session: {}", reply.text()))
                    .with_code(code),
            )),
        }
    }

    fn on_login_reply(&mut self, reply: FtpReply) {
        let step = self.in_flight.as_ref().map(|c| c.kind);
        match (step, reply.code) {
            (Some(FtpCommandKind::User), 331) | (Some(FtpCommandKind::User), 332) => {
                let pass = self.config.password.clone();
                self.send_now(FtpOperation::Connect, FtpCommandKind::Pass, &pass);
            }
            (Some(FtpCommandKind::User), 230)
            | (Some(FtpCommandKind::Pass), 230)
            | (Some(FtpCommandKind::Pass), 202) => {
                self.in_flight = None;
                log::info!("FTP logged in to {} as {}", self.config.host, self.config.username);
                self.set_state(ConnectionState::Ready);
                self.events.push(FtpEvent::Connected);
                let id = self.op_id();
                self.push(id, &FtpOperation::PrintDirectory, FtpCommandKind::Pwd, "", CommandPayload::None, true);
                self.pump();
            }
            (_, code) if reply.is_preliminary() => {
                log::debug!("Login preliminary reply {}", code);
            }
            (_, code) => self.teardown(Some(
                FtpError::auth_failed(format!("Login failed: {}", reply.text())).with_code(code),
            )),
        }
    }

    fn on_command_reply(&mut self, reply: FtpReply) {
        let cmd = match self.in_flight.clone() {
            Some(c) => c,
            None => {
                log::warn!("Stray reply with nothing in flight: {}", reply.text());
                return;
            }
        };

        if cmd.kind.uses_data_channel() {
            self.on_transfer_reply(cmd, reply);
            return;
        }

        if reply.is_preliminary() {
            return;
        }
        if !reply.is_success() {
            self.fail_operation(cmd.op_id, cmd.operation, FtpError::from_reply(reply.code, &reply.text()));
            return;
        }

        match cmd.kind {
            FtpCommandKind::Pasv => {
                self.in_flight = None;
                match transfer::parse_pasv_port(&reply.text()) {
                    Ok(port) => self.open_data_channel(port, cmd),
                    Err(e) => self.fail_operation(cmd.op_id, cmd.operation, e),
                }
                return;
            }
            FtpCommandKind::Pwd => {
                if let Some(path) = protocol::parse_quoted_path(&reply.text()) {
                    self.current_directory = path;
                }
            }
            FtpCommandKind::Rnfr if reply.code != 350 => {
                self.fail_operation(
                    cmd.op_id,
                    cmd.operation,
                    FtpError::protocol_error(format!("Unexpected RNFR reply: {}", reply.text())),
                );
                return;
            }
            _ => {}
        }

        self.complete_step(cmd, None);
    }

    fn on_transfer_reply(&mut self, cmd: InFlight, reply: FtpReply) {
        if reply.is_preliminary() {
            self.on_transfer_started(&reply);
            return;
        }

        let failure = if reply.is_success() {
            None
        } else {
            Some(FtpError::from_reply(reply.code, &reply.text()))
        };

        match std::mem::replace(&mut self.data, DataPhase::Idle) {
            DataPhase::Streaming { channel, ctx } => match failure {
                Some(error) => {
                    self.actions.push(Action::CloseData { channel });
                    ctx.discard();
                    self.fail_operation(cmd.op_id, cmd.operation, error);
                }
                None if ctx.is_store() => {
                    // Server finished before we sent everything.
                    self.actions.push(Action::CloseData { channel });
                    ctx.discard();
                    self.fail_operation(
                        cmd.op_id,
                        cmd.operation,
                        FtpError::transfer_failed("Server ended the upload early"),
                    );
                }
                None => {
                    self.data = DataPhase::AwaitingData { channel, ctx };
                }
            },
            DataPhase::AwaitingControl { ctx, failure: data_failure } => {
                match failure.or(data_failure) {
                    Some(error) => {
                        ctx.discard();
                        self.fail_operation(cmd.op_id, cmd.operation, error);
                    }
                    None => self.finish_transfer(cmd, ctx),
                }
            }
            other => {
                self.data = other;
                let error = failure.unwrap_or_else(|| {
                    FtpError::protocol_error(format!("Unexpected transfer reply: {}", reply.text()))
                });
                self.close_data();
                self.fail_operation(cmd.op_id, cmd.operation, error);
            }
        }
    }

    /// 150/125: the server is about to move bytes.
    fn on_transfer_started(&mut self, reply: &FtpReply) {
        match &mut self.data {
            DataPhase::Streaming {
                ctx: TransferContext::Retrieve { total, .. },
                ..
            } => {
                *total = protocol::parse_transfer_size(&reply.text());
            }
            DataPhase::Streaming {
                channel,
                ctx: TransferContext::Store { started, .. },
            } => {
                if !*started {
                    *started = true;
                    let channel = *channel;
                    self.write_next_chunk(channel);
                }
            }
            _ => {}
        }
    }

    // ─── Data channel ────────────────────────────────────────────

    fn open_data_channel(&mut self, port: u16, cmd: InFlight) {
        let peer = match self.peer {
            Some(p) => p,
            None => {
                self.fail_operation(
                    cmd.op_id,
                    cmd.operation,
                    FtpError::data_channel("No control peer address for passive mode"),
                );
                return;
            }
        };
        self.next_channel += 1;
        let channel = self.next_channel;
        let addr = transfer::passive_address(peer, port);
        log::debug!("Opening data channel #{} to {}", channel, addr);
        self.data = DataPhase::Connecting { channel };
        self.actions.push(Action::OpenData {
            channel,
            addr,
            timeout: Duration::from_secs(self.config.data_timeout_sec),
        });
    }

    fn on_data_connected(&mut self, channel: DataChannelId) {
        if !matches!(self.data, DataPhase::Connecting { channel: c } if c == channel) {
            self.actions.push(Action::CloseData { channel });
            return;
        }
        let cmd = match self.queue.pop_front() {
            Some(c) if c.kind.uses_data_channel() => c,
            other => {
                if let Some(c) = other {
                    self.queue.push_front(c);
                }
                self.data = DataPhase::Idle;
                self.actions.push(Action::CloseData { channel });
                log::warn!("Data channel #{} opened with no transfer queued", channel);
                self.settle();
                return;
            }
        };

        let PendingCommand {
            op_id,
            operation,
            kind,
            arg,
            payload,
            last,
        } = cmd;
        match TransferContext::start(kind, &arg, payload) {
            Ok(ctx) => {
                self.data = DataPhase::Streaming { channel, ctx };
                self.send_command(InFlight {
                    op_id,
                    operation,
                    kind,
                    arg,
                    last,
                });
            }
            Err(e) => {
                self.data = DataPhase::Idle;
                self.actions.push(Action::CloseData { channel });
                self.fail_operation(op_id, operation, e);
            }
        }
    }

    fn on_data_received(&mut self, channel: DataChannelId, bytes: Vec<u8>) {
        if self.data.channel() != Some(channel) {
            return;
        }
        let result = match &mut self.data {
            DataPhase::Streaming { ctx, .. } | DataPhase::AwaitingData { ctx, .. } => {
                ctx.absorb(&bytes).map(|_| match ctx {
                    TransferContext::Retrieve {
                        remote_path,
                        received,
                        total,
                        ..
                    } => Some(FtpEvent::DownloadProgress {
                        remote_path: remote_path.clone(),
                        received: *received,
                        total: *total,
                    }),
                    _ => None,
                })
            }
            _ => return,
        };
        match result {
            Ok(Some(progress)) => self.events.push(progress),
            Ok(None) => {}
            Err(e) => self.on_data_error(channel, e),
        }
    }

    fn on_data_closed(&mut self, channel: DataChannelId) {
        if self.data.channel() != Some(channel) {
            return;
        }
        match std::mem::replace(&mut self.data, DataPhase::Idle) {
            DataPhase::Streaming { ctx, .. } => {
                let failure = if ctx.is_store() {
                    Some(FtpError::data_channel("Data connection closed by server during upload"))
                } else {
                    None
                };
                self.data = DataPhase::AwaitingControl { ctx, failure };
            }
            DataPhase::AwaitingData { ctx, .. } => {
                if let Some(cmd) = self.in_flight.clone() {
                    self.finish_transfer(cmd, ctx);
                } else {
                    ctx.discard();
                }
            }
            DataPhase::Connecting { .. } => {
                self.on_data_error(channel, FtpError::data_channel("Data connection closed before use"));
            }
            other => self.data = other,
        }
    }

    fn on_data_error(&mut self, channel: DataChannelId, error: FtpError) {
        if self.data.channel() != Some(channel) {
            return;
        }
        log::warn!("Data channel #{} failed: {}", channel, error);
        self.actions.push(Action::CloseData { channel });
        match std::mem::replace(&mut self.data, DataPhase::Idle) {
            DataPhase::Connecting { .. } => {
                // Nothing was sent for the transfer yet; drop it.
                let (op_id, operation) = match self.queue.front() {
                    Some(c) => (c.op_id, c.operation.clone()),
                    None => {
                        self.settle();
                        return;
                    }
                };
                self.fail_operation(op_id, operation, error);
            }
            DataPhase::Streaming { ctx, .. } => {
                self.data = DataPhase::AwaitingControl {
                    ctx,
                    failure: Some(error),
                };
            }
            DataPhase::AwaitingData { ctx, .. } => {
                ctx.discard();
                match self.in_flight.clone() {
                    Some(cmd) => self.fail_operation(cmd.op_id, cmd.operation, error),
                    None => self.settle(),
                }
            }
            other => self.data = other,
        }
    }

    fn on_data_written(&mut self, channel: DataChannelId) {
        if self.data.channel() != Some(channel) {
            return;
        }
        if let DataPhase::Streaming {
            ctx: TransferContext::Store {
                remote_path,
                sent,
                total,
                ..
            },
            ..
        } = &self.data
        {
            self.events.push(FtpEvent::UploadProgress {
                remote_path: remote_path.clone(),
                sent: *sent,
                total: *total,
            });
            self.write_next_chunk(channel);
        }
    }

    fn write_next_chunk(&mut self, channel: DataChannelId) {
        let chunk_size = self.config.chunk_size;
        let chunk = match &mut self.data {
            DataPhase::Streaming { ctx, .. } => ctx.next_chunk(chunk_size),
            _ => return,
        };
        match chunk {
            Ok(bytes) if bytes.is_empty() => {
                self.actions.push(Action::CloseData { channel });
                if let DataPhase::Streaming { mut ctx, .. } =
                    std::mem::replace(&mut self.data, DataPhase::Idle)
                {
                    if let TransferContext::Store {
                        finished_writing, ..
                    } = &mut ctx
                    {
                        *finished_writing = true;
                    }
                    self.data = DataPhase::AwaitingControl { ctx, failure: None };
                }
            }
            Ok(bytes) => {
                if let DataPhase::Streaming {
                    ctx: TransferContext::Store { sent, .. },
                    ..
                } = &mut self.data
                {
                    *sent += bytes.len() as u64;
                }
                self.actions.push(Action::WriteData { channel, bytes });
            }
            Err(e) => self.on_data_error(channel, e),
        }
    }

    fn finish_transfer(&mut self, cmd: InFlight, ctx: TransferContext) {
        let event = match ctx {
            TransferContext::List { path, buffer } => {
                let text = String::from_utf8_lossy(&buffer);
                FtpEvent::DirectoryListed {
                    path,
                    entries: parser::parse_listing(&text),
                }
            }
            TransferContext::Retrieve {
                remote_path, sink, ..
            } => match sink {
                DownloadSink::File { path, mut file } => {
                    if let Err(e) = file.flush() {
                        drop(file);
                        let _ = std::fs::remove_file(&path);
                        self.fail_operation(
                            cmd.op_id,
                            cmd.operation,
                            FtpError::io_error(format!("Flush of {} failed: {}", path.display(), e)),
                        );
                        return;
                    }
                    FtpEvent::DownloadFinished {
                        remote_path,
                        local_path: path,
                    }
                }
                DownloadSink::Memory(data) => FtpEvent::DownloadToMemoryFinished { remote_path, data },
            },
            TransferContext::Store {
                remote_path,
                local_path,
                ..
            } => FtpEvent::UploadFinished {
                local_path,
                remote_path,
            },
        };
        self.complete_step(cmd, Some(event));
    }

    fn close_data(&mut self) {
        if let Some(channel) = self.data.channel() {
            self.actions.push(Action::CloseData { channel });
        }
        self.data.reset();
    }

    // ─── Queue mechanics ─────────────────────────────────────────

    fn op_id(&mut self) -> u64 {
        self.next_op += 1;
        self.next_op
    }

    fn require_login(&mut self, op: &FtpOperation) -> bool {
        if self.is_logged_in() {
            return true;
        }
        self.emit_error(Some(op.clone()), FtpError::not_connected("Not logged in"));
        false
    }

    fn push(
        &mut self,
        op_id: u64,
        operation: &FtpOperation,
        kind: FtpCommandKind,
        arg: &str,
        payload: CommandPayload,
        last: bool,
    ) {
        self.queue.push_back(PendingCommand {
            op_id,
            operation: operation.clone(),
            kind,
            arg: arg.to_string(),
            payload,
            last,
        });
    }

    fn single(&mut self, op: FtpOperation, kind: FtpCommandKind, path: &str) {
        if !self.require_login(&op) {
            return;
        }
        let id = self.op_id();
        self.push(id, &op, kind, path, CommandPayload::None, true);
        self.pump();
    }

    fn queue_transfer(
        &mut self,
        op: FtpOperation,
        kind: FtpCommandKind,
        remote_path: &str,
        payload: CommandPayload,
    ) {
        let id = self.op_id();
        self.push(id, &op, FtpCommandKind::Type, TransferType::Binary.code(), CommandPayload::None, false);
        self.push(id, &op, FtpCommandKind::Pasv, "", CommandPayload::None, false);
        self.push(id, &op, kind, remote_path, payload, true);
        self.pump();
    }

    /// Send the next queued command if the channel is free.
    fn pump(&mut self) {
        if !self.is_logged_in()
            || self.in_flight.is_some()
            || !self.data.is_idle()
            || self.discard_replies > 0
        {
            return;
        }
        let cmd = match self.queue.pop_front() {
            Some(c) => c,
            None => {
                self.set_state(ConnectionState::Ready);
                return;
            }
        };
        if cmd.kind.uses_data_channel() {
            // Its PASV step failed or never ran.
            let (op_id, operation) = (cmd.op_id, cmd.operation.clone());
            cmd.payload.discard();
            self.fail_operation(
                op_id,
                operation,
                FtpError::data_channel("Transfer queued without a data channel"),
            );
            return;
        }
        let PendingCommand {
            op_id,
            operation,
            kind,
            arg,
            payload,
            last,
        } = cmd;
        payload.discard();
        self.set_state(ConnectionState::Busy);
        self.send_command(InFlight {
            op_id,
            operation,
            kind,
            arg,
            last,
        });
    }

    fn send_now(&mut self, operation: FtpOperation, kind: FtpCommandKind, arg: &str) {
        self.send_command(InFlight {
            op_id: 0,
            operation,
            kind,
            arg: arg.to_string(),
            last: false,
        });
    }

    fn send_command(&mut self, cmd: InFlight) {
        let line = protocol::format_command(cmd.kind, &cmd.arg);
        self.actions.push(Action::SendCommand(line));
        self.in_flight = Some(cmd);
    }

    /// A step succeeded; emit the operation's event when it was the last.
    fn complete_step(&mut self, cmd: InFlight, event: Option<FtpEvent>) {
        self.in_flight = None;
        if cmd.last {
            let event = event.or_else(|| self.completion_event(&cmd));
            if let Some(event) = event {
                self.events.push(event);
            }
        }
        self.settle();
    }

    fn completion_event(&self, cmd: &InFlight) -> Option<FtpEvent> {
        match (&cmd.operation, cmd.kind) {
            (FtpOperation::ChangeDirectory(_), _) | (FtpOperation::PrintDirectory, _) => {
                Some(FtpEvent::DirectoryChanged {
                    path: self.current_directory.clone(),
                })
            }
            (FtpOperation::MakeDirectory(path), _) => Some(FtpEvent::DirectoryCreated { path: path.clone() }),
            (FtpOperation::RemoveDirectory(path), _) => Some(FtpEvent::DirectoryRemoved { path: path.clone() }),
            (FtpOperation::Remove(path), _) => Some(FtpEvent::FileRemoved { path: path.clone() }),
            (FtpOperation::Rename(from), FtpCommandKind::Rnto) => Some(FtpEvent::FileRenamed {
                from: from.clone(),
                to: cmd.arg.clone(),
            }),
            _ => None,
        }
    }

    /// A step failed: report once, drop the rest of its operation, go on.
    fn fail_operation(&mut self, op_id: u64, operation: FtpOperation, error: FtpError) {
        log::warn!("FTP {:?} failed: {}", operation, error);
        if self.in_flight.as_ref().map(|c| c.op_id) == Some(op_id) {
            self.in_flight = None;
        }
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for cmd in self.queue.drain(..) {
            if cmd.op_id == op_id {
                cmd.payload.discard();
            } else {
                kept.push_back(cmd);
            }
        }
        self.queue = kept;
        if let DataPhase::Connecting { channel } = self.data {
            self.actions.push(Action::CloseData { channel });
            self.data = DataPhase::Idle;
        }
        self.emit_error(Some(operation), error);
        self.settle();
    }

    fn settle(&mut self) {
        if self.is_logged_in() {
            self.pump();
        }
    }

    fn clear_queue(&mut self) {
        for cmd in self.queue.drain(..) {
            cmd.payload.discard();
        }
    }

    /// Drop the connection and every piece of pending state.
    fn teardown(&mut self, error: Option<FtpError>) {
        let connecting = matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::LoggingIn
        );
        self.clear_queue();
        self.close_data();
        self.in_flight = None;
        self.replies.clear();
        self.discard_replies = 0;
        self.peer = None;
        self.actions.push(Action::CloseControl);
        self.set_state(ConnectionState::Disconnected);
        match error {
            Some(error) => {
                log::warn!("FTP connection to {} lost: {}", self.config.host, error);
                let op = if connecting { Some(FtpOperation::Connect) } else { None };
                self.emit_error(op, error);
            }
            None => self.events.push(FtpEvent::Disconnected),
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            log::debug!("FTP state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.events.push(FtpEvent::StateChanged { state });
        }
    }

    fn emit_error(&mut self, operation: Option<FtpOperation>, error: FtpError) {
        self.events.push(FtpEvent::Error { operation, error });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::error::FtpErrorKind;
    use std::net::Ipv4Addr;

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 64));

    fn config() -> FtpConnectionConfig {
        FtpConnectionConfig {
            host: "c64".into(),
            chunk_size: 4,
            ..FtpConnectionConfig::default()
        }
    }

    fn line(client: &mut FtpClient, text: &str) {
        let generation = client.generation;
        client.handle(Input::ControlLine {
            generation,
            line: format!("{}\r\n", text),
        });
    }

    fn sent(actions: &[Action]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::SendCommand(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    fn listings(events: &[FtpEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, FtpEvent::DirectoryListed { .. }))
            .count()
    }

    fn finished_downloads(events: &[FtpEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, FtpEvent::DownloadFinished { .. }))
            .count()
    }

    fn errors(events: &[FtpEvent]) -> Vec<FtpError> {
        events
            .iter()
            .filter_map(|e| match e {
                FtpEvent::Error { error, .. } => Some(error.clone()),
                _ => None,
            })
            .collect()
    }

    fn logged_in() -> FtpClient {
        let mut client = FtpClient::new(config());
        client.connect_to_host();
        client.handle(Input::ControlConnected {
            generation: client.generation,
            peer: PEER,
        });
        line(&mut client, "220 Ultimate FTP ready");
        line(&mut client, "331 Password please");
        line(&mut client, "230 Logged in");
        line(&mut client, "257 \"/\" is current directory");
        client.take_actions();
        client.take_events();
        client
    }

    /// Drive TYPE + PASV and return the data channel id.
    fn open_data(client: &mut FtpClient) -> DataChannelId {
        line(client, "200 Type set");
        line(client, "227 Entering Passive Mode (10,0,0,9,4,0)");
        let channel = client
            .take_actions()
            .iter()
            .find_map(|a| match a {
                Action::OpenData { channel, addr, .. } => {
                    assert_eq!(*addr, SocketAddr::new(PEER, 1024));
                    Some(*channel)
                }
                _ => None,
            })
            .expect("data channel requested");
        client.handle(Input::DataConnected { channel });
        channel
    }

    #[test]
    fn login_sequence() {
        let mut client = FtpClient::new(config());
        client.connect_to_host();
        assert_eq!(client.state(), ConnectionState::Connecting);
        assert!(matches!(client.take_actions()[0], Action::OpenControl { .. }));

        client.handle(Input::ControlConnected {
            generation: client.generation,
            peer: PEER,
        });
        line(&mut client, "220-Welcome");
        line(&mut client, "220 Ready");
        line(&mut client, "331 Password please");
        line(&mut client, "230 Logged in");
        assert_eq!(client.state(), ConnectionState::Busy);
        line(&mut client, "257 \"/Usb0\" is current directory");

        assert_eq!(sent(&client.take_actions()), vec!["USER anonymous", "PASS", "PWD"]);
        let events = client.take_events();
        assert!(events.contains(&FtpEvent::Connected));
        assert!(events.contains(&FtpEvent::DirectoryChanged { path: "/Usb0".into() }));
        assert_eq!(client.state(), ConnectionState::Ready);
        assert_eq!(client.current_directory(), "/Usb0");
    }

    #[test]
    fn rejected_login_disconnects() {
        let mut client = FtpClient::new(config());
        client.connect_to_host();
        client.handle(Input::ControlConnected {
            generation: client.generation,
            peer: PEER,
        });
        line(&mut client, "220 Ready");
        line(&mut client, "331 Password please");
        line(&mut client, "530 Login incorrect");

        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.take_actions().contains(&Action::CloseControl));
        let errs = errors(&client.take_events());
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].kind, FtpErrorKind::AuthFailed);
        assert_eq!(errs[0].code, Some(530));
    }

    #[test]
    fn connect_timeout_reports_once() {
        let mut client = FtpClient::new(config());
        client.connect_to_host();
        client.handle(Input::ControlConnectFailed {
            generation: client.generation,
            error: FtpError::timeout("Connect timed out"),
        });
        assert_eq!(client.state(), ConnectionState::Disconnected);
        let events = client.take_events();
        let errs = errors(&events);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].kind, FtpErrorKind::Timeout);
        assert!(events.contains(&FtpEvent::Error {
            operation: Some(FtpOperation::Connect),
            error: errs[0].clone(),
        }));
    }

    #[test]
    fn stale_generation_is_ignored() {
        let mut client = logged_in();
        client.handle(Input::ControlClosed {
            generation: client.generation - 1,
        });
        assert_eq!(client.state(), ConnectionState::Ready);
        assert!(client.take_events().is_empty());
    }

    #[test]
    fn operations_require_login() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = FtpClient::new(config());
        client.list("/");
        client.make_directory("/x");
        client.download("/a.prg", &dir.path().join("a.prg"));
        client.upload(&dir.path().join("missing"), "/b.prg");

        assert_eq!(client.queued_commands(), 0);
        assert!(client.take_actions().is_empty());
        let errs = errors(&client.take_events());
        assert_eq!(errs.len(), 4);
        assert!(errs.iter().all(|e| e.kind == FtpErrorKind::NotConnected));
        assert!(!dir.path().join("a.prg").exists());
    }

    #[test]
    fn list_completes_when_reply_precedes_close() {
        let mut client = logged_in();
        client.list("/Usb0");
        let channel = open_data(&mut client);
        assert_eq!(sent(&client.take_actions()), vec!["LIST /Usb0"]);

        line(&mut client, "150 Here comes the listing");
        client.handle(Input::DataReceived {
            channel,
            bytes: b"-rw-r--r-- 1 u g 10 Jan  1 12:00 a.prg\r\n".to_vec(),
        });
        line(&mut client, "226 Transfer complete");
        assert!(client.take_events().iter().all(|e| !matches!(e, FtpEvent::DirectoryListed { .. })));

        client.handle(Input::DataReceived {
            channel,
            bytes: b"drwxr-xr-x 2 u g 0 Jan  1 12:00 games\r\n".to_vec(),
        });
        client.handle(Input::DataClosed { channel });
        let events = client.take_events();
        assert_eq!(listings(&events), 1);
        let entries = events
            .iter()
            .find_map(|e| match e {
                FtpEvent::DirectoryListed { path, entries } if path == "/Usb0" => Some(entries.clone()),
                _ => None,
            })
            .expect("listing emitted");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.prg");
        assert_eq!(entries[0].size, 10);
        assert!(entries[1].is_directory);
        assert_eq!(entries[1].name, "games");
        assert_eq!(client.state(), ConnectionState::Ready);
    }

    #[test]
    fn list_completes_when_close_precedes_reply() {
        let mut client = logged_in();
        client.list("/");
        let channel = open_data(&mut client);
        line(&mut client, "150 Here comes the listing");
        client.handle(Input::DataReceived {
            channel,
            bytes: b"GAME.PRG\r\n".to_vec(),
        });
        client.handle(Input::DataClosed { channel });
        assert!(client.take_events().is_empty());

        line(&mut client, "226 Transfer complete");
        let events = client.take_events();
        assert_eq!(listings(&events), 1);
        assert!(events.contains(&FtpEvent::DirectoryListed {
            path: "/".into(),
            entries: vec![FtpEntry::file("GAME.PRG", 0)],
        }));
        assert_eq!(client.state(), ConnectionState::Ready);

        // A duplicate close after completion is ignored.
        client.handle(Input::DataClosed { channel });
        assert_eq!(listings(&client.take_events()), 0);
    }

    #[test]
    fn pasv_failure_moves_to_next_command() {
        let mut client = logged_in();
        client.list("/");
        client.make_directory("/new");
        line(&mut client, "200 Type set");
        line(&mut client, "227 Entering Passive Mode");

        let errs = errors(&client.take_events());
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].kind, FtpErrorKind::ProtocolError);
        assert_eq!(sent(&client.take_actions()), vec!["TYPE A", "PASV", "MKD /new"]);

        line(&mut client, "257 \"/new\" created");
        assert!(client
            .take_events()
            .contains(&FtpEvent::DirectoryCreated { path: "/new".into() }));
    }

    #[test]
    fn download_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("elite.prg");
        let mut client = logged_in();
        client.download("/Usb0/elite.prg", &local);
        let channel = open_data(&mut client);

        line(&mut client, "150 Opening BINARY mode data connection (6 bytes)");
        client.handle(Input::DataReceived {
            channel,
            bytes: b"abc".to_vec(),
        });
        client.handle(Input::DataReceived {
            channel,
            bytes: b"def".to_vec(),
        });
        client.handle(Input::DataClosed { channel });
        line(&mut client, "226 Transfer complete");

        let events = client.take_events();
        assert!(events.contains(&FtpEvent::DownloadProgress {
            remote_path: "/Usb0/elite.prg".into(),
            received: 6,
            total: Some(6),
        }));
        assert_eq!(finished_downloads(&events), 1);
        assert!(events.contains(&FtpEvent::DownloadFinished {
            remote_path: "/Usb0/elite.prg".into(),
            local_path: local.clone(),
        }));
        assert_eq!(std::fs::read(&local).unwrap(), b"abcdef");
    }

    #[test]
    fn download_to_file_when_reply_precedes_close() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("zork.d64");
        let mut client = logged_in();
        client.download("/Usb0/zork.d64", &local);
        let channel = open_data(&mut client);

        line(&mut client, "150 Opening BINARY mode data connection");
        client.handle(Input::DataReceived {
            channel,
            bytes: b"head".to_vec(),
        });
        line(&mut client, "226 Transfer complete");
        assert_eq!(finished_downloads(&client.take_events()), 0);
        assert_eq!(client.state(), ConnectionState::Busy);

        // Bytes still in flight after the 226 belong to the file.
        client.handle(Input::DataReceived {
            channel,
            bytes: b"tail".to_vec(),
        });
        client.handle(Input::DataClosed { channel });
        let events = client.take_events();
        assert_eq!(finished_downloads(&events), 1);
        assert!(errors(&events).is_empty());
        assert_eq!(std::fs::read(&local).unwrap(), b"headtail");
        assert_eq!(client.state(), ConnectionState::Ready);

        client.handle(Input::DataClosed { channel });
        assert_eq!(finished_downloads(&client.take_events()), 0);
    }

    #[test]
    fn failed_download_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("gone.prg");
        let mut client = logged_in();
        client.download("/gone.prg", &local);
        assert!(local.exists());
        open_data(&mut client);
        line(&mut client, "550 No such file");

        let errs = errors(&client.take_events());
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].code, Some(550));
        assert!(!local.exists());
        assert_eq!(client.state(), ConnectionState::Ready);
    }

    #[test]
    fn download_to_memory() {
        let mut client = logged_in();
        client.download_to_memory("/readme.txt");
        let channel = open_data(&mut client);
        line(&mut client, "150 Opening");
        client.handle(Input::DataReceived {
            channel,
            bytes: b"hello".to_vec(),
        });
        line(&mut client, "226 Done");
        client.handle(Input::DataClosed { channel });
        assert!(client.take_events().contains(&FtpEvent::DownloadToMemoryFinished {
            remote_path: "/readme.txt".into(),
            data: b"hello".to_vec(),
        }));
    }

    #[test]
    fn upload_streams_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("demo.prg");
        std::fs::write(&local, b"abcdefghij").unwrap();
        let mut client = logged_in();
        client.upload(&local, "/Usb0/demo.prg");
        let channel = open_data(&mut client);
        assert_eq!(sent(&client.take_actions()), vec!["STOR /Usb0/demo.prg"]);

        line(&mut client, "150 Ok to send data");
        let mut written = Vec::new();
        loop {
            let actions = client.take_actions();
            if actions.contains(&Action::CloseData { channel }) {
                break;
            }
            for a in actions {
                if let Action::WriteData { bytes, .. } = a {
                    written.extend(bytes);
                }
            }
            client.handle(Input::DataWritten { channel });
        }
        assert_eq!(written, b"abcdefghij");

        // Our own close is not reported back as a failure.
        client.handle(Input::DataClosed { channel });
        line(&mut client, "226 Transfer complete");
        let events = client.take_events();
        assert!(errors(&events).is_empty());
        assert!(events.contains(&FtpEvent::UploadProgress {
            remote_path: "/Usb0/demo.prg".into(),
            sent: 10,
            total: 10,
        }));
        assert!(events.contains(&FtpEvent::UploadFinished {
            local_path: local,
            remote_path: "/Usb0/demo.prg".into(),
        }));
    }

    #[test]
    fn upload_of_missing_file_fails_immediately() {
        let mut client = logged_in();
        client.upload(Path::new("/definitely/not/here.prg"), "/x.prg");
        assert_eq!(client.queued_commands(), 0);
        assert!(client.take_actions().is_empty());
        assert_eq!(errors(&client.take_events())[0].kind, FtpErrorKind::IoError);
    }

    #[test]
    fn abort_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("big.d64");
        let mut client = logged_in();
        client.download("/big.d64", &local);
        client.list("/");
        let channel = open_data(&mut client);
        client.take_actions();
        line(&mut client, "150 Opening");

        client.abort();
        assert_eq!(client.take_events().last(), Some(&FtpEvent::Aborted));
        let actions = client.take_actions();
        assert!(actions.contains(&Action::SendCommand("ABOR".into())));
        assert!(actions.contains(&Action::CloseData { channel }));
        assert_eq!(client.queued_commands(), 0);
        assert_eq!(client.state(), ConnectionState::Ready);
        assert!(!local.exists());

        // New work waits until the aborted replies are drained.
        client.make_directory("/after");
        assert!(sent(&client.take_actions()).is_empty());
        line(&mut client, "426 Transfer aborted");
        line(&mut client, "226 Abort successful");
        assert_eq!(sent(&client.take_actions()), vec!["MKD /after"]);
        assert!(errors(&client.take_events()).is_empty());
    }

    #[test]
    fn abort_when_disconnected_is_a_no_op() {
        let mut client = FtpClient::new(config());
        client.abort();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.take_actions().is_empty());
        assert!(client.take_events().is_empty());
    }

    #[test]
    fn control_loss_mid_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("x.prg");
        let mut client = logged_in();
        client.download("/x.prg", &local);
        let channel = open_data(&mut client);
        client.take_actions();

        client.handle(Input::ControlClosed {
            generation: client.generation,
        });
        let actions = client.take_actions();
        assert!(actions.contains(&Action::CloseData { channel }));
        assert!(actions.contains(&Action::CloseControl));
        let events = client.take_events();
        assert_eq!(errors(&events).len(), 1);
        assert!(events.contains(&FtpEvent::StateChanged {
            state: ConnectionState::Disconnected
        }));
        assert!(!local.exists());
    }

    #[test]
    fn rename_and_change_directory() {
        let mut client = logged_in();
        client.rename("/a.prg", "/b.prg");
        client.change_directory("/Usb0");
        line(&mut client, "350 Ready for RNTO");
        line(&mut client, "250 Renamed");
        line(&mut client, "250 Directory changed");
        line(&mut client, "257 \"/Usb0\"");

        assert_eq!(
            sent(&client.take_actions()),
            vec!["RNFR /a.prg", "RNTO /b.prg", "CWD /Usb0", "PWD"]
        );
        let events = client.take_events();
        assert!(events.contains(&FtpEvent::FileRenamed {
            from: "/a.prg".into(),
            to: "/b.prg".into(),
        }));
        assert!(events.contains(&FtpEvent::DirectoryChanged { path: "/Usb0".into() }));
    }

    #[test]
    fn rejected_command_keeps_session() {
        let mut client = logged_in();
        client.remove("/locked.prg");
        client.remove_directory("/empty");
        line(&mut client, "550 Permission denied");
        line(&mut client, "250 Removed");

        let events = client.take_events();
        assert_eq!(errors(&events).len(), 1);
        assert!(events.contains(&FtpEvent::DirectoryRemoved { path: "/empty".into() }));
        assert!(client.is_logged_in());
    }
}
