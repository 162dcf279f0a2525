//! TCP transport and the connection driver task.
//!
//! One driver task owns the [`FtpClient`] state machine, the control
//! writer and the data-socket tasks. Socket activity comes back as
//! [`Input`]s over an internal channel, so the client is only ever touched
//! from that single task.

use crate::ftp::client::{Action, FtpClient, Input};
use crate::ftp::error::FtpError;
use crate::ftp::protocol::{ControlReader, ControlWriter};
use crate::ftp::queue::FtpOperations;
use crate::ftp::transfer::DataChannelId;
use crate::ftp::types::*;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Requests accepted by the driver.
#[derive(Debug, Clone)]
pub enum FtpRequest {
    SetHost { host: String, port: u16 },
    SetCredentials { username: String, password: String },
    Connect,
    Disconnect,
    Abort,
    List(String),
    ChangeDirectory(String),
    MakeDirectory(String),
    RemoveDirectory(String),
    Download { remote_path: String, local_path: PathBuf },
    DownloadToMemory(String),
    Upload { local_path: PathBuf, remote_path: String },
    Remove(String),
    Rename { from: String, to: String },
}

/// Messages from socket tasks back to the driver.
enum DriverInput {
    Client(Input),
    ControlOpened { generation: u64, stream: TcpStream },
}

enum DataCommand {
    Write(Vec<u8>),
    Close,
}

struct DataSocket {
    commands: mpsc::UnboundedSender<DataCommand>,
    task: JoinHandle<()>,
}

// ─── Handle ──────────────────────────────────────────────────────────

/// Cloneable front end of a running connection.
#[derive(Clone)]
pub struct FtpHandle {
    requests: mpsc::UnboundedSender<FtpRequest>,
    state: watch::Receiver<ConnectionState>,
}

impl FtpHandle {
    pub fn send(&self, request: FtpRequest) {
        if self.requests.send(request).is_err() {
            log::warn!("FTP driver has stopped; request dropped");
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn set_host(&self, host: impl Into<String>, port: u16) {
        self.send(FtpRequest::SetHost {
            host: host.into(),
            port,
        });
    }

    pub fn set_credentials(&self, username: impl Into<String>, password: impl Into<String>) {
        self.send(FtpRequest::SetCredentials {
            username: username.into(),
            password: password.into(),
        });
    }

    pub fn connect_to_host(&self) {
        self.send(FtpRequest::Connect);
    }

    pub fn disconnect(&self) {
        self.send(FtpRequest::Disconnect);
    }

    pub fn change_directory(&self, path: &str) {
        self.send(FtpRequest::ChangeDirectory(path.to_string()));
    }

    pub fn download_to_memory(&self, remote_path: &str) {
        self.send(FtpRequest::DownloadToMemory(remote_path.to_string()));
    }

    pub fn rename(&self, from: &str, to: &str) {
        self.send(FtpRequest::Rename {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
}

impl FtpOperations for FtpHandle {
    fn is_logged_in(&self) -> bool {
        self.state().is_logged_in()
    }

    fn list(&mut self, path: &str) {
        self.send(FtpRequest::List(path.to_string()));
    }

    fn make_directory(&mut self, path: &str) {
        self.send(FtpRequest::MakeDirectory(path.to_string()));
    }

    fn remove_directory(&mut self, path: &str) {
        self.send(FtpRequest::RemoveDirectory(path.to_string()));
    }

    fn download(&mut self, remote_path: &str, local_path: &Path) {
        self.send(FtpRequest::Download {
            remote_path: remote_path.to_string(),
            local_path: local_path.to_path_buf(),
        });
    }

    fn upload(&mut self, local_path: &Path, remote_path: &str) {
        self.send(FtpRequest::Upload {
            local_path: local_path.to_path_buf(),
            remote_path: remote_path.to_string(),
        });
    }

    fn remove(&mut self, path: &str) {
        self.send(FtpRequest::Remove(path.to_string()));
    }

    fn abort(&mut self) {
        self.send(FtpRequest::Abort);
    }
}

// ─── Driver ──────────────────────────────────────────────────────────

pub struct FtpConnection {
    client: FtpClient,
    inputs_tx: mpsc::UnboundedSender<DriverInput>,
    events_tx: mpsc::UnboundedSender<FtpEvent>,
    state_tx: watch::Sender<ConnectionState>,
    control_generation: u64,
    connect_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    writer: Option<ControlWriter>,
    data: HashMap<DataChannelId, DataSocket>,
}

impl FtpConnection {
    /// Start the driver task. Dropping every handle stops it.
    pub fn spawn(config: FtpConnectionConfig) -> (FtpHandle, mpsc::UnboundedReceiver<FtpEvent>) {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let driver = FtpConnection {
            client: FtpClient::new(config),
            inputs_tx,
            events_tx,
            state_tx,
            control_generation: 0,
            connect_task: None,
            reader_task: None,
            writer: None,
            data: HashMap::new(),
        };
        tokio::spawn(driver.run(requests_rx, inputs_rx));

        let handle = FtpHandle {
            requests: requests_tx,
            state: state_rx,
        };
        (handle, events_rx)
    }

    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<FtpRequest>,
        mut inputs: mpsc::UnboundedReceiver<DriverInput>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(input) = inputs.recv() => self.on_input(input),
                request = requests.recv() => match request {
                    Some(request) => self.on_request(request),
                    None => break,
                },
            }
            self.flush().await;
        }

        log::debug!("FTP driver stopping");
        self.client.disconnect();
        self.flush().await;
    }

    fn on_request(&mut self, request: FtpRequest) {
        let c = &mut self.client;
        match request {
            FtpRequest::SetHost { host, port } => c.set_host(host, port),
            FtpRequest::SetCredentials { username, password } => c.set_credentials(username, password),
            FtpRequest::Connect => c.connect_to_host(),
            FtpRequest::Disconnect => c.disconnect(),
            FtpRequest::Abort => c.abort(),
            FtpRequest::List(path) => c.list(&path),
            FtpRequest::ChangeDirectory(path) => c.change_directory(&path),
            FtpRequest::MakeDirectory(path) => c.make_directory(&path),
            FtpRequest::RemoveDirectory(path) => c.remove_directory(&path),
            FtpRequest::Download {
                remote_path,
                local_path,
            } => c.download(&remote_path, &local_path),
            FtpRequest::DownloadToMemory(path) => c.download_to_memory(&path),
            FtpRequest::Upload {
                local_path,
                remote_path,
            } => c.upload(&local_path, &remote_path),
            FtpRequest::Remove(path) => c.remove(&path),
            FtpRequest::Rename { from, to } => c.rename(&from, &to),
        }
    }

    fn on_input(&mut self, input: DriverInput) {
        match input {
            DriverInput::Client(input) => self.client.handle(input),
            DriverInput::ControlOpened { generation, stream } => {
                if generation != self.control_generation {
                    log::debug!("Dropping stale control connection #{}", generation);
                    return;
                }
                self.connect_task = None;
                let peer = match stream.peer_addr() {
                    Ok(addr) => addr.ip(),
                    Err(e) => {
                        self.client.handle(Input::ControlConnectFailed {
                            generation,
                            error: FtpError::connection_failed(format!("No peer address: {}", e)),
                        });
                        return;
                    }
                };
                stream.set_nodelay(true).ok();
                let (rd, wr) = stream.into_split();
                self.writer = Some(ControlWriter::new(wr));
                self.reader_task = Some(tokio::spawn(read_control(
                    generation,
                    ControlReader::new(rd),
                    self.inputs_tx.clone(),
                )));
                self.client.handle(Input::ControlConnected { generation, peer });
            }
        }
    }

    /// Publish events and carry out actions until the client is quiet.
    async fn flush(&mut self) {
        loop {
            for event in self.client.take_events() {
                if let FtpEvent::StateChanged { state } = &event {
                    self.state_tx.send_replace(*state);
                }
                if self.events_tx.send(event).is_err() {
                    log::debug!("FTP event receiver dropped");
                }
            }
            let actions = self.client.take_actions();
            if actions.is_empty() {
                break;
            }
            for action in actions {
                self.execute(action).await;
            }
        }
    }

    async fn execute(&mut self, action: Action) {
        match action {
            Action::OpenControl {
                generation,
                host,
                port,
                timeout,
            } => {
                self.control_generation = generation;
                let inputs = self.inputs_tx.clone();
                self.connect_task = Some(tokio::spawn(open_control(generation, host, port, timeout, inputs)));
            }
            Action::SendCommand(line) => {
                let result = match self.writer.as_mut() {
                    Some(w) => w.send_command(&line).await,
                    None => Err(FtpError::not_connected("Control connection is not open")),
                };
                if let Err(error) = result {
                    self.client.handle(Input::ControlError {
                        generation: self.control_generation,
                        error,
                    });
                }
            }
            Action::CloseControl => {
                self.control_generation = 0;
                if let Some(task) = self.connect_task.take() {
                    task.abort();
                }
                if let Some(task) = self.reader_task.take() {
                    task.abort();
                }
                if let Some(mut writer) = self.writer.take() {
                    writer.shutdown().await;
                }
                for (_, socket) in self.data.drain() {
                    socket.task.abort();
                }
            }
            Action::OpenData {
                channel,
                addr,
                timeout,
            } => {
                let (tx, rx) = mpsc::unbounded_channel();
                let chunk_size = self.client.config().chunk_size;
                let task = tokio::spawn(run_data_channel(
                    channel,
                    addr,
                    timeout,
                    chunk_size,
                    rx,
                    self.inputs_tx.clone(),
                ));
                self.data.insert(channel, DataSocket { commands: tx, task });
            }
            Action::WriteData { channel, bytes } => {
                if let Some(socket) = self.data.get(&channel) {
                    let _ = socket.commands.send(DataCommand::Write(bytes));
                }
            }
            Action::CloseData { channel } => {
                if let Some(socket) = self.data.remove(&channel) {
                    if socket.commands.send(DataCommand::Close).is_err() {
                        socket.task.abort();
                    }
                }
            }
        }
    }
}

// ─── Socket tasks ────────────────────────────────────────────────────

async fn open_control(
    generation: u64,
    host: String,
    port: u16,
    dur: Duration,
    inputs: mpsc::UnboundedSender<DriverInput>,
) {
    let addr = format!("{}:{}", host, port);
    let message = match timeout(dur, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => DriverInput::ControlOpened { generation, stream },
        Ok(Err(e)) => DriverInput::Client(Input::ControlConnectFailed {
            generation,
            error: FtpError::connection_failed(format!("TCP connect to {}: {}", addr, e)),
        }),
        Err(_) => DriverInput::Client(Input::ControlConnectFailed {
            generation,
            error: FtpError::timeout(format!("TCP connect to {} timed out", addr)),
        }),
    };
    let _ = inputs.send(message);
}

async fn read_control(
    generation: u64,
    mut reader: ControlReader,
    inputs: mpsc::UnboundedSender<DriverInput>,
) {
    loop {
        let input = match reader.read_line().await {
            Ok(Some(line)) => Input::ControlLine { generation, line },
            Ok(None) => {
                let _ = inputs.send(DriverInput::Client(Input::ControlClosed { generation }));
                return;
            }
            Err(error) => {
                let _ = inputs.send(DriverInput::Client(Input::ControlError { generation, error }));
                return;
            }
        };
        if inputs.send(DriverInput::Client(input)).is_err() {
            return;
        }
    }
}

async fn run_data_channel(
    channel: DataChannelId,
    addr: SocketAddr,
    dur: Duration,
    chunk_size: usize,
    mut commands: mpsc::UnboundedReceiver<DataCommand>,
    inputs: mpsc::UnboundedSender<DriverInput>,
) {
    let send = |input: Input| {
        let _ = inputs.send(DriverInput::Client(input));
    };

    let stream = match timeout(dur, TcpStream::connect(addr)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            send(Input::DataError {
                channel,
                error: FtpError::data_channel(format!("Data connect to {}: {}", addr, e)),
            });
            return;
        }
        Err(_) => {
            send(Input::DataError {
                channel,
                error: FtpError::timeout(format!("Data connect to {} timed out", addr)),
            });
            return;
        }
    };
    send(Input::DataConnected { channel });

    let (mut rd, mut wr) = stream.into_split();
    let mut buf = vec![0u8; chunk_size.max(512)];
    loop {
        tokio::select! {
            read = rd.read(&mut buf) => match read {
                Ok(0) => {
                    send(Input::DataClosed { channel });
                    return;
                }
                Ok(n) => send(Input::DataReceived { channel, bytes: buf[..n].to_vec() }),
                Err(e) => {
                    send(Input::DataError { channel, error: e.into() });
                    return;
                }
            },
            command = commands.recv() => match command {
                Some(DataCommand::Write(bytes)) => match wr.write_all(&bytes).await {
                    Ok(()) => send(Input::DataWritten { channel }),
                    Err(e) => {
                        send(Input::DataError { channel, error: e.into() });
                        return;
                    }
                },
                Some(DataCommand::Close) | None => {
                    let _ = wr.shutdown().await;
                    return;
                }
            },
        }
    }
}
