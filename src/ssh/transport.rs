//! Transport seam
//!
//! The session/channel driver only talks to SSH through the traits in this
//! module. [`super::connection`] implements them on top of `russh`; the test
//! suite implements them with a scripted in-memory remote.
//!
//! Channel output is collected into a [`ChannelBuffer`] shared between the
//! transport (producer) and [`ChannelReader`]s (consumers), so reads never
//! block on the wire. Writes are queued through a [`ChannelWriter`].

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// Kind of channel opened on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Runs one command
    Exec,
    /// Interactive login shell on a pseudo-terminal
    Shell,
    /// SFTP subsystem
    Sftp,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Exec => "exec",
            ChannelKind::Shell => "shell",
            ChannelKind::Sftp => "sftp",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pseudo-terminal request parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalGeometry {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
    pub width_px: u32,
    pub height_px: u32,
}

/// Credential used to authenticate a session
#[derive(Clone)]
pub enum Credential {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(***)"),
            Credential::KeyFile { path, passphrase } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .field("has_passphrase", &passphrase.is_some())
                .finish(),
        }
    }
}

/// How the server's host key is verified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept any host key
    AcceptAny,
    /// Check against a known_hosts file
    KnownHosts {
        path: PathBuf,
        /// Reject hosts that are not listed (otherwise only changed keys are rejected)
        strict: bool,
    },
}

/// Everything the transport needs to open an authenticated session
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credential: Credential,
    pub host_keys: HostKeyPolicy,
}

/// Opens authenticated sessions
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn open_session(&self, request: SessionRequest) -> anyhow::Result<Box<dyn RemoteSession>>;
}

/// An authenticated connection; only used to open channels
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Open a channel of the given kind, initialized but not connected
    async fn open_channel(&mut self, kind: ChannelKind) -> anyhow::Result<Box<dyn RemoteChannel>>;

    /// Disconnect the session; must be idempotent
    async fn disconnect(&mut self);
}

/// One logical stream on a session
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Command run by an exec channel on connect
    fn set_command(&mut self, command: &str);

    /// Request a pseudo-terminal on connect
    fn set_pty(&mut self, geometry: Option<TerminalGeometry>);

    /// Issue the channel's request (exec/shell/subsystem) and start its I/O
    async fn connect(&mut self) -> anyhow::Result<()>;

    /// Close the channel; must be idempotent
    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    fn is_closed(&self) -> bool;

    fn is_eof(&self) -> bool;

    /// Exit status, once the remote has reported it
    fn exit_status(&self) -> Option<u32>;

    /// Reader over the remote's stdout
    fn input_stream(&mut self) -> std::io::Result<ChannelReader>;

    /// Reader over the remote's stderr
    fn error_stream(&mut self) -> std::io::Result<ChannelReader>;

    /// Writer feeding the remote's stdin
    fn output_stream(&mut self) -> std::io::Result<ChannelWriter>;

    /// Copy `source` into `<dir>/<name>` (SFTP channels only)
    async fn upload(
        &mut self,
        dir: &str,
        name: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> std::io::Result<u64> {
        let _ = (dir, name, source);
        Err(not_sftp(self.kind()))
    }

    /// Copy remote `path` into `sink` (SFTP channels only)
    async fn download(
        &mut self,
        path: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> std::io::Result<u64> {
        let _ = (path, sink);
        Err(not_sftp(self.kind()))
    }
}

fn not_sftp(kind: ChannelKind) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("file transfer requires an sftp channel, not {}", kind),
    )
}

#[derive(Debug, Default)]
struct ChannelState {
    stdout: VecDeque<u8>,
    stderr: VecDeque<u8>,
    eof: bool,
    closed: bool,
    exit_status: Option<u32>,
}

/// Output and status of a channel, shared between transport and readers
#[derive(Debug, Clone, Default)]
pub struct ChannelBuffer {
    state: Arc<Mutex<ChannelState>>,
}

/// Which remote stream a reader consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

impl ChannelBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        // every critical section leaves the state consistent
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push_stdout(&self, data: &[u8]) {
        self.lock().stdout.extend(data);
    }

    pub fn push_stderr(&self, data: &[u8]) {
        self.lock().stderr.extend(data);
    }

    pub fn set_exit_status(&self, status: u32) {
        self.lock().exit_status = Some(status);
    }

    pub fn mark_eof(&self) {
        self.lock().eof = true;
    }

    /// Closed implies end-of-file
    pub fn mark_closed(&self) {
        let mut state = self.lock();
        state.eof = true;
        state.closed = true;
    }

    pub fn is_eof(&self) -> bool {
        self.lock().eof
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn exit_status(&self) -> Option<u32> {
        self.lock().exit_status
    }

    pub fn reader(&self, source: StreamSource) -> ChannelReader {
        ChannelReader {
            buffer: self.clone(),
            source,
        }
    }

    fn available(&self, source: StreamSource) -> usize {
        let state = self.lock();
        match source {
            StreamSource::Stdout => state.stdout.len(),
            StreamSource::Stderr => state.stderr.len(),
        }
    }

    fn read(&self, source: StreamSource, buf: &mut [u8]) -> usize {
        let mut state = self.lock();
        let queue = match source {
            StreamSource::Stdout => &mut state.stdout,
            StreamSource::Stderr => &mut state.stderr,
        };
        let n = buf.len().min(queue.len());
        for (slot, byte) in buf.iter_mut().zip(queue.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

/// Non-blocking reader over one remote output stream
#[derive(Debug, Clone)]
pub struct ChannelReader {
    buffer: ChannelBuffer,
    source: StreamSource,
}

impl ChannelReader {
    /// Number of bytes that can be read without waiting
    pub fn available(&self) -> usize {
        self.buffer.available(self.source)
    }

    /// Read up to `buf.len()` available bytes; returns 0 when none are ready
    pub fn read(&self, buf: &mut [u8]) -> usize {
        self.buffer.read(self.source, buf)
    }

    /// Drain everything currently buffered
    pub fn read_to_end(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.available()];
        let n = self.read(&mut out);
        out.truncate(n);
        out
    }

    /// Drain everything currently buffered as (lossy) UTF-8 text
    pub fn read_to_string(&self) -> String {
        String::from_utf8_lossy(&self.read_to_end()).into_owned()
    }

    pub fn is_eof(&self) -> bool {
        self.buffer.is_eof()
    }

    pub fn is_closed(&self) -> bool {
        self.buffer.is_closed()
    }
}

/// Requests queued for the transport's writer side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelWrite {
    Data(Vec<u8>),
    Eof,
}

/// Writer feeding a channel's stdin
///
/// Writes are handed to the transport immediately; there is no buffering
/// across calls, so `flush` only reports whether the channel still accepts data.
#[derive(Debug, Clone)]
pub struct ChannelWriter {
    tx: mpsc::UnboundedSender<ChannelWrite>,
}

impl ChannelWriter {
    /// Create a writer and the receiving end the transport drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ChannelWrite>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn write(&self, data: &[u8]) -> std::io::Result<()> {
        self.send(ChannelWrite::Data(data.to_vec()))
    }

    pub fn flush(&self) -> std::io::Result<()> {
        if self.tx.is_closed() {
            return Err(broken_pipe());
        }
        Ok(())
    }

    /// Signal end of input to the remote
    pub fn send_eof(&self) -> std::io::Result<()> {
        self.send(ChannelWrite::Eof)
    }

    fn send(&self, request: ChannelWrite) -> std::io::Result<()> {
        self.tx.send(request).map_err(|_| broken_pipe())
    }
}

fn broken_pipe() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "channel is no longer writable")
}
