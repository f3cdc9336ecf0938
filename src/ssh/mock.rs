//! Scripted in-memory remote for tests
//!
//! [`MockRemote`] plays the server side: it authenticates sessions, runs exec
//! commands through a tiny command interpreter, drives interactive terminals
//! (including a `sudo su - <user>` escalation) and keeps an in-memory file
//! system for SFTP. [`MockTransport`] plugs it into the transport seam.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use super::descriptor::remote_join;
use super::transport::{
    ChannelBuffer, ChannelKind, ChannelReader, ChannelWrite, ChannelWriter, Credential,
    RemoteChannel, RemoteSession, RemoteTransport, SessionRequest, StreamSource,
    TerminalGeometry,
};

/// Scripted result of one command
#[derive(Debug, Clone, Default)]
struct Reply {
    stdout: String,
    stderr: String,
    status: Option<i32>,
}

impl Reply {
    fn status(status: i32) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct RemoteState {
    password: Option<String>,
    connect_delay: Option<Duration>,
    refused: HashSet<ChannelKind>,
    replies: HashMap<String, Reply>,
    files: HashMap<String, Vec<u8>>,
    connect_attempts: usize,
    sessions_opened: usize,
    sessions_released: usize,
    channels_released: usize,
    last_pty: Option<TerminalGeometry>,
    commands: Vec<String>,
    lines: Vec<String>,
}

/// Server side of the scripted remote
#[derive(Debug, Clone, Default)]
pub struct MockRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap()
    }

    /// Only accept this password (key files are always accepted)
    pub fn with_password(self, password: &str) -> Self {
        self.lock().password = Some(password.to_string());
        self
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.lock().connect_delay = Some(delay);
        self
    }

    /// Reject channels of `kind`
    pub fn refusing(self, kind: ChannelKind) -> Self {
        self.lock().refused.insert(kind);
        self
    }

    /// Script the stdout and exit status of a command
    pub fn on_exec(self, command: &str, stdout: &str, status: i32) -> Self {
        self.lock().replies.insert(
            command.to_string(),
            Reply {
                stdout: stdout.to_string(),
                status: Some(status),
                ..Reply::default()
            },
        );
        self
    }

    /// Script a command that fails with output on stderr
    pub fn on_exec_failing(self, command: &str, stderr: &str, status: i32) -> Self {
        self.lock().replies.insert(
            command.to_string(),
            Reply {
                stderr: stderr.to_string(),
                status: Some(status),
                ..Reply::default()
            },
        );
        self
    }

    /// Script a command whose channel closes without an exit status
    pub fn on_exec_without_status(self, command: &str, stdout: &str) -> Self {
        self.lock().replies.insert(
            command.to_string(),
            Reply {
                stdout: stdout.to_string(),
                ..Reply::default()
            },
        );
        self
    }

    pub fn with_file(self, path: &str, content: &[u8]) -> Self {
        self.lock().files.insert(path.to_string(), content.to_vec());
        self
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn sessions_opened(&self) -> usize {
        self.lock().sessions_opened
    }

    pub fn sessions_released(&self) -> usize {
        self.lock().sessions_released
    }

    pub fn channels_released(&self) -> usize {
        self.lock().channels_released
    }

    pub fn last_pty(&self) -> Option<TerminalGeometry> {
        self.lock().last_pty.clone()
    }

    /// Commands received by exec channels
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Lines typed into interactive terminals
    pub fn lines(&self) -> Vec<String> {
        self.lock().lines.clone()
    }
}

/// Transport that connects to a [`MockRemote`]
#[derive(Debug, Clone)]
pub struct MockTransport {
    remote: MockRemote,
}

impl MockTransport {
    pub fn new(remote: MockRemote) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl RemoteTransport for MockTransport {
    async fn open_session(&self, request: SessionRequest) -> anyhow::Result<Box<dyn RemoteSession>> {
        let (delay, password) = {
            let mut state = self.remote.lock();
            state.connect_attempts += 1;
            (state.connect_delay, state.password.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let (Some(expected), Credential::Password(given)) = (&password, &request.credential) {
            if expected != given {
                bail!("Password authentication rejected");
            }
        }

        self.remote.lock().sessions_opened += 1;
        Ok(Box::new(MockSession {
            remote: self.remote.clone(),
            request,
            released: false,
        }))
    }
}

struct MockSession {
    remote: MockRemote,
    request: SessionRequest,
    released: bool,
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn open_channel(&mut self, kind: ChannelKind) -> anyhow::Result<Box<dyn RemoteChannel>> {
        if self.released {
            bail!("session is disconnected");
        }
        if self.remote.lock().refused.contains(&kind) {
            return Err(anyhow!("{} channel request refused", kind));
        }
        Ok(Box::new(MockChannel::new(
            kind,
            self.remote.clone(),
            &self.request,
        )))
    }

    async fn disconnect(&mut self) {
        if !self.released {
            self.released = true;
            self.remote.lock().sessions_released += 1;
        }
    }
}

struct MockChannel {
    kind: ChannelKind,
    remote: MockRemote,
    user: String,
    host: String,
    command: Option<String>,
    pty: Option<TerminalGeometry>,
    buffer: ChannelBuffer,
    writer: ChannelWriter,
    requests: Option<UnboundedReceiver<ChannelWrite>>,
    terminal: Option<JoinHandle<()>>,
    connected: bool,
    released: bool,
}

impl MockChannel {
    fn new(kind: ChannelKind, remote: MockRemote, request: &SessionRequest) -> Self {
        let (writer, requests) = ChannelWriter::channel();
        Self {
            kind,
            remote,
            user: request.user.clone(),
            host: request.host.clone(),
            command: None,
            pty: None,
            buffer: ChannelBuffer::new(),
            writer,
            requests: Some(requests),
            terminal: None,
            connected: false,
            released: false,
        }
    }

    fn terminal(&self) -> Terminal {
        let state = self.remote.lock();
        Terminal {
            remote: self.remote.clone(),
            buffer: self.buffer.clone(),
            host: self.host.clone(),
            login: self.user.clone(),
            password: state.password.clone(),
            frames: Vec::new(),
            escalating_to: None,
            last_status: 0,
            echo: self.pty.is_some(),
        }
    }

    fn run_exec(&self, command: &str) {
        self.remote.lock().commands.push(command.to_string());
        let replies = self.remote.lock().replies.clone();

        let mut cwd = format!("/home/{}", self.user);
        let mut status = Some(0);
        for part in command.split(" && ") {
            if let Some(dir) = part.strip_prefix("cd ") {
                cwd = dir.trim_matches('\'').to_string();
                continue;
            }
            let reply = interpret(part, &cwd, &replies);
            self.buffer.push_stdout(reply.stdout.as_bytes());
            self.buffer.push_stderr(reply.stderr.as_bytes());
            status = reply.status;
            if status != Some(0) {
                break;
            }
        }

        if let Some(status) = status {
            self.buffer.set_exit_status(status as u32);
        }
        self.buffer.mark_eof();
        self.buffer.mark_closed();
    }
}

#[async_trait]
impl RemoteChannel for MockChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn set_command(&mut self, command: &str) {
        self.command = Some(command.to_string());
    }

    fn set_pty(&mut self, geometry: Option<TerminalGeometry>) {
        self.remote.lock().last_pty = geometry.clone();
        self.pty = geometry;
    }

    async fn connect(&mut self) -> anyhow::Result<()> {
        if self.connected {
            bail!("{} channel already connected", self.kind);
        }
        self.connected = true;

        match self.kind {
            ChannelKind::Sftp => Ok(()),
            ChannelKind::Exec => {
                let command = self
                    .command
                    .clone()
                    .ok_or_else(|| anyhow!("exec channel has no command"))?;
                match command.strip_prefix("sudo su - ") {
                    Some(target) if self.pty.is_some() => {
                        let mut terminal = self.terminal();
                        terminal.escalate(target.trim());
                        self.spawn_terminal(terminal);
                    }
                    _ => self.run_exec(&command),
                }
                Ok(())
            }
            ChannelKind::Shell => {
                let mut terminal = self.terminal();
                let login = terminal.login.clone();
                terminal.enter(&login);
                self.spawn_terminal(terminal);
                Ok(())
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(terminal) = self.terminal.take() {
            terminal.abort();
        }
        self.buffer.mark_closed();
        if !self.released {
            self.released = true;
            self.remote.lock().channels_released += 1;
        }
    }

    fn is_connected(&self) -> bool {
        self.connected && !self.released
    }

    fn is_closed(&self) -> bool {
        self.buffer.is_closed()
    }

    fn is_eof(&self) -> bool {
        self.buffer.is_eof()
    }

    fn exit_status(&self) -> Option<u32> {
        self.buffer.exit_status()
    }

    fn input_stream(&mut self) -> std::io::Result<ChannelReader> {
        Ok(self.buffer.reader(StreamSource::Stdout))
    }

    fn error_stream(&mut self) -> std::io::Result<ChannelReader> {
        Ok(self.buffer.reader(StreamSource::Stderr))
    }

    fn output_stream(&mut self) -> std::io::Result<ChannelWriter> {
        Ok(self.writer.clone())
    }

    async fn upload(
        &mut self,
        dir: &str,
        name: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> std::io::Result<u64> {
        if self.kind != ChannelKind::Sftp {
            return Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "not sftp"));
        }
        let mut content = Vec::new();
        source.read_to_end(&mut content).await?;
        let size = content.len() as u64;
        self.remote.lock().files.insert(remote_join(dir, name), content);
        Ok(size)
    }

    async fn download(
        &mut self,
        path: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> std::io::Result<u64> {
        if self.kind != ChannelKind::Sftp {
            return Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "not sftp"));
        }
        let content = self.remote.file(path).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("no such file: {}", path))
        })?;
        sink.write_all(&content).await?;
        sink.flush().await?;
        Ok(content.len() as u64)
    }
}

impl MockChannel {
    fn spawn_terminal(&mut self, terminal: Terminal) {
        if let Some(requests) = self.requests.take() {
            self.terminal = Some(tokio::spawn(terminal.run(requests)));
        }
    }
}

/// Commands the exec interpreter understands without a script
fn interpret(command: &str, cwd: &str, replies: &HashMap<String, Reply>) -> Reply {
    let command = command.trim();
    if let Some(reply) = replies.get(command) {
        return reply.clone();
    }

    let (program, args) = command.split_once(' ').unwrap_or((command, ""));
    match program {
        "echo" => Reply {
            stdout: format!("{}\n", args),
            status: Some(0),
            ..Reply::default()
        },
        "pwd" => Reply {
            stdout: format!("{}\n", cwd),
            status: Some(0),
            ..Reply::default()
        },
        "true" | "" => Reply::status(0),
        "false" => Reply::status(1),
        "exit" => Reply::status(args.trim().parse().unwrap_or(0)),
        _ => Reply {
            stderr: format!("sh: {}: command not found\n", program),
            status: Some(127),
            ..Reply::default()
        },
    }
}

struct Frame {
    user: String,
    cwd: String,
}

/// Interactive terminal: a stack of login shells fed line by line
struct Terminal {
    remote: MockRemote,
    buffer: ChannelBuffer,
    host: String,
    login: String,
    password: Option<String>,
    frames: Vec<Frame>,
    escalating_to: Option<String>,
    last_status: i32,
    echo: bool,
}

impl Terminal {
    fn output(&self, text: &str) {
        let text = if self.echo {
            text.replace('\n', "\r\n")
        } else {
            text.to_string()
        };
        self.buffer.push_stdout(text.as_bytes());
    }

    fn prompt(&self) {
        if let Some(frame) = self.frames.last() {
            self.buffer
                .push_stdout(format!("{}@{}:{}$ ", frame.user, self.host, frame.cwd).as_bytes());
        }
    }

    fn enter(&mut self, user: &str) {
        self.frames.push(Frame {
            user: user.to_string(),
            cwd: "~".to_string(),
        });
        self.prompt();
    }

    fn escalate(&mut self, target: &str) {
        self.escalating_to = Some(target.to_string());
        let asking = self
            .frames
            .last()
            .map(|frame| frame.user.clone())
            .unwrap_or_else(|| self.login.clone());
        self.buffer
            .push_stdout(format!("[sudo] password for {}: ", asking).as_bytes());
    }

    fn close(&mut self, status: i32) {
        self.buffer.set_exit_status(status as u32);
        self.buffer.mark_closed();
    }

    /// Handle one input line; returns false once the terminal has closed
    fn line(&mut self, line: &str) -> bool {
        self.remote.lock().lines.push(line.to_string());

        if let Some(target) = self.escalating_to.take() {
            let accepted = self.password.as_deref().is_none_or(|expected| expected == line);
            if !accepted {
                self.output("\nsudo: 1 incorrect password attempt\n");
                self.last_status = 1;
                if self.frames.is_empty() {
                    self.close(1);
                    return false;
                }
                self.prompt();
                return true;
            }
            self.output("\n");
            self.enter(&target);
            return true;
        }

        if self.echo {
            self.output(&format!("{}\n", line));
        }

        let trimmed = line.trim();
        let (program, args) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
        match program {
            "exit" => {
                let status = args.trim().parse().unwrap_or(self.last_status);
                self.frames.pop();
                self.output("logout\n");
                if self.frames.is_empty() {
                    self.close(status);
                    return false;
                }
                self.last_status = status;
                self.prompt();
            }
            "cd" => {
                if let Some(frame) = self.frames.last_mut() {
                    frame.cwd = args.trim().to_string();
                }
                self.last_status = 0;
                self.prompt();
            }
            "sudo" if args.starts_with("su - ") => {
                let target = args.trim_start_matches("su - ").trim().to_string();
                self.escalate(&target);
            }
            _ => {
                let cwd = self
                    .frames
                    .last()
                    .map(|frame| frame.cwd.clone())
                    .unwrap_or_default();
                let replies = self.remote.lock().replies.clone();
                let reply = interpret(trimmed, &cwd, &replies);
                self.output(&reply.stdout);
                self.output(&reply.stderr);
                self.last_status = reply.status.unwrap_or(self.last_status);
                self.prompt();
            }
        }
        true
    }

    async fn run(mut self, mut requests: UnboundedReceiver<ChannelWrite>) {
        let mut pending = String::new();
        while let Some(request) = requests.recv().await {
            match request {
                ChannelWrite::Data(bytes) => {
                    pending.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(end) = pending.find('\n') {
                        let line: String = pending.drain(..=end).collect();
                        if !self.line(line.trim_end_matches(['\r', '\n'])) {
                            return;
                        }
                    }
                }
                ChannelWrite::Eof => {
                    let status = self.last_status;
                    self.close(status);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::transport::HostKeyPolicy;
    use std::path::PathBuf;

    fn request(credential: Credential) -> SessionRequest {
        SessionRequest {
            host: "host".to_string(),
            port: 22,
            user: "alice".to_string(),
            credential,
            host_keys: HostKeyPolicy::AcceptAny,
        }
    }

    #[test]
    fn test_interpret() {
        let replies = HashMap::new();
        assert_eq!(interpret("echo hi", "/", &replies).stdout, "hi\n");
        assert_eq!(interpret("exit 3", "/", &replies).status, Some(3));
        assert_eq!(interpret("nope", "/", &replies).status, Some(127));
    }

    #[tokio::test]
    async fn test_key_file_bypasses_password_check() {
        let remote = MockRemote::new().with_password("secret");
        let transport = MockTransport::new(remote.clone());
        let key = Credential::KeyFile {
            path: PathBuf::from("/keys/id_rsa"),
            passphrase: None,
        };
        assert!(transport.open_session(request(key)).await.is_ok());
        assert!(transport
            .open_session(request(Credential::Password("wrong".to_string())))
            .await
            .is_err());
        assert_eq!(remote.connect_attempts(), 2);
        assert_eq!(remote.sessions_opened(), 1);
    }
}
