//! russh transport
//!
//! Implements the transport seam on top of `russh`. Each connected shell or
//! exec channel is driven by one pump task that moves remote output into the
//! channel's [`ChannelBuffer`] and queued writes onto the wire, so the
//! polling side never awaits the network directly.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use russh::{Channel, ChannelMsg};
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::descriptor::remote_join;
use super::handler::SshHandler;
use super::transport::{
    ChannelBuffer, ChannelKind, ChannelReader, ChannelWrite, ChannelWriter, Credential,
    RemoteChannel, RemoteSession, RemoteTransport, SessionRequest, StreamSource,
    TerminalGeometry,
};

/// Extended data type code for stderr
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Opens sessions over TCP with `russh`
#[derive(Clone)]
pub struct RusshTransport {
    config: Arc<client::Config>,
}

impl RusshTransport {
    pub fn new() -> Self {
        Self {
            config: Arc::new(client::Config::default()),
        }
    }
}

impl Default for RusshTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RusshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusshTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl RemoteTransport for RusshTransport {
    async fn open_session(&self, request: SessionRequest) -> anyhow::Result<Box<dyn RemoteSession>> {
        info!(
            "Connecting to SSH server {}:{}...",
            request.host, request.port
        );

        let handler = SshHandler::new(&request.host, request.port, request.host_keys.clone());
        let mut handle = client::connect(
            self.config.clone(),
            (request.host.as_str(), request.port),
            handler,
        )
        .await?;

        authenticate(&mut handle, &request).await?;

        info!(
            "Successfully connected to {}@{}:{}",
            request.user, request.host, request.port
        );
        Ok(Box::new(RusshSession {
            handle: Some(handle),
        }))
    }
}

async fn authenticate(handle: &mut Handle<SshHandler>, request: &SessionRequest) -> anyhow::Result<()> {
    match &request.credential {
        Credential::Password(password) => {
            debug!("Attempting password authentication for user '{}'", request.user);
            let auth_result = handle
                .authenticate_password(&request.user, password)
                .await?;
            if !auth_result.success() {
                bail!("Password authentication rejected");
            }
        }
        Credential::KeyFile { path, passphrase } => {
            debug!(
                "Attempting key authentication for user '{}' with {}",
                request.user,
                path.display()
            );
            let key = russh::keys::load_secret_key(path, passphrase.as_deref())
                .with_context(|| format!("Failed to load private key {}", path.display()))?;
            let rsa_hash = handle.best_supported_rsa_hash().await?.flatten();
            let auth_result = handle
                .authenticate_publickey(&request.user, PrivateKeyWithHashAlg::new(Arc::new(key), rsa_hash))
                .await?;
            if !auth_result.success() {
                bail!("Key authentication rejected");
            }
        }
    }
    info!("Authentication successful for user '{}'", request.user);
    Ok(())
}

/// Authenticated `russh` connection
pub struct RusshSession {
    handle: Option<Handle<SshHandler>>,
}

impl std::fmt::Debug for RusshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusshSession")
            .field("connected", &self.handle.is_some())
            .finish()
    }
}

#[async_trait]
impl RemoteSession for RusshSession {
    async fn open_channel(&mut self, kind: ChannelKind) -> anyhow::Result<Box<dyn RemoteChannel>> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| anyhow!("SSH connection not established"))?;
        let channel = handle.channel_open_session().await?;
        debug!("Opened {} channel {}", kind, channel.id());
        Ok(Box::new(RusshChannel::new(kind, channel)))
    }

    async fn disconnect(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle
                .disconnect(russh::Disconnect::ByApplication, "", "")
                .await
            {
                debug!("Disconnect failed: {}", e);
            }
            info!("SSH connection closed");
        }
    }
}

/// One `russh` session channel
pub struct RusshChannel {
    kind: ChannelKind,
    command: Option<String>,
    pty: Option<TerminalGeometry>,
    pending: Option<Channel<client::Msg>>,
    buffer: ChannelBuffer,
    writer: ChannelWriter,
    requests: Option<UnboundedReceiver<ChannelWrite>>,
    stop: CancellationToken,
    pump: Option<JoinHandle<()>>,
    sftp: Option<SftpSession>,
    connected: bool,
}

impl RusshChannel {
    fn new(kind: ChannelKind, channel: Channel<client::Msg>) -> Self {
        let (writer, requests) = ChannelWriter::channel();
        Self {
            kind,
            command: None,
            pty: None,
            pending: Some(channel),
            buffer: ChannelBuffer::new(),
            writer,
            requests: Some(requests),
            stop: CancellationToken::new(),
            pump: None,
            sftp: None,
            connected: false,
        }
    }

    fn sftp(&self) -> std::io::Result<&SftpSession> {
        self.sftp.as_ref().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "sftp channel is not connected")
        })
    }

    fn shell_streams(&self) -> std::io::Result<()> {
        if self.kind == ChannelKind::Sftp {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "sftp channels carry no shell streams",
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for RusshChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusshChannel")
            .field("kind", &self.kind)
            .field("command", &self.command)
            .field("pty", &self.pty)
            .field("connected", &self.connected)
            .field("closed", &self.buffer.is_closed())
            .finish()
    }
}

#[async_trait]
impl RemoteChannel for RusshChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn set_command(&mut self, command: &str) {
        self.command = Some(command.to_string());
    }

    fn set_pty(&mut self, geometry: Option<TerminalGeometry>) {
        self.pty = geometry;
    }

    async fn connect(&mut self) -> anyhow::Result<()> {
        let channel = self
            .pending
            .take()
            .ok_or_else(|| anyhow!("{} channel already connected", self.kind))?;

        if let Some(pty) = &self.pty {
            channel
                .request_pty(
                    true,
                    &pty.term,
                    pty.cols,
                    pty.rows,
                    pty.width_px,
                    pty.height_px,
                    &[],
                )
                .await
                .context("Failed to request PTY")?;
            debug!("PTY requested ({} {}x{})", pty.term, pty.cols, pty.rows);
        }

        match self.kind {
            ChannelKind::Exec => {
                let command = self
                    .command
                    .as_deref()
                    .ok_or_else(|| anyhow!("exec channel has no command"))?;
                channel.exec(true, command).await.context("Failed to exec")?;
            }
            ChannelKind::Shell => {
                channel
                    .request_shell(true)
                    .await
                    .context("Failed to request shell")?;
            }
            ChannelKind::Sftp => {
                channel
                    .request_subsystem(true, "sftp")
                    .await
                    .context("Failed to request sftp subsystem")?;
                let sftp = SftpSession::new(channel.into_stream())
                    .await
                    .context("Failed to create SFTP session")?;
                self.sftp = Some(sftp);
                self.connected = true;
                return Ok(());
            }
        }

        let requests = self
            .requests
            .take()
            .ok_or_else(|| anyhow!("{} channel input already consumed", self.kind))?;
        self.pump = Some(tokio::spawn(pump(
            channel,
            self.buffer.clone(),
            requests,
            self.stop.clone(),
        )));
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.sftp = None;
        self.pending = None;
        self.stop.cancel();
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.await {
                warn!("Channel pump for {} channel ended abnormally: {}", self.kind, e);
            }
        }
        self.buffer.mark_closed();
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
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
        self.shell_streams()?;
        Ok(self.buffer.reader(StreamSource::Stdout))
    }

    fn error_stream(&mut self) -> std::io::Result<ChannelReader> {
        self.shell_streams()?;
        Ok(self.buffer.reader(StreamSource::Stderr))
    }

    fn output_stream(&mut self) -> std::io::Result<ChannelWriter> {
        self.shell_streams()?;
        Ok(self.writer.clone())
    }

    async fn upload(
        &mut self,
        dir: &str,
        name: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> std::io::Result<u64> {
        let path = remote_join(dir, name);
        debug!("[SFTP] Uploading to {}", path);
        let mut file = self.sftp()?.create(path.as_str()).await.map_err(sftp_error)?;
        let copied = tokio::io::copy(source, &mut file).await?;
        file.shutdown().await?;
        debug!("[SFTP] Wrote {} bytes to {}", copied, path);
        Ok(copied)
    }

    async fn download(
        &mut self,
        path: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> std::io::Result<u64> {
        debug!("[SFTP] Downloading {}", path);
        let mut file = self.sftp()?.open(path).await.map_err(sftp_error)?;
        let copied = tokio::io::copy(&mut file, sink).await?;
        sink.flush().await?;
        debug!("[SFTP] Read {} bytes from {}", copied, path);
        Ok(copied)
    }
}

fn sftp_error(e: russh_sftp::client::error::Error) -> std::io::Error {
    std::io::Error::other(e.to_string())
}

/// Shuttle channel traffic until the remote closes or `stop` fires
async fn pump(
    mut channel: Channel<client::Msg>,
    buffer: ChannelBuffer,
    mut requests: UnboundedReceiver<ChannelWrite>,
    stop: CancellationToken,
) {
    let mut accepting = true;
    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => buffer.push_stdout(&data),
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == SSH_EXTENDED_DATA_STDERR {
                        buffer.push_stderr(&data);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("Remote exit status {}", exit_status);
                    buffer.set_exit_status(exit_status);
                }
                Some(ChannelMsg::Eof) => buffer.mark_eof(),
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
            request = requests.recv(), if accepting => match request {
                Some(ChannelWrite::Data(bytes)) => {
                    if let Err(e) = channel.data(&bytes[..]).await {
                        warn!("Failed to write to channel: {}", e);
                        accepting = false;
                    }
                }
                Some(ChannelWrite::Eof) => {
                    if let Err(e) = channel.eof().await {
                        debug!("Failed to send EOF: {}", e);
                    }
                }
                None => accepting = false,
            },
            _ = stop.cancelled() => {
                if let Err(e) = channel.close().await {
                    debug!("Failed to close channel: {}", e);
                }
                break;
            }
        }
    }
    buffer.mark_closed();
}
