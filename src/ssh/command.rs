//! Command dispatch
//!
//! [`CommandDispatcher`] runs the one-shot operations: a single command on an
//! exec channel, a script fed to an interactive shell, a live stdin/stdout
//! relay into a shell, and SFTP file transfers. Every operation opens its own
//! [`SessionHandle`] and closes it on every path.

use std::path::Path;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::descriptor::{file_name, remote_join, ConnectionDescriptor, Location};
use super::poll::{Poll, Wake};
use super::sanitize::{in_directory, quote_for_shell, sanitize_command};
use super::session::{SessionConnector, SessionHandle, UNKNOWN_EXIT_STATUS};
use super::transport::ChannelKind;
use crate::error::{RemoteError, Result};

/// Size of the chunks relayed from local input into an attached shell
const RELAY_CHUNK_SIZE: usize = 4096;

/// Exit status and output of a finished remote task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExitOutcome {
    /// Remote exit status (`-1` when the remote never reported one)
    pub exit_status: i32,

    /// Captured task output
    pub output: String,
}

impl ExitOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            exit_status: 0,
            output: output.into(),
        }
    }

    /// Outcome carried by an execution failure, if `error` is one
    pub fn from_error(error: &RemoteError) -> Option<Self> {
        match error {
            RemoteError::ExecutionFailed {
                exit_status,
                output,
                ..
            } => Some(Self {
                exit_status: *exit_status,
                output: output.clone(),
            }),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_status == 0
    }
}

/// Runs one-shot remote operations
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    connector: SessionConnector,
}

impl CommandDispatcher {
    pub fn new(connector: SessionConnector) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> &SessionConnector {
        &self.connector
    }

    /// Run `command` on an exec channel and return its trimmed stdout
    ///
    /// The command runs inside the descriptor's working directory, if any.
    /// A non-zero exit status fails with the command's stderr as task output.
    pub async fn exec(&self, descriptor: &ConnectionDescriptor, command: &str) -> Result<String> {
        let command = sanitize_command(command)?;
        let command = match descriptor.working_dir() {
            Some(dir) => in_directory(dir, &command),
            None => command,
        };

        info!("Executing on {}: {}", descriptor, command);
        let mut handle = SessionHandle::open(&self.connector, ChannelKind::Exec, descriptor).await?;
        let result = exec_on(&mut handle, &command).await;
        handle.close().await;
        result
    }

    /// Feed `script` to an interactive shell and copy its output into `sink`
    pub async fn run_shell<W>(
        &self,
        descriptor: &ConnectionDescriptor,
        script: &str,
        sink: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        info!("Running shell script on {}", descriptor);
        let mut handle = SessionHandle::open(&self.connector, ChannelKind::Shell, descriptor).await?;
        let result = shell_on(&mut handle, descriptor.working_dir(), script, sink).await;
        handle.close().await;
        result
    }

    /// Like [`CommandDispatcher::run_shell`], collecting the output in memory
    ///
    /// The output of a failed shell is logged before the error is returned.
    pub async fn shell(&self, descriptor: &ConnectionDescriptor, script: &str) -> Result<String> {
        let mut output = Vec::new();
        let result = self.run_shell(descriptor, script, &mut output).await;
        let output = String::from_utf8_lossy(&output).into_owned();
        match result {
            Ok(()) => Ok(output),
            Err(e) => {
                warn!("Shell on {} failed: {}\n{}", descriptor, e, output);
                Err(e)
            }
        }
    }

    /// Relay `input` into an interactive shell and its output into `output`
    ///
    /// End of `input` is forwarded to the remote; the relay ends when the
    /// remote closes the channel or the connector's token is cancelled.
    pub async fn attach<R, W>(
        &self,
        descriptor: &ConnectionDescriptor,
        input: &mut R,
        output: &mut W,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        info!("Attaching to shell on {}", descriptor);
        let mut handle = SessionHandle::open(&self.connector, ChannelKind::Shell, descriptor).await?;
        let result = relay(&mut handle, input, output).await;
        handle.close().await;
        result
    }

    /// Copy a file between a `file:` location and a remote one
    ///
    /// Returns the number of bytes copied.
    pub async fn transfer(&self, from: &str, to: &str) -> Result<u64> {
        match (Location::parse(from)?, Location::parse(to)?) {
            (Location::Local(source), Location::Remote(target)) => {
                self.upload(&source, &target).await
            }
            (Location::Remote(source), Location::Local(target)) => {
                self.download(&source, &target).await
            }
            _ => Err(RemoteError::invalid_argument(format!(
                "transfer needs one file: and one remote location, got {} and {}",
                mask_location(from),
                mask_location(to)
            ))),
        }
    }

    /// Upload `source` into the directory named by `target`'s path
    pub async fn upload(&self, source: &Path, target: &ConnectionDescriptor) -> Result<u64> {
        let name = file_name(source)?;
        let dir = target.working_dir().unwrap_or_default().to_string();
        let mut file = tokio::fs::File::open(source)
            .await
            .map_err(|source| RemoteError::Upload {
                uri: target.masked(),
                source,
            })?;

        info!("Uploading {} to {}", source.display(), target);
        let mut handle = SessionHandle::open(&self.connector, ChannelKind::Sftp, target).await?;
        let result = upload_on(&mut handle, &dir, &name, &mut file).await;
        handle.close().await;

        if let Ok(size) = &result {
            info!("Uploaded {} bytes to {}", size, target);
        }
        result
    }

    /// Download the file named by `source`'s path into the local directory `target`
    pub async fn download(&self, source: &ConnectionDescriptor, target: &Path) -> Result<u64> {
        let (dir, name) = source.split_file().ok_or_else(|| {
            RemoteError::invalid_argument(format!("{} does not name a remote file", source))
        })?;
        let local = target.join(&name);

        info!("Downloading {} to {}", source, local.display());
        let mut handle = SessionHandle::open(&self.connector, ChannelKind::Sftp, source).await?;
        let result = download_on(&mut handle, &dir, &name, &local).await;
        handle.close().await;

        if let Ok(size) = &result {
            info!("Downloaded {} bytes from {}", size, source);
        }
        result
    }
}

fn mask_location(uri: &str) -> String {
    Location::parse(uri)
        .map(|location| location.to_string())
        .unwrap_or_else(|_| "an invalid location".to_string())
}

async fn exec_on(handle: &mut SessionHandle, command: &str) -> Result<String> {
    handle.set_command(command)?;
    let stdout = handle.input_stream()?;
    let stderr = handle.error_stream()?;

    handle.execute().await?;

    let output = stdout.read_to_string();
    let errors = stderr.read_to_string();
    if !errors.is_empty() {
        debug!("stderr from {}: {}", handle.masked_uri(), errors.trim_end());
    }
    if interrupted_before_status(handle) {
        info!("Command on {} interrupted", handle.masked_uri());
        return Ok(output.trim().to_string());
    }
    handle.assert_exit_status(&errors).await?;
    Ok(output.trim().to_string())
}

async fn shell_on<W>(
    handle: &mut SessionHandle,
    working_dir: Option<&str>,
    script: &str,
    sink: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut streams = handle.channel_streams()?;
    if let Some(dir) = working_dir {
        streams.write_line(&format!("cd {}", quote_for_shell(dir)))?;
    }
    streams.write_line(script)?;
    streams.write_line("exit")?;

    handle.execute().await?;

    let output = streams.read_channel(false).await;
    sink.write_all(output.as_bytes()).await?;
    sink.flush().await?;
    if interrupted_before_status(handle) {
        info!("Shell on {} interrupted", handle.masked_uri());
        return Ok(());
    }
    handle.assert_exit_status(&output).await
}

/// A cancelled wait that ended before the remote reported how it exited
fn interrupted_before_status(handle: &SessionHandle) -> bool {
    handle.is_interrupted() && handle.exit_status() == UNKNOWN_EXIT_STATUS
}

async fn relay<R, W>(handle: &mut SessionHandle, input: &mut R, output: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let reader = handle.input_stream()?;
    let writer = handle.output_stream()?;
    handle.start().await?;

    let poll = Poll::new(handle.config().channel_check_interval, handle.cancel_token());
    let mut chunk = vec![0u8; RELAY_CHUNK_SIZE];
    let mut input_open = true;

    loop {
        let closed = reader.is_closed();
        let remote_output = reader.read_to_end();
        if !remote_output.is_empty() {
            output.write_all(&remote_output).await?;
            output.flush().await?;
        }
        if closed {
            break;
        }

        tokio::select! {
            read = input.read(&mut chunk), if input_open => {
                let n = read?;
                let sent = if n == 0 {
                    input_open = false;
                    writer.send_eof()
                } else {
                    writer.write(&chunk[..n])
                };
                if let Err(e) = sent {
                    debug!("Shell on {} stopped accepting input: {}", handle.masked_uri(), e);
                    input_open = false;
                }
            }
            wake = poll.sleep() => {
                if wake == Wake::Interrupted {
                    info!("Relay to {} interrupted", handle.masked_uri());
                    return Ok(());
                }
            }
        }
    }

    handle.assert_exit_status("").await
}

async fn upload_on(
    handle: &mut SessionHandle,
    dir: &str,
    name: &str,
    source: &mut tokio::fs::File,
) -> Result<u64> {
    handle.start().await?;
    handle.upload(dir, name, source).await
}

async fn download_on(
    handle: &mut SessionHandle,
    dir: &str,
    name: &str,
    local: &Path,
) -> Result<u64> {
    handle.start().await?;
    let mut file = tokio::fs::File::create(local)
        .await
        .map_err(|source| RemoteError::Download {
            uri: handle.masked_uri().to_string(),
            source,
        })?;
    handle
        .download(&remote_join(dir, name), &mut file)
        .await
}
