//! Sessions and channels
//!
//! [`SessionConnector`] turns a descriptor into an authenticated session,
//! [`ChannelFactory`] opens configured channels on it, and [`SessionHandle`]
//! owns one session/channel pair for the duration of a single operation.
//!
//! A handle must be released on every path. Callers `close()` it explicitly
//! (success or error); `Drop` releases leftovers on a detached task and logs a
//! warning, which covers panics and cancelled futures.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::credentials::CredentialResolver;
use super::descriptor::ConnectionDescriptor;
use super::poll::{Poll, Wake};
use super::streams::ChannelStreams;
use super::transport::{
    ChannelKind, ChannelReader, ChannelWriter, RemoteChannel, RemoteSession, RemoteTransport,
    SessionRequest, TerminalGeometry,
};
use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result};

/// Exit status reported when the remote never sent one
pub const UNKNOWN_EXIT_STATUS: i32 = -1;

/// Opens authenticated sessions for descriptors
#[derive(Clone)]
pub struct SessionConnector {
    transport: Arc<dyn RemoteTransport>,
    config: Arc<RemoteConfig>,
    cancel: CancellationToken,
}

impl SessionConnector {
    pub fn new(transport: Arc<dyn RemoteTransport>, config: Arc<RemoteConfig>) -> Self {
        Self {
            transport,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Share a cancellation token with every handle opened through this connector
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &Arc<RemoteConfig> {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resolve credentials and open a session within the connect timeout
    pub async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Box<dyn RemoteSession>> {
        let resolver = CredentialResolver::new(&self.config);
        let credential = resolver.resolve(descriptor)?;

        let request = SessionRequest {
            host: descriptor.host().to_string(),
            port: descriptor.port_or(self.config.default_port),
            user: descriptor.user().to_string(),
            credential,
            host_keys: resolver.host_key_policy(),
        };

        info!("Opening session for {}", descriptor);
        let connect_timeout = self.config.connect_timeout;
        match tokio::time::timeout(connect_timeout, self.transport.open_session(request)).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => Err(RemoteError::SessionInstantiation {
                uri: descriptor.masked(),
                reason: format!("{:#}", e),
            }),
            Err(_) => Err(RemoteError::SessionInstantiation {
                uri: descriptor.masked(),
                reason: format!("Connection timeout after {}ms", connect_timeout.as_millis()),
            }),
        }
    }
}

impl std::fmt::Debug for SessionConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConnector")
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Opens channels of a given kind with the configured terminal settings
#[derive(Debug, Clone, Copy)]
pub struct ChannelFactory<'a> {
    config: &'a RemoteConfig,
}

impl<'a> ChannelFactory<'a> {
    pub fn new(config: &'a RemoteConfig) -> Self {
        Self { config }
    }

    /// Pseudo-terminal parameters from the configuration
    pub fn terminal_geometry(&self) -> TerminalGeometry {
        TerminalGeometry {
            term: self.config.terminal_type.clone(),
            cols: self.config.terminal_cols,
            rows: self.config.terminal_rows,
            width_px: self.config.terminal_width_px,
            height_px: self.config.terminal_height_px,
        }
    }

    /// Open a channel; shell channels always get a pseudo-terminal
    pub async fn open_channel(
        &self,
        session: &mut dyn RemoteSession,
        kind: ChannelKind,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn RemoteChannel>> {
        self.open(session, kind, descriptor, kind == ChannelKind::Shell)
            .await
    }

    /// Open a channel with a pseudo-terminal regardless of its kind
    pub async fn open_channel_with_pty(
        &self,
        session: &mut dyn RemoteSession,
        kind: ChannelKind,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn RemoteChannel>> {
        self.open(session, kind, descriptor, true).await
    }

    async fn open(
        &self,
        session: &mut dyn RemoteSession,
        kind: ChannelKind,
        descriptor: &ConnectionDescriptor,
        pty: bool,
    ) -> Result<Box<dyn RemoteChannel>> {
        let mut channel = session
            .open_channel(kind)
            .await
            .map_err(|e| RemoteError::ChannelInstantiation {
                kind,
                uri: descriptor.masked(),
                reason: format!("{:#}", e),
            })?;

        if pty {
            channel.set_pty(Some(self.terminal_geometry()));
        }
        debug!("Opened {} channel for {} (pty: {})", kind, descriptor, pty);
        Ok(channel)
    }
}

/// One session and one channel, released together exactly once
pub struct SessionHandle {
    kind: ChannelKind,
    masked_uri: String,
    config: Arc<RemoteConfig>,
    cancel: CancellationToken,
    session: Option<Box<dyn RemoteSession>>,
    channel: Option<Box<dyn RemoteChannel>>,
    // status seen when the channel was released
    released_status: Option<u32>,
}

impl SessionHandle {
    /// Connect and open a channel of `kind`
    pub async fn open(
        connector: &SessionConnector,
        kind: ChannelKind,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Self> {
        Self::open_inner(connector, kind, descriptor, false).await
    }

    /// Like [`SessionHandle::open`], with a pseudo-terminal on any channel kind
    pub async fn open_with_pty(
        connector: &SessionConnector,
        kind: ChannelKind,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Self> {
        Self::open_inner(connector, kind, descriptor, true).await
    }

    async fn open_inner(
        connector: &SessionConnector,
        kind: ChannelKind,
        descriptor: &ConnectionDescriptor,
        pty: bool,
    ) -> Result<Self> {
        let mut session = connector.connect(descriptor).await?;

        let factory = ChannelFactory::new(connector.config());
        let opened = if pty {
            factory
                .open_channel_with_pty(session.as_mut(), kind, descriptor)
                .await
        } else {
            factory.open_channel(session.as_mut(), kind, descriptor).await
        };

        let channel = match opened {
            Ok(channel) => channel,
            Err(e) => {
                session.disconnect().await;
                return Err(e);
            }
        };

        Ok(Self {
            kind,
            masked_uri: descriptor.masked(),
            config: connector.config().clone(),
            cancel: connector.cancel_token().clone(),
            session: Some(session),
            channel: Some(channel),
            released_status: None,
        })
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Connection identity without the secret
    pub fn masked_uri(&self) -> &str {
        &self.masked_uri
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether a wait on this handle was cut short by cancellation
    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether both handles have been released
    pub fn is_released(&self) -> bool {
        self.session.is_none() && self.channel.is_none()
    }

    fn channel(&self) -> Result<&dyn RemoteChannel> {
        self.channel
            .as_deref()
            .ok_or_else(|| RemoteError::stream(format!("session for {} is closed", self.masked_uri)))
    }

    fn channel_mut(&mut self) -> Result<&mut (dyn RemoteChannel + 'static)> {
        match self.channel.as_deref_mut() {
            Some(channel) => Ok(channel),
            None => Err(RemoteError::stream(format!(
                "session for {} is closed",
                self.masked_uri
            ))),
        }
    }

    /// Command run by an exec channel; must be set before `start`/`execute`
    pub fn set_command(&mut self, command: &str) -> Result<()> {
        debug!("Command for {}: {}", self.masked_uri, command);
        self.channel_mut()?.set_command(command);
        Ok(())
    }

    /// Connect the channel without waiting for it to finish
    pub async fn start(&mut self) -> Result<()> {
        let kind = self.kind;
        let uri = self.masked_uri.clone();
        self.channel_mut()?
            .connect()
            .await
            .map_err(|e| RemoteError::ChannelInstantiation {
                kind,
                uri,
                reason: format!("{:#}", e),
            })?;
        debug!("Started {} channel for {}", kind, self.masked_uri);
        Ok(())
    }

    /// Connect the channel and wait until the remote signals end of output
    pub async fn execute(&mut self) -> Result<()> {
        self.start().await?;

        let poll = Poll::new(self.config.completion_check_interval, &self.cancel);
        loop {
            if self.channel()?.is_eof() {
                break;
            }
            if poll.sleep().await == Wake::Interrupted {
                info!("Execution on {} interrupted", self.masked_uri);
                break;
            }
        }
        Ok(())
    }

    /// Exit status reported by the remote, or [`UNKNOWN_EXIT_STATUS`]
    ///
    /// Still available after the handle has been released.
    pub fn exit_status(&self) -> i32 {
        self.channel
            .as_ref()
            .and_then(|channel| channel.exit_status())
            .or(self.released_status)
            .map(|status| i32::try_from(status).unwrap_or(i32::MAX))
            .unwrap_or(UNKNOWN_EXIT_STATUS)
    }

    /// Fail with [`RemoteError::ExecutionFailed`] unless the task exited with 0
    ///
    /// The status may trail end-of-file on the wire, so an open channel
    /// without a status is given the close-wait budget to report one.
    pub async fn assert_exit_status(&mut self, output: &str) -> Result<()> {
        self.await_exit_status().await;

        let exit_status = self.exit_status();
        if exit_status != 0 {
            warn!("Exit status {} for {}", exit_status, self.masked_uri);
            return Err(RemoteError::ExecutionFailed {
                exit_status,
                masked_uri: self.masked_uri.clone(),
                output: output.to_string(),
            });
        }
        Ok(())
    }

    async fn await_exit_status(&self) {
        let Some(channel) = self.channel.as_deref() else {
            return;
        };
        let poll = Poll::new(self.config.disconnect_check_interval, &self.cancel)
            .with_max_wait(Some(self.close_wait_budget()));
        while channel.exit_status().is_none() && !channel.is_closed() {
            if poll.sleep().await != Wake::Ready {
                break;
            }
        }
        // the status frame can arrive together with the close
        if channel.exit_status().is_none() && channel.is_closed() {
            debug!("No exit status reported for {}", self.masked_uri);
        }
    }

    fn close_wait_budget(&self) -> Duration {
        self.config
            .disconnect_check_interval
            .saturating_mul(self.config.disconnect_check_attempts)
    }

    /// Release channel and session, optionally waiting for the channel to close first
    pub async fn disconnect(&mut self, wait_for_close: bool) {
        if wait_for_close {
            if let Some(channel) = self.channel.as_deref() {
                let poll = Poll::new(self.config.disconnect_check_interval, &self.cancel);
                let mut attempts = self.config.disconnect_check_attempts;
                while !channel.is_closed() && attempts > 0 {
                    attempts -= 1;
                    if poll.sleep().await == Wake::Interrupted {
                        break;
                    }
                }
                if !channel.is_closed() {
                    debug!("Channel for {} still open, forcing disconnect", self.masked_uri);
                }
            }
        }
        self.release().await;
    }

    /// Release without waiting
    pub async fn close(&mut self) {
        self.disconnect(false).await;
    }

    async fn release(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.disconnect().await;
            self.released_status = channel.exit_status();
        }
        if let Some(mut session) = self.session.take() {
            session.disconnect().await;
            debug!("Released session for {}", self.masked_uri);
        }
    }

    pub fn input_stream(&mut self) -> Result<ChannelReader> {
        let uri = self.masked_uri.clone();
        self.channel_mut()?
            .input_stream()
            .map_err(|e| RemoteError::stream(format!("input stream for {}: {}", uri, e)))
    }

    pub fn error_stream(&mut self) -> Result<ChannelReader> {
        let uri = self.masked_uri.clone();
        self.channel_mut()?
            .error_stream()
            .map_err(|e| RemoteError::stream(format!("error stream for {}: {}", uri, e)))
    }

    pub fn output_stream(&mut self) -> Result<ChannelWriter> {
        let uri = self.masked_uri.clone();
        self.channel_mut()?
            .output_stream()
            .map_err(|e| RemoteError::stream(format!("output stream for {}: {}", uri, e)))
    }

    /// Interactive driver over this handle's stdout and stdin
    pub fn channel_streams(&mut self) -> Result<ChannelStreams> {
        let reader = self.input_stream()?;
        let writer = self.output_stream()?;
        Ok(ChannelStreams::new(
            reader,
            writer,
            self.config.channel_buffer_size,
            self.config.channel_check_interval,
            self.cancel.clone(),
        ))
    }

    /// Copy `source` to `<dir>/<name>` over this handle's SFTP channel
    pub async fn upload(
        &mut self,
        dir: &str,
        name: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64> {
        let uri = self.masked_uri.clone();
        self.channel_mut()?
            .upload(dir, name, source)
            .await
            .map_err(|source| RemoteError::Upload { uri, source })
    }

    /// Copy remote `path` into `sink` over this handle's SFTP channel
    pub async fn download(
        &mut self,
        path: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let uri = self.masked_uri.clone();
        self.channel_mut()?
            .download(path, sink)
            .await
            .map_err(|source| RemoteError::Download { uri, source })
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("kind", &self.kind)
            .field("uri", &self.masked_uri)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.is_released() {
            return;
        }

        warn!("Session for {} was not closed, releasing it", self.masked_uri);
        let mut channel = self.channel.take();
        let mut session = self.session.take();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Some(channel) = channel.as_mut() {
                        channel.disconnect().await;
                    }
                    if let Some(session) = session.as_mut() {
                        session.disconnect().await;
                    }
                });
            }
            Err(_) => warn!("No runtime to release session for {}", self.masked_uri),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::mock::{MockRemote, MockTransport};

    fn connector(remote: &MockRemote) -> SessionConnector {
        let config = RemoteConfig::default()
            .with_poll_interval(Duration::from_millis(5))
            .with_disconnect_wait(20, Duration::from_millis(5));
        SessionConnector::new(Arc::new(MockTransport::new(remote.clone())), Arc::new(config))
    }

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor::parse("remote-shell://alice:pw@host/home/alice").unwrap()
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let remote = MockRemote::new().with_connect_delay(Duration::from_millis(200));
        let connector = SessionConnector::new(
            Arc::new(MockTransport::new(remote.clone())),
            Arc::new(RemoteConfig::default().with_connect_timeout(Duration::from_millis(20))),
        );

        let err = connector.connect(&descriptor()).await.err().unwrap();
        match err {
            RemoteError::SessionInstantiation { uri, reason } => {
                assert_eq!(uri, "remote-shell://alice@host/home/alice");
                assert!(reason.contains("timeout"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_login() {
        let remote = MockRemote::new().with_password("other");
        let err = connector(&remote).connect(&descriptor()).await.err().unwrap();
        assert!(matches!(err, RemoteError::SessionInstantiation { .. }));
        assert!(!err.to_string().contains(":pw@"));
    }

    #[tokio::test]
    async fn test_channel_failure_disconnects_session() {
        let remote = MockRemote::new().refusing(ChannelKind::Sftp);
        let err = SessionHandle::open(&connector(&remote), ChannelKind::Sftp, &descriptor())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RemoteError::ChannelInstantiation { kind: ChannelKind::Sftp, .. }
        ));
        assert_eq!(remote.sessions_opened(), 1);
        assert_eq!(remote.sessions_released(), 1);
    }

    #[tokio::test]
    async fn test_shell_channel_gets_pty() {
        let remote = MockRemote::new();
        let mut handle = SessionHandle::open(&connector(&remote), ChannelKind::Shell, &descriptor())
            .await
            .unwrap();
        handle.close().await;

        let geometry = remote.last_pty().unwrap();
        assert_eq!(geometry.term, "ansi");
        assert_eq!((geometry.cols, geometry.rows), (132, 24));
        assert_eq!((geometry.width_px, geometry.height_px), (924, 216));
    }

    #[tokio::test]
    async fn test_execute_and_exit_status() {
        let remote = MockRemote::new().on_exec("true", "", 0);
        let mut handle = SessionHandle::open(&connector(&remote), ChannelKind::Exec, &descriptor())
            .await
            .unwrap();
        handle.set_command("true").unwrap();
        handle.execute().await.unwrap();
        handle.assert_exit_status("").await.unwrap();
        assert_eq!(handle.exit_status(), 0);
        handle.close().await;
    }

    #[tokio::test]
    async fn test_missing_exit_status_is_failure() {
        let remote = MockRemote::new().on_exec_without_status("kill -9 $$", "");
        let mut handle = SessionHandle::open(&connector(&remote), ChannelKind::Exec, &descriptor())
            .await
            .unwrap();
        handle.set_command("kill -9 $$").unwrap();
        handle.execute().await.unwrap();

        let err = handle.assert_exit_status("").await.unwrap_err();
        assert_eq!(err.exit_status(), Some(UNKNOWN_EXIT_STATUS));
        handle.close().await;
    }

    #[tokio::test]
    async fn test_double_close_is_harmless() {
        let remote = MockRemote::new();
        let mut handle = SessionHandle::open(&connector(&remote), ChannelKind::Shell, &descriptor())
            .await
            .unwrap();
        handle.close().await;
        handle.close().await;
        handle.disconnect(true).await;

        assert!(handle.is_released());
        assert_eq!(remote.sessions_released(), 1);
        assert_eq!(remote.channels_released(), 1);
        assert!(matches!(
            handle.input_stream(),
            Err(RemoteError::StreamAcquisition(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_releases_unclosed_handle() {
        let remote = MockRemote::new();
        let handle = SessionHandle::open(&connector(&remote), ChannelKind::Shell, &descriptor())
            .await
            .unwrap();
        drop(handle);

        for _ in 0..100 {
            if remote.sessions_released() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(remote.sessions_released(), 1);
        assert_eq!(remote.channels_released(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_waits_for_close() {
        let remote = MockRemote::new().on_exec("sleep 0", "", 0);
        let mut handle = SessionHandle::open(&connector(&remote), ChannelKind::Exec, &descriptor())
            .await
            .unwrap();
        handle.set_command("sleep 0").unwrap();
        handle.execute().await.unwrap();

        let started = std::time::Instant::now();
        handle.disconnect(true).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(handle.is_released());
    }
}
