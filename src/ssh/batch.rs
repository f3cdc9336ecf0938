//! Sudo batch driver
//!
//! Runs a batch command as another user by driving `sudo` over an exec
//! channel with a pseudo-terminal. The conversation is matched on shell
//! prompts of the form `<user>@<host>:`.

use std::fmt;

use tracing::{debug, info};

use super::command::CommandDispatcher;
use super::descriptor::ConnectionDescriptor;
use super::sanitize::{quote_for_shell, sanitize_command};
use super::session::{SessionConnector, SessionHandle};
use super::streams::{ChannelStreams, PromptOutcome};
use super::transport::ChannelKind;
use crate::error::Result;

/// A batch command and how to reach it
#[derive(Clone)]
pub struct BatchRequest {
    pub user: String,
    pub password: String,
    pub host: String,
    /// Escalation command such as `sudo su - admin`; `None` runs as `user`
    pub sudo_command: Option<String>,
    pub batch_dir: String,
    pub batch_command: String,
}

impl BatchRequest {
    /// Descriptor for the login user, optionally rooted in the batch directory
    ///
    /// An empty batch directory leaves the descriptor without a path.
    pub fn descriptor(&self, with_dir: bool) -> ConnectionDescriptor {
        let descriptor =
            ConnectionDescriptor::new(&self.user, &self.host).with_secret(&self.password);
        if with_dir && !self.batch_dir.trim().is_empty() {
            descriptor.with_working_dir(self.batch_dir.trim())
        } else {
            descriptor
        }
    }

    /// Prompt of the login user: `<lowercased user>@<host>:`
    pub fn user_prompt(&self) -> String {
        format!("{}@{}:", self.user.to_lowercase(), self.host)
    }

    /// Prompt of the escalated user: `<last word of sudo command>@<host>:`
    pub fn sudo_prompt(&self) -> Option<String> {
        let sudo = self.sudo_command.as_deref()?;
        let target = sudo.split_whitespace().last()?;
        Some(format!("{}@{}:", target, self.host))
    }
}

impl fmt::Debug for BatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRequest")
            .field("user", &self.user)
            .field("password", &"***")
            .field("host", &self.host)
            .field("sudo_command", &self.sudo_command)
            .field("batch_dir", &self.batch_dir)
            .field("batch_command", &self.batch_command)
            .finish()
    }
}

/// What the driver does once the escalated prompt shows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalatedStep {
    ChangeDirectory,
    BatchCommand,
    ExitUser,
}

/// Progress of a sudo batch conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStage {
    Connected,
    AwaitPasswordPrompt,
    PasswordSent,
    AwaitEscalatedPrompt(EscalatedStep),
    OutputCaptured,
    AwaitBasePrompt,
    PtyExiting,
    Disconnected,
    StatusChecked,
}

impl fmt::Display for BatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStage::AwaitEscalatedPrompt(step) => write!(f, "AwaitEscalatedPrompt({:?})", step),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Runs batch commands, escalating with sudo when requested
#[derive(Debug, Clone)]
pub struct SudoBatchDriver {
    connector: SessionConnector,
}

impl SudoBatchDriver {
    pub fn new(connector: SessionConnector) -> Self {
        Self { connector }
    }

    /// Run the batch command and return its output
    ///
    /// With a sudo command the output is the text printed between the
    /// command line and the next escalated prompt. Without one the request
    /// is a plain exec inside the batch directory.
    pub async fn execute_batch(&self, request: &BatchRequest) -> Result<String> {
        sanitize_command(&request.batch_command)?;

        let (sudo, sudo_prompt) = match (request.sudo_command.as_deref(), request.sudo_prompt()) {
            (Some(sudo), Some(prompt)) => (sudo, prompt),
            _ => {
                info!("No sudo command, running batch as {}", request.user);
                return CommandDispatcher::new(self.connector.clone())
                    .exec(&request.descriptor(true), &request.batch_command)
                    .await;
            }
        };

        let descriptor = request.descriptor(false);
        info!("Running batch on {} via '{}'", descriptor, sudo);
        let mut handle =
            SessionHandle::open_with_pty(&self.connector, ChannelKind::Exec, &descriptor).await?;
        let result = self.converse(&mut handle, request, sudo, &sudo_prompt).await;
        handle.close().await;
        result
    }

    async fn converse(
        &self,
        handle: &mut SessionHandle,
        request: &BatchRequest,
        sudo: &str,
        sudo_prompt: &str,
    ) -> Result<String> {
        let prompt_wait = Some(self.connector.config().prompt_wait);
        let uri = handle.masked_uri().to_string();
        let stage = |next: BatchStage| debug!("Batch on {}: {}", uri, next);

        handle.set_command(sudo)?;
        let mut streams = handle.channel_streams()?;
        handle.start().await?;
        stage(BatchStage::Connected);

        stage(BatchStage::AwaitPasswordPrompt);
        if !streams.wait_for_input().await {
            debug!("No password prompt from {}", uri);
        }
        send(&mut streams, &request.password)?;
        stage(BatchStage::PasswordSent);

        stage(BatchStage::AwaitEscalatedPrompt(EscalatedStep::ChangeDirectory));
        note(&uri, streams.wait_for_prompt(sudo_prompt, prompt_wait).await);
        send(&mut streams, &format!("cd {}", quote_for_shell(&request.batch_dir)))?;

        stage(BatchStage::AwaitEscalatedPrompt(EscalatedStep::BatchCommand));
        note(&uri, streams.wait_for_prompt(sudo_prompt, prompt_wait).await);
        send(&mut streams, &request.batch_command)?;

        let captured = streams.wait_for_prompt(sudo_prompt, None).await;
        let interrupted = matches!(captured, PromptOutcome::Interrupted(_));
        let output = strip_trailing_prompt(captured.text(), sudo_prompt);
        stage(BatchStage::OutputCaptured);

        if interrupted {
            info!("Batch on {} interrupted", uri);
            handle.disconnect(false).await;
            return Ok(output);
        }

        stage(BatchStage::AwaitEscalatedPrompt(EscalatedStep::ExitUser));
        send(&mut streams, "exit")?;

        stage(BatchStage::AwaitBasePrompt);
        if !streams.is_closed() {
            note(&uri, streams.wait_for_prompt(&request.user_prompt(), prompt_wait).await);
        }

        stage(BatchStage::PtyExiting);
        send(&mut streams, "exit")?;

        handle.disconnect(true).await;
        stage(BatchStage::Disconnected);

        handle.assert_exit_status(&output).await?;
        stage(BatchStage::StatusChecked);
        Ok(output)
    }
}

/// Write a line unless the remote has already closed the channel
fn send(streams: &mut ChannelStreams, line: &str) -> Result<()> {
    if streams.is_closed() {
        debug!("Channel closed, not sending further input");
        return Ok(());
    }
    match streams.write_line(line) {
        Err(e) if streams.is_closed() => {
            debug!("Channel closed while sending input: {}", e);
            Ok(())
        }
        other => other,
    }
}

fn note(uri: &str, outcome: PromptOutcome) {
    if !outcome.is_matched() {
        debug!("Prompt wait on {} ended without a match: {:?}", uri, outcome);
    }
}

/// Cut `text` at the last occurrence of `prompt`
fn strip_trailing_prompt(text: &str, prompt: &str) -> String {
    match text.rfind(prompt) {
        Some(index) => text[..index].to_string(),
        None => text.to_string(),
    }
}
