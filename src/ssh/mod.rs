//! SSH session and channel lifecycle
//!
//! This module resolves credentials, opens sessions and channels, drives
//! interactive streams and runs the remote operations built on them.

pub mod batch;
pub mod command;
pub mod connection;
pub mod credentials;
pub mod descriptor;
pub mod handler;
pub mod poll;
pub mod sanitize;
pub mod session;
pub mod streams;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

// Re-exports
pub use batch::{BatchRequest, BatchStage, EscalatedStep, SudoBatchDriver};
pub use command::{CommandDispatcher, ExitOutcome};
pub use connection::{RusshChannel, RusshSession, RusshTransport};
pub use credentials::CredentialResolver;
pub use descriptor::{ConnectionDescriptor, Location};
pub use handler::SshHandler;
pub use poll::max_wait_from_millis;
pub use sanitize::{quote_for_shell, sanitize_command};
pub use session::{ChannelFactory, SessionConnector, SessionHandle};
pub use streams::{ChannelStreams, PromptOutcome};
pub use transport::{
    ChannelKind, ChannelReader, ChannelWriter, Credential, HostKeyPolicy, RemoteChannel,
    RemoteSession, RemoteTransport, SessionRequest, TerminalGeometry,
};
