//! SSH client handler implementation
//!
//! Implements the `russh::client::Handler` trait to verify server host keys
//! according to a [`HostKeyPolicy`].

use tracing::{debug, warn};

use super::transport::HostKeyPolicy;

/// SSH client handler for russh
#[derive(Debug, Clone)]
pub struct SshHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl SshHandler {
    /// Create a new SSH handler for `host:port`
    pub fn new(host: impl Into<String>, port: u16, policy: HostKeyPolicy) -> Self {
        Self {
            host: host.into(),
            port,
            policy,
        }
    }

    pub fn policy(&self) -> &HostKeyPolicy {
        &self.policy
    }
}

impl russh::client::Handler for SshHandler {
    type Error = anyhow::Error;

    /// Verify the server's host key
    ///
    /// `AcceptAny` trusts every key. With a known_hosts file, a changed key is
    /// always rejected; an unlisted host is rejected only in strict mode.
    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        match &self.policy {
            HostKeyPolicy::AcceptAny => Ok(true),
            HostKeyPolicy::KnownHosts { path, strict } => {
                match russh::keys::check_known_hosts_path(
                    &self.host,
                    self.port,
                    server_public_key,
                    path,
                ) {
                    Ok(true) => {
                        debug!("Host key for {} matches {}", self.host, path.display());
                        Ok(true)
                    }
                    Ok(false) if *strict => {
                        warn!(
                            "Host {} is not listed in {} (strict checking)",
                            self.host,
                            path.display()
                        );
                        Ok(false)
                    }
                    Ok(false) => {
                        debug!("Host {} not in {}, accepting", self.host, path.display());
                        Ok(true)
                    }
                    Err(e) => {
                        warn!("Host key check failed for {}: {}", self.host, e);
                        Ok(false)
                    }
                }
            }
        }
    }
}
