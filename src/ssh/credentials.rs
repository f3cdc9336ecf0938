//! Credential and host-key resolution
//!
//! A password embedded in the descriptor wins. Otherwise the configured key
//! name is tried as a path, then inside the ssh directory. There is no
//! interactive fallback: with neither, the connection attempt fails before
//! any socket is opened.
//!
//! Host keys are checked against `<ssh dir>/known_hosts` when it exists.
//! The default is relaxed checking (unknown hosts accepted, changed keys
//! rejected) so unattended runs work against fresh hosts; set
//! `strict_host_key_checking` to reject unknown hosts as well.

use std::path::PathBuf;

use tracing::debug;

use super::descriptor::ConnectionDescriptor;
use super::transport::{Credential, HostKeyPolicy};
use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result};

/// File name of the known hosts list inside the ssh directory
pub const KNOWN_HOSTS_FILE: &str = "known_hosts";

/// Resolves credentials and host-key policy for a descriptor
#[derive(Debug, Clone)]
pub struct CredentialResolver<'a> {
    config: &'a RemoteConfig,
}

impl<'a> CredentialResolver<'a> {
    pub fn new(config: &'a RemoteConfig) -> Self {
        Self { config }
    }

    /// Pick password or key file authentication
    pub fn resolve(&self, descriptor: &ConnectionDescriptor) -> Result<Credential> {
        if let Some(password) = descriptor.secret() {
            debug!("Using password authentication for {}", descriptor);
            return Ok(Credential::Password(password.to_string()));
        }

        match self.key_path() {
            Some(path) => {
                debug!("Using key file {} for {}", path.display(), descriptor);
                Ok(Credential::KeyFile {
                    path,
                    passphrase: self.config.key_passphrase.clone(),
                })
            }
            None => Err(RemoteError::CredentialsUnspecified {
                uri: descriptor.masked(),
                key_name: self.config.key_name.clone(),
            }),
        }
    }

    /// Key file named by the configuration, if it exists
    ///
    /// The name is used as-is first, then resolved inside the ssh directory.
    pub fn key_path(&self) -> Option<PathBuf> {
        let name = self.config.key_name.as_str();
        if name.is_empty() {
            return None;
        }

        let direct = PathBuf::from(name);
        if direct.is_file() {
            return Some(direct);
        }

        self.config
            .ssh_dir()
            .map(|dir| dir.join(name))
            .filter(|path| path.is_file())
    }

    /// How the server's host key will be verified
    pub fn host_key_policy(&self) -> HostKeyPolicy {
        if self.config.ignore_known_hosts {
            return HostKeyPolicy::AcceptAny;
        }

        match self
            .config
            .ssh_dir()
            .map(|dir| dir.join(KNOWN_HOSTS_FILE))
            .filter(|path| path.is_file())
        {
            Some(path) => HostKeyPolicy::KnownHosts {
                path,
                strict: self.config.strict_host_key_checking,
            },
            None => HostKeyPolicy::AcceptAny,
        }
    }
}
