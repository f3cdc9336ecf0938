//! Connection descriptors and transfer locations
//!
//! A descriptor has the form
//! `remote-shell://<user>[:<secret>]@<host>[:<port>][/<working-dir>]`.
//! The secret is percent-decoded on parse and never printed: `Display`
//! produces the masked form with the `:<secret>` segment removed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use percent_encoding::percent_decode_str;
use url::{Host, Url};

use crate::error::{RemoteError, Result};

/// Scheme for remote-session URIs
pub const REMOTE_SCHEME: &str = "remote-shell";

/// Alternate scheme accepted for remote-session URIs
pub const SSH_SCHEME: &str = "ssh";

/// Scheme for local-filesystem URIs
pub const FILE_SCHEME: &str = "file";

/// Parsed remote connection descriptor
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    scheme: String,
    user: String,
    secret: Option<String>,
    host: String,
    port: Option<u16>,
    working_dir: Option<String>,
    // path as written, for the masked form
    path: String,
}

impl ConnectionDescriptor {
    /// Create a descriptor for `user@host` with no secret, port or directory
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            scheme: REMOTE_SCHEME.to_string(),
            user: user.into(),
            secret: None,
            host: host.into(),
            port: None,
            working_dir: None,
            path: String::new(),
        }
    }

    /// Parse a descriptor string
    pub fn parse(uri: &str) -> Result<Self> {
        Self::from_url(&parse_url(uri)?)
    }

    /// Build a descriptor from an already parsed URL
    pub fn from_url(url: &Url) -> Result<Self> {
        let scheme = url.scheme();
        if scheme != REMOTE_SCHEME && scheme != SSH_SCHEME {
            return Err(RemoteError::invalid_descriptor(format!(
                "unsupported scheme '{}' (expected '{}')",
                scheme, REMOTE_SCHEME
            )));
        }

        let user = decode(url.username(), "user")?;
        if user.is_empty() {
            return Err(RemoteError::invalid_descriptor("missing '<user>@' before host"));
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(RemoteError::invalid_descriptor("host cannot be empty")),
        };

        if url.port() == Some(0) {
            return Err(RemoteError::invalid_descriptor("invalid port '0'"));
        }

        if url.query().is_some() || url.fragment().is_some() {
            return Err(RemoteError::invalid_descriptor(
                "query and fragment are not allowed",
            ));
        }

        let secret = url
            .password()
            .map(|secret| decode(secret, "secret"))
            .transpose()?;

        Ok(Self {
            scheme: scheme.to_string(),
            user,
            secret: secret.filter(|s| !s.is_empty()),
            host,
            port: url.port(),
            working_dir: normalize_dir(&decode(url.path(), "path")?),
            path: url.path().to_string(),
        })
    }

    /// Set the secret (password)
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into()).filter(|s| !s.is_empty());
        self
    }

    /// Set an explicit port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the remote working directory; an empty directory clears it
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        let dir = dir.into();
        self.working_dir = if dir.is_empty() {
            None
        } else if dir.starts_with('/') {
            normalize_dir(&dir)
        } else {
            normalize_dir(&format!("/{}", dir))
        };
        self.path = self.working_dir.clone().unwrap_or_default();
        self
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Password, if one was embedded
    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port named in the descriptor, if any
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Port to connect to, falling back to `default_port`
    pub fn port_or(&self, default_port: u16) -> u16 {
        self.port.unwrap_or(default_port)
    }

    /// Remote working directory (the decoded URI path), if any
    pub fn working_dir(&self) -> Option<&str> {
        self.working_dir.as_deref()
    }

    /// The descriptor with the secret removed; safe for logs and errors
    pub fn masked(&self) -> String {
        let mut masked = if self.host.contains(':') {
            format!("{}://{}@[{}]", self.scheme, self.user, self.host)
        } else {
            format!("{}://{}@{}", self.scheme, self.user, self.host)
        };
        if let Some(port) = self.port {
            masked.push_str(&format!(":{}", port));
        }
        masked.push_str(&self.path);
        masked
    }

    /// Split the working directory into (parent directory, file name)
    ///
    /// Used when the descriptor names a remote file rather than a directory.
    pub fn split_file(&self) -> Option<(String, String)> {
        let path = self.working_dir.as_deref()?;
        let idx = path.rfind('/')?;
        let name = &path[idx + 1..];
        if name.is_empty() {
            return None;
        }
        let dir = if idx == 0 { "/" } else { &path[..idx] };
        Some((dir.to_string(), name.to_string()))
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("uri", &self.masked())
            .field("has_secret", &self.secret.is_some())
            .finish()
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// One side of a file transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Local filesystem path (`file:` URI)
    Local(PathBuf),
    /// Remote session path
    Remote(ConnectionDescriptor),
}

impl Location {
    /// Parse a `file:` URI or a remote descriptor
    pub fn parse(uri: &str) -> Result<Self> {
        let url = parse_url(uri)?;
        if url.scheme() != FILE_SCHEME {
            return ConnectionDescriptor::from_url(&url).map(Location::Remote);
        }

        // file:///p, file://localhost/p and file:/p all name /p
        url.to_file_path().map(Location::Local).map_err(|_| {
            RemoteError::invalid_argument(format!("'{}' does not name a local file", url))
        })
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Location::Local(_))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local(path) => write!(f, "{}://{}", FILE_SCHEME, path.display()),
            Location::Remote(descriptor) => descriptor.fmt(f),
        }
    }
}

/// Join a remote directory and a file name with exactly one separator
pub fn remote_join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Base name of a local path
pub fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            RemoteError::invalid_argument(format!("'{}' does not name a file", path.display()))
        })
}

// url::ParseError never echoes its input, so the secret stays out of the message
fn parse_url(uri: &str) -> Result<Url> {
    Url::parse(uri).map_err(|e| RemoteError::invalid_descriptor(format!("unparseable URI: {}", e)))
}

fn decode(text: &str, what: &str) -> Result<String> {
    percent_decode_str(text)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| {
            RemoteError::invalid_descriptor(format!("{} is not UTF-8 after percent-decoding", what))
        })
}

/// An empty path means no working directory; trailing slashes are dropped
fn normalize_dir(path: &str) -> Option<String> {
    if path.is_empty() {
        return None;
    }
    if path.len() > 1 {
        Some(path.trim_end_matches('/').to_string()).filter(|p| !p.is_empty())
    } else {
        Some(path.to_string())
    }
}
