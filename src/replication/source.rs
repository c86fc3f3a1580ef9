//! Replication Source URI
//!
//! A source is `[user[:password]@]host:port`. Credentials ride inside the
//! URI, so the parsed form is the only thing that may ever reach a log line
//! and it always redacts the password.

use std::fmt;
use std::str::FromStr;

use super::errors::{ReplicationError, ReplicationResult};

/// Upper bound on a configured source string, credentials included.
pub const SOURCE_MAX_LEN: usize = 1024;

/// A parsed replication source address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSource {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
}

impl ReplicaSource {
    /// Parse a source string, enforcing the length bound.
    pub fn parse(raw: &str) -> ReplicationResult<Self> {
        if raw.len() > SOURCE_MAX_LEN {
            return Err(ReplicationError::resource_exhaustion(format!(
                "replication source exceeds {} bytes",
                SOURCE_MAX_LEN
            )));
        }

        let (credentials, address) = match raw.rsplit_once('@') {
            Some((creds, addr)) => (Some(creds), addr),
            None => (None, raw),
        };

        let (username, password) = match credentials {
            None => (None, None),
            Some("") => {
                return Err(ReplicationError::config(
                    "replication source has empty credentials before '@'",
                ));
            }
            Some(creds) => match creds.split_once(':') {
                Some((user, pass)) => (Some(user.to_string()), Some(pass.to_string())),
                None => (Some(creds.to_string()), None),
            },
        };

        let (host, port) = address.rsplit_once(':').ok_or_else(|| {
            ReplicationError::config(format!(
                "replication source '{}' is missing a port",
                Redacted(raw)
            ))
        })?;

        if host.is_empty() {
            return Err(ReplicationError::config(
                "replication source has an empty host",
            ));
        }

        let port: u16 = port.parse().map_err(|_| {
            ReplicationError::config(format!("replication source has invalid port '{}'", port))
        })?;

        Ok(Self {
            host: host.to_string(),
            port,
            username,
            password,
        })
    }

    /// Host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Configured user, if any.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Configured password, if any. Never printed.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Whether credentials were supplied.
    pub fn has_credentials(&self) -> bool {
        self.username.is_some()
    }
}

/// `Display` is the redacted form; there is no unredacted formatter.
impl fmt::Display for ReplicaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.username, &self.password) {
            (Some(user), Some(_)) => write!(f, "{}:***@{}:{}", user, self.host, self.port),
            (Some(user), None) => write!(f, "{}@{}:{}", user, self.host, self.port),
            (None, _) => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

impl FromStr for ReplicaSource {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Redacts everything before '@' in a raw, unparsed source string so parse
/// errors can quote the input safely.
struct Redacted<'a>(&'a str);

impl fmt::Display for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.rsplit_once('@') {
            Some((_, addr)) => write!(f, "***@{}", addr),
            None => write!(f, "{}", self.0),
        }
    }
}
