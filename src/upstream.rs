//! Upstream proxy server specifications and round-robin selection.
//!
//! A [`ServerSpec`] names one upstream HTTP proxy (destination plus an
//! ordered list of credentials); a [`RoundRobinPicker`] hands out specs
//! in strict rotation across concurrent sessions.

use crate::error::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Transport network of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

/// A host:port endpoint on a given network.
///
/// Used both for upstream proxies and for tunnel targets. Serves as the
/// HTTP/2 connection cache key, so it hashes by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub network: Network,
}

impl Destination {
    /// Creates a TCP destination.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            network: Network::Tcp,
        }
    }

    /// Creates a UDP destination.
    pub fn udp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            network: Network::Udp,
        }
    }

    /// Formats the endpoint as `host:port`, bracketing IPv6 literals.
    pub fn net_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.net_addr())
    }
}

/// Credentials for one proxy user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCredential {
    pub username: String,
    pub password: String,
    /// Policy level; level 0 is the default policy.
    pub level: u32,
}

/// One upstream proxy server: destination plus ordered credentials.
///
/// Immutable after construction; credential rotation uses an interior
/// atomic cursor.
#[derive(Debug)]
pub struct ServerSpec {
    destination: Destination,
    users: Vec<UserCredential>,
    user_cursor: AtomicUsize,
}

impl ServerSpec {
    pub fn new(destination: Destination, users: Vec<UserCredential>) -> Self {
        Self {
            destination,
            users,
            user_cursor: AtomicUsize::new(0),
        }
    }

    /// Returns the upstream destination.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Picks the next credential in rotation, or `None` if the spec
    /// carries no credentials (no `Proxy-Authorization` is emitted).
    pub fn pick_user(&self) -> Option<&UserCredential> {
        if self.users.is_empty() {
            return None;
        }
        let idx = self.user_cursor.fetch_add(1, Ordering::Relaxed) % self.users.len();
        Some(&self.users[idx])
    }
}

/// An ordered, non-empty list of upstream server specs.
#[derive(Debug)]
pub struct ServerList {
    servers: Vec<ServerSpec>,
}

impl ServerList {
    /// Builds a server list; fails with [`Error::EmptyServerList`] when
    /// no servers are given.
    pub fn new(servers: Vec<ServerSpec>) -> Result<Self> {
        if servers.is_empty() {
            return Err(Error::EmptyServerList);
        }
        Ok(Self { servers })
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    fn get(&self, idx: usize) -> &ServerSpec {
        &self.servers[idx]
    }
}

/// Thread-safe strict round-robin picker over a [`ServerList`].
#[derive(Debug, Clone)]
pub struct RoundRobinPicker {
    list: Arc<ServerList>,
    next: Arc<AtomicUsize>,
}

impl RoundRobinPicker {
    pub fn new(list: ServerList) -> Self {
        Self {
            list: Arc::new(list),
            next: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the next server in rotation.
    pub fn pick_server(&self) -> &ServerSpec {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.list.len();
        self.list.get(idx)
    }
}

/// Parses an upstream spec of the form `[user:pass@]host:port`.
///
/// IPv6 hosts use brackets: `[::1]:8080`. The credential prefix is
/// split at the last `@` so usernames may themselves contain `@`.
pub fn parse_upstream_spec(spec: &str) -> Result<ServerSpec> {
    let (auth, addr) = match spec.rfind('@') {
        Some(pos) => (Some(&spec[..pos]), &spec[pos + 1..]),
        None => (None, spec),
    };

    let users = match auth {
        Some(auth) => {
            let (username, password) = auth.split_once(':').ok_or_else(|| {
                Error::Config(format!("credentials must be user:pass in '{}'", spec))
            })?;
            vec![UserCredential {
                username: username.to_string(),
                password: password.to_string(),
                level: 0,
            }]
        }
        None => Vec::new(),
    };

    let (host, port) = parse_host_port(addr)?;
    Ok(ServerSpec::new(Destination::tcp(host, port), users))
}

/// Parses `host:port`, accepting bracketed IPv6 literals.
pub fn parse_host_port(addr: &str) -> Result<(String, u16)> {
    let colon_pos = addr
        .rfind(':')
        .ok_or_else(|| Error::Config(format!("address must include port: '{}'", addr)))?;
    let host_part = &addr[..colon_pos];
    let port_part = &addr[colon_pos + 1..];

    let host = if host_part.starts_with('[') && host_part.ends_with(']') {
        &host_part[1..host_part.len() - 1]
    } else {
        host_part
    };
    if host.is_empty() {
        return Err(Error::Config(format!("address missing host: '{}'", addr)));
    }

    let port: u16 = port_part
        .parse()
        .map_err(|_| Error::Config(format!("invalid port in address '{}'", addr)))?;

    Ok((host.to_string(), port))
}
