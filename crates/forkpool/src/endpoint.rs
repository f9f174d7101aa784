//! Shared listening endpoint.
//!
//! There is no connection router in this crate. Every worker binds the same
//! [`Endpoint`] through [`bind_shared`], which enables address and port reuse
//! on the socket before binding. The kernel then spreads incoming connections
//! across all sockets bound to that port.
//!
//! Distribution is best-effort. On Linux, connections are hashed across the
//! listening sockets, which is close to even under many concurrent clients
//! but is neither strict round-robin nor ordered. A worker that stops
//! listening drops any connections still queued on its own socket.

use crate::error::{Error, Result};
use core::{fmt, str::FromStr};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpSocket};

/// Pending connection queue length for each worker's socket.
const LISTEN_BACKLOG: u32 = 1024;

/// A `host:port` listening address shared by every worker in the pool.
///
/// IPv6 hosts are written in brackets: `[::1]:3000`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Resolves the endpoint to the first socket address the host maps to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEndpoint`] if the host does not resolve.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| self.invalid(e.to_string()))?;
        addrs
            .next()
            .ok_or_else(|| self.invalid("host resolved to no addresses"))
    }

    fn invalid(&self, reason: impl Into<String>) -> Error {
        Error::InvalidEndpoint {
            input: self.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidEndpoint {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected `host:port`"))?;

        let host = match host.strip_prefix('[') {
            Some(inner) => inner
                .strip_suffix(']')
                .ok_or_else(|| invalid("unterminated `[` in IPv6 host"))?,
            None if host.contains(':') => {
                return Err(invalid("IPv6 hosts must be written as `[addr]:port`"));
            }
            None => host,
        };
        if host.is_empty() {
            return Err(invalid("host is empty"));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| invalid("port must be a number between 0 and 65535"))?;

        Ok(Self::new(host, port))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Binds `endpoint` with address and port reuse enabled and starts listening.
///
/// Every worker calls this independently for the same endpoint. Binding only
/// succeeds alongside other sockets that opted into port reuse under the same
/// user; a port held by any other socket is reported as [`Error::Bind`].
///
/// # Errors
///
/// - [`Error::InvalidEndpoint`] if the host does not resolve.
/// - [`Error::Bind`] if the socket cannot be created, configured, bound or
///   put into listening state.
pub async fn bind_shared(endpoint: &Endpoint) -> Result<TcpListener> {
    let addr = endpoint.resolve().await?;
    let bind_err = |source| Error::Bind {
        endpoint: endpoint.clone(),
        source,
    };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;

    socket.set_reuseaddr(true).map_err(bind_err)?;
    #[cfg(all(
        unix,
        not(target_os = "solaris"),
        not(target_os = "illumos"),
        not(target_os = "cygwin")
    ))]
    socket.set_reuseport(true).map_err(bind_err)?;

    socket.bind(addr).map_err(bind_err)?;
    let listener = socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;

    #[cfg(feature = "tracing")]
    tracing::debug!("Bound shared endpoint {endpoint} ({addr})");

    Ok(listener)
}
