use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::OnceLock;

use crate::UniverseError;

/// The default port universe servers listen on.
pub const DEFAULT_UNIVERSE_RPC_PORT: u16 = 10029;

/// The reachable address of a remote universe server. The host string is
/// resolved lazily on first use and cached.
#[derive(Debug)]
pub struct ServerAddr {
    /// Database identifier of the server, zero when not yet stored.
    pub id: i64,
    host: String,
    resolved: OnceLock<SocketAddr>,
}

impl ServerAddr {
    /// Wraps a raw `host` or `host:port` string.
    pub fn from_str_addr(host: impl Into<String>) -> Self {
        ServerAddr {
            id: 0,
            host: host.into(),
            resolved: OnceLock::new(),
        }
    }

    /// Wraps a host string with its database id.
    pub fn new(id: i64, host: impl Into<String>) -> Self {
        ServerAddr {
            id,
            host: host.into(),
            resolved: OnceLock::new(),
        }
    }

    /// The unresolved host string.
    pub fn host_str(&self) -> &str {
        &self.host
    }

    /// Resolves the address, defaulting the port when none was given. The
    /// result is cached across calls.
    pub fn addr(&self) -> Result<SocketAddr, UniverseError> {
        if let Some(addr) = self.resolved.get() {
            return Ok(*addr);
        }

        let addr = resolve_universe_addr(&self.host)?;
        Ok(*self.resolved.get_or_init(|| addr))
    }
}

impl Clone for ServerAddr {
    fn clone(&self) -> Self {
        // The resolution cache does not travel with clones.
        ServerAddr {
            id: self.id,
            host: self.host.clone(),
            resolved: OnceLock::new(),
        }
    }
}

impl PartialEq for ServerAddr {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host
    }
}

impl Eq for ServerAddr {}

/// Maps a `host` or `host:port` string to a socket address, applying the
/// default universe port when none is present.
fn resolve_universe_addr(host: &str) -> Result<SocketAddr, UniverseError> {
    if host.is_empty() {
        return Err(UniverseError::InvalidServerAddr(
            "universe host cannot be empty".into(),
        ));
    }

    // If splitting into host:port fails, assume only a host was given.
    let candidate = if host.rsplit_once(':').map(|(_, p)| p.parse::<u16>().is_ok()) == Some(true)
    {
        host.to_string()
    } else {
        format!("{host}:{DEFAULT_UNIVERSE_RPC_PORT}")
    };

    candidate
        .to_socket_addrs()
        .map_err(|e| UniverseError::InvalidServerAddr(e.to_string()))?
        .next()
        .ok_or_else(|| {
            UniverseError::InvalidServerAddr(format!("{host} resolved to no addresses"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_applied() {
        let addr = ServerAddr::from_str_addr("127.0.0.1");
        assert_eq!(addr.addr().unwrap().port(), DEFAULT_UNIVERSE_RPC_PORT);
    }

    #[test]
    fn explicit_port_is_kept() {
        let addr = ServerAddr::from_str_addr("127.0.0.1:8080");
        assert_eq!(addr.addr().unwrap().port(), 8080);
    }

    #[test]
    fn empty_host_rejected() {
        let addr = ServerAddr::from_str_addr("");
        assert!(addr.addr().is_err());
    }

    #[test]
    fn resolution_is_cached() {
        let addr = ServerAddr::from_str_addr("127.0.0.1:9000");
        let first = addr.addr().unwrap();
        assert_eq!(addr.addr().unwrap(), first);
    }
}
