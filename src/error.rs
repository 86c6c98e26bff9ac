use std::fmt;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Copy direction of a relayed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => f.write_str("client -> server"),
            Direction::ServerToClient => f.write_str("server -> client"),
        }
    }
}

/// Errors produced by the proxy.
///
/// Only [`ProxyError::Bind`] ever reaches a caller of the server API; every
/// other variant is recorded and handled inside the task of the connection
/// it belongs to.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The listening socket could not be created.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// No usable original destination on the accepted socket.
    #[error("failed to get original destination: {0}")]
    Resolution(#[source] io::Error),

    /// The original destination is the proxy itself.
    #[error("destination {dst} is the same as local address {local}")]
    Loopback { dst: SocketAddr, local: SocketAddr },

    #[error("dial {dst} failed: {source}")]
    Dial {
        dst: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to set socket mark {mark}: {source}")]
    Mark {
        mark: u32,
        #[source]
        source: io::Error,
    },

    #[error("error copying {direction}: {source}")]
    Relay {
        direction: Direction,
        #[source]
        source: io::Error,
    },
}

impl ProxyError {
    /// Whether the error is confined to a single connection.
    #[must_use]
    pub fn is_connection_local(&self) -> bool {
        !matches!(self, ProxyError::Bind { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_bind_escapes_the_connection() {
        let bind = ProxyError::Bind {
            addr: ":1".into(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(!bind.is_connection_local());

        let loopback = ProxyError::Loopback {
            dst: "127.0.0.1:8883".parse().unwrap(),
            local: "127.0.0.1:8883".parse().unwrap(),
        };
        assert!(loopback.is_connection_local());

        let relay = ProxyError::Relay {
            direction: Direction::ServerToClient,
            source: io::Error::from(io::ErrorKind::ConnectionReset),
        };
        assert!(relay.is_connection_local());
        assert!(relay.to_string().starts_with("error copying server -> client"));
    }
}
