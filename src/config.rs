use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

pub const DEFAULT_LISTEN_ADDR: &str = ":8883";

/// What `Server::stop` does with connections that are still relaying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    /// Close the listener only; active relays finish on their own terms.
    #[default]
    Detach,
    /// Close the listener, wait up to `grace` for active relays, then cancel
    /// whatever is left and close its sockets.
    Graceful { grace: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// `host:port`, `[v6]:port` or `:port` (all interfaces).
    pub listen_addr: String,
    /// `SO_MARK` for outbound sockets, 0 leaves them unmarked.
    pub mark: u32,
    /// Outbound connect timeout; `None` uses the platform default.
    pub connect_timeout: Option<Duration>,
    pub shutdown: ShutdownMode,
}

impl ServerConfig {
    pub fn new(listen_addr: impl Into<String>, mark: u32) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            mark,
            connect_timeout: None,
            shutdown: ShutdownMode::Detach,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownMode) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Loads the configuration from `TCP_PROXY_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = match lookup("TCP_PROXY_LISTEN_ADDR") {
            Some(v) if !v.trim().is_empty() => v.trim().to_string(),
            _ => DEFAULT_LISTEN_ADDR.to_string(),
        };

        let mark = lookup("TCP_PROXY_MARK")
            .map(|v| {
                v.trim()
                    .parse::<u32>()
                    .with_context(|| format!("invalid TCP_PROXY_MARK: {v}"))
            })
            .transpose()?
            .unwrap_or(0);

        let connect_timeout_secs = lookup("TCP_PROXY_CONNECT_TIMEOUT_SECS")
            .map(|v| {
                v.trim()
                    .parse::<u64>()
                    .with_context(|| format!("invalid TCP_PROXY_CONNECT_TIMEOUT_SECS: {v}"))
            })
            .transpose()?
            .unwrap_or(0);

        let shutdown = lookup("TCP_PROXY_SHUTDOWN_GRACE_SECS")
            .map(|v| {
                v.trim()
                    .parse::<u64>()
                    .with_context(|| format!("invalid TCP_PROXY_SHUTDOWN_GRACE_SECS: {v}"))
            })
            .transpose()?
            .map_or(ShutdownMode::Detach, |secs| ShutdownMode::Graceful {
                grace: Duration::from_secs(secs),
            });

        Ok(Self {
            listen_addr,
            mark,
            connect_timeout: (connect_timeout_secs > 0)
                .then(|| Duration::from_secs(connect_timeout_secs)),
            shutdown,
        })
    }
}
