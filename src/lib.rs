//! Transparent TCP proxy.
//!
//! Accepts connections that NAT `REDIRECT` rules sent to the proxy, recovers
//! each one's original destination with `SO_ORIGINAL_DST`, dials it (with
//! `SO_MARK` on the outbound socket when configured) and relays bytes in both
//! directions, unmodified, until both sides are done.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod relay;
pub mod server;
pub mod sockopt;

pub use config::{ServerConfig, ShutdownMode};
pub use error::{Direction, ProxyError};
pub use relay::RelayStats;
pub use server::Server;
pub use sockopt::{KernelSocketOptions, SocketOptions};
