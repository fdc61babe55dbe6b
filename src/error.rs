//! Error types for the last-resort gateway daemon.

use thiserror::Error;

/// Errors that can occur while running the daemon.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed.
    #[error("cannot parse configuration: {0}")]
    ConfigSyntax(#[from] serde_yaml::Error),

    /// Netlink request failed.
    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    /// I/O error, usually from the netlink socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
