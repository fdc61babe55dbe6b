//! Last-resort gateway daemon.
//!
//! `lrgd` watches the kernel routing table and keeps a mirror of selected
//! routes installed under a separate identity (another protocol and
//! metric, optionally another prefix or table). When the routing daemon
//! that owns the primary route crashes or withdraws it, the mirror is
//! still there and traffic keeps flowing until the primary recovers.
//!
//! The daemon is configured with one or more gateways, each a pair of
//! selectors:
//!
//! ```yaml
//! gateways:
//!   - from:
//!       prefix: 0.0.0.0/0
//!       protocol: bgp
//!     to:
//!       metric: 4294967295
//!       blackhole: true
//! ```
//!
//! The `from` selector picks candidate routes out of the kernel FIB; the
//! best candidate (lowest ToS, then metric) is rewritten to the `to`
//! identity and installed. With `blackhole: true`, a blackhole route takes
//! over when no candidate is left.
//!
//! Internally the daemon is a small pipeline: the [`observer`] owns the
//! netlink subscription and emits an ordered notification stream, the
//! supervisor fans it out, and one [`gateway`] agent per configured
//! gateway maintains its candidates and drives installation with retries.

pub mod backoff;
pub mod config;
pub mod error;
pub mod gateway;
pub mod netlink;
pub mod observer;
pub mod reporter;
pub mod route;
pub mod rt_files;
pub mod supervisor;

pub use config::{DaemonConfig, FromSelector, GatewayConfig, NetlinkConfig, Prefix, Protocol, Table, ToSelector};
pub use error::Error;
pub use gateway::GatewayAgent;
pub use netlink::{KernelSocket, RouteSocket, SocketError, Subscription};
pub use observer::{Notification, Observer};
pub use reporter::{Counter, Gauge, Reporter};
pub use route::{CandidateSet, Family, NextHop, NextHops, Route, RouteKind, RouteUpdate, UpdateKind};
pub use supervisor::{Lifecycle, LogLifecycle, Supervisor};

/// Result type for daemon operations.
pub type Result<T> = std::result::Result<T, Error>;
