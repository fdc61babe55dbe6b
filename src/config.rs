//! Daemon configuration: typed values, YAML deserialisation and
//! validation.
//!
//! The configuration document has two sections: `netlink` tunes the kernel
//! observer and `gateways` lists the last-resort gateways to maintain.
//! Routing tables and protocols accept either a numeric id or a symbolic
//! name resolved through the iproute2 files (see [`crate::rt_files`]).

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use ipnet::IpNet;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer};

use crate::route::{Family, Route};
use crate::rt_files;
use crate::{Error, Result};

/// Routing table used when a gateway does not name one: 254, "main".
pub const DEFAULT_TABLE: Table = Table(254);

/// Protocol under which mirrored routes are installed: 254, "lrg".
pub const DEFAULT_TO_PROTOCOL: Protocol = Protocol(254);

/// Metric of mirrored routes: the worst possible one, so the mirror never
/// wins against a live route.
pub const DEFAULT_TO_METRIC: u32 = u32::MAX;

/// An IP prefix in canonical form (no host bits set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix(pub IpNet);

impl Prefix {
    pub fn family(&self) -> Family {
        Family::of(&self.0)
    }
}

impl FromStr for Prefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let net: IpNet = s
            .parse()
            .map_err(|_| Error::Config(format!("{:?} is not an IP subnet", s)))?;
        if net.addr() != net.network() {
            return Err(Error::Config(format!(
                "{:?} is not an IP subnet (host bits set)",
                s
            )));
        }
        Ok(Prefix(net))
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Prefix {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// A routing table id (0..=255), parsed from a number or a name listed in
/// the `rt_tables` files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Table(pub u32);

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A routing protocol id (0..=255), parsed from a number or a name listed
/// in the `rt_protos` files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocol(pub u8);

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct IdOrNameVisitor {
    what: &'static str,
    paths: Vec<std::path::PathBuf>,
}

impl<'de> Visitor<'de> for IdOrNameVisitor {
    type Value = u32;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a {} id (0..=255) or name", self.what)
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> std::result::Result<u32, E> {
        if value > 255 {
            return Err(E::custom(format!(
                "{} id {} is out of range",
                self.what, value
            )));
        }
        Ok(value as u32)
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> std::result::Result<u32, E> {
        u64::try_from(value)
            .map_err(|_| E::custom(format!("{} id {} is out of range", self.what, value)))
            .and_then(|value| self.visit_u64(value))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<u32, E> {
        rt_files::find_name(&self.paths, value).map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for Table {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer
            .deserialize_any(IdOrNameVisitor {
                what: "table",
                paths: rt_files::table_paths(),
            })
            .map(Table)
    }
}

impl<'de> Deserialize<'de> for Protocol {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer
            .deserialize_any(IdOrNameVisitor {
                what: "protocol",
                paths: rt_files::protocol_paths(),
            })
            .map(|id| Protocol(id as u8))
    }
}

/// Selects the kernel routes eligible to become a gateway's candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FromSelector {
    pub prefix: Prefix,
    pub table: Table,
    pub protocol: Option<Protocol>,
    pub metric: Option<u32>,
}

impl FromSelector {
    /// Does the route match this selector? The destination must equal the
    /// prefix exactly (no subset matching); protocol and metric only
    /// constrain the route when configured.
    pub fn matches(&self, route: &Route) -> bool {
        route.destination == self.prefix.0
            && route.table == self.table.0
            && self.protocol.map_or(true, |p| route.protocol == p.0)
            && self.metric.map_or(true, |m| route.priority == m)
    }
}

/// Identity under which the mirrored route is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToSelector {
    pub prefix: Prefix,
    pub table: Table,
    pub protocol: Protocol,
    pub metric: u32,
    /// Install a blackhole route when no candidate exists.
    pub blackhole: bool,
}

impl ToSelector {
    /// Does the route carry this gateway's target identity? All four
    /// fields must match; `blackhole` is policy, not a match criterion.
    pub fn matches(&self, route: &Route) -> bool {
        route.destination == self.prefix.0
            && route.table == self.table.0
            && route.protocol == self.protocol.0
            && route.priority == self.metric
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFrom {
    prefix: Option<Prefix>,
    table: Option<Table>,
    protocol: Option<Protocol>,
    metric: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTo {
    prefix: Option<Prefix>,
    table: Option<Table>,
    protocol: Option<Protocol>,
    metric: Option<u32>,
    blackhole: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGateway {
    #[serde(default)]
    from: RawFrom,
    #[serde(default)]
    to: RawTo,
}

/// Configuration of one last-resort gateway.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawGateway")]
pub struct GatewayConfig {
    pub from: FromSelector,
    pub to: ToSelector,
}

impl TryFrom<RawGateway> for GatewayConfig {
    type Error = Error;

    fn try_from(raw: RawGateway) -> Result<Self> {
        let prefix = raw.from.prefix.ok_or_else(|| {
            Error::Config("source prefix missing from gateway configuration".to_string())
        })?;
        let from = FromSelector {
            prefix,
            table: raw.from.table.unwrap_or(DEFAULT_TABLE),
            protocol: raw.from.protocol,
            metric: raw.from.metric,
        };
        if let Some(to_prefix) = raw.to.prefix {
            if to_prefix.family() != prefix.family() {
                return Err(Error::Config(format!(
                    "incompatible families for from/to prefixes ({}/{})",
                    prefix, to_prefix
                )));
            }
        }
        let to = ToSelector {
            prefix: raw.to.prefix.unwrap_or(from.prefix),
            table: raw.to.table.unwrap_or(from.table),
            protocol: raw.to.protocol.unwrap_or(DEFAULT_TO_PROTOCOL),
            metric: raw.to.metric.unwrap_or(DEFAULT_TO_METRIC),
            blackhole: raw.to.blackhole.unwrap_or(false),
        };
        Ok(GatewayConfig { from, to })
    }
}

/// Tuning of the netlink observer. Intervals are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct NetlinkConfig {
    /// Capacity of the subscription and dump channels.
    pub channel_size: usize,
    /// Receive buffer size for the routing socket; 0 keeps the kernel
    /// default.
    pub socket_size: usize,
    /// Initial resync backoff.
    pub backoff_interval: u64,
    /// Resync backoff cap.
    pub backoff_max_interval: u64,
    /// Error-free interval after which the resync backoff resets.
    pub cure_interval: u64,
}

impl Default for NetlinkConfig {
    fn default() -> Self {
        Self {
            channel_size: 100,
            socket_size: 0,
            backoff_interval: 10,
            backoff_max_interval: 10_000,
            cure_interval: 30_000,
        }
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub netlink: NetlinkConfig,
    pub gateways: Vec<GatewayConfig>,
}

impl DaemonConfig {
    /// Parses a configuration document.
    pub fn parse(document: &str) -> Result<Self> {
        let config: DaemonConfig = serde_yaml::from_str(document)?;
        if config.gateways.is_empty() {
            return Err(Error::Config("at least one gateway is needed".to_string()));
        }
        Ok(config)
    }

    /// Loads the configuration from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let document = fs::read_to_string(path).map_err(|err| {
            Error::Config(format!("cannot read {}: {}", path.display(), err))
        })?;
        Self::parse(&document)
    }
}
