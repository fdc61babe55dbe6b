//! Kernel route representation and candidate bookkeeping.

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;

/// Address family of a route or prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Returns the family of an IP prefix.
    pub fn of(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => Family::V4,
            IpNet::V6(_) => Family::V6,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "IPv4"),
            Family::V6 => write!(f, "IPv6"),
        }
    }
}

/// Route type as far as this daemon cares: regular unicast routes are
/// mirrored as-is, blackhole routes can be synthesised as a fallback, and
/// everything else is carried through opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteKind {
    #[default]
    Unicast,
    Blackhole,
    Other(u8),
}

/// A single next hop: a gateway address, an output link, or both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextHop {
    pub gateway: Option<IpAddr>,
    pub link: Option<u32>,
}

impl NextHop {
    /// Next hop through a gateway address.
    pub fn gateway(address: IpAddr) -> Self {
        Self {
            gateway: Some(address),
            link: None,
        }
    }

    /// Next hop through a directly connected link.
    pub fn device(link: u32) -> Self {
        Self {
            gateway: None,
            link: Some(link),
        }
    }
}

impl fmt::Display for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.gateway, self.link) {
            (Some(gateway), Some(link)) => write!(f, "via {} dev {}", gateway, link),
            (Some(gateway), None) => write!(f, "via {}", gateway),
            (None, Some(link)) => write!(f, "dev {}", link),
            (None, None) => write!(f, "unspecified"),
        }
    }
}

/// Next-hop payload of a route. ECMP routes keep their next hops in kernel
/// order; blackhole and unresolved routes carry none.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NextHops {
    #[default]
    None,
    Single(NextHop),
    Multi(Vec<NextHop>),
}

/// An immutable FIB entry, compared field by field: two routes are equal
/// only when every attribute matches exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination prefix (address and length).
    pub destination: IpNet,
    /// Routing table the entry lives in.
    pub table: u32,
    /// Routing protocol that installed the entry.
    pub protocol: u8,
    /// Metric of the entry.
    pub priority: u32,
    /// Type of service.
    pub tos: u8,
    pub kind: RouteKind,
    pub next_hops: NextHops,
}

impl Route {
    /// Creates a unicast route with zeroed protocol, priority and ToS and
    /// no next hop. Callers adjust the rest through the `with_*` helpers.
    pub fn new(destination: IpNet, table: u32) -> Self {
        Self {
            destination,
            table,
            protocol: 0,
            priority: 0,
            tos: 0,
            kind: RouteKind::Unicast,
            next_hops: NextHops::None,
        }
    }

    pub fn with_protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tos(mut self, tos: u8) -> Self {
        self.tos = tos;
        self
    }

    pub fn with_kind(mut self, kind: RouteKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_gateway(mut self, address: IpAddr) -> Self {
        self.next_hops = NextHops::Single(NextHop::gateway(address));
        self
    }

    pub fn with_next_hops(mut self, next_hops: NextHops) -> Self {
        self.next_hops = next_hops;
        self
    }

    /// Address family of the destination prefix.
    pub fn family(&self) -> Family {
        Family::of(&self.destination)
    }

    /// The FIB slot this route occupies. The kernel keeps at most one route
    /// per slot, which drives the replacement rule of [`CandidateSet`].
    pub fn slot(&self) -> (IpNet, u32, u8, u32) {
        (self.destination, self.table, self.tos, self.priority)
    }

    /// Election key: candidates are ranked by `(tos, priority)`, lowest
    /// first.
    fn preference(&self) -> (u8, u32) {
        (self.tos, self.priority)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == RouteKind::Blackhole {
            write!(f, "blackhole ")?;
        }
        write!(f, "{}", self.destination)?;
        match &self.next_hops {
            NextHops::None => {}
            NextHops::Single(hop) => write!(f, " {}", hop)?,
            NextHops::Multi(hops) => {
                for hop in hops {
                    write!(f, " nexthop {}", hop)?;
                }
            }
        }
        write!(
            f,
            " table {} proto {} metric {}",
            self.table, self.protocol, self.priority
        )?;
        if self.tos != 0 {
            write!(f, " tos {}", self.tos)?;
        }
        Ok(())
    }
}

/// Kind of a route update coming from the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    New,
    Del,
}

/// A route update from the kernel routing socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteUpdate {
    pub kind: UpdateKind,
    pub route: Route,
}

/// Insertion-ordered set of routes eligible to become a gateway's target.
///
/// Owned exclusively by one gateway agent, so no locking. The set enforces
/// the kernel's FIB-slot rule: inserting a route whose
/// `(destination, table, tos, priority)` matches an existing entry replaces
/// that entry instead of appending.
#[derive(Debug, Default)]
pub struct CandidateSet {
    routes: Vec<Route>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a candidate. An exactly equal route is a no-op; a route
    /// occupying the same FIB slot is replaced.
    pub fn insert(&mut self, route: Route) {
        if self.routes.contains(&route) {
            return;
        }
        self.routes.retain(|current| current.slot() != route.slot());
        self.routes.push(route);
    }

    /// Removes the candidate exactly equal to `route`; silent if absent.
    pub fn remove(&mut self, route: &Route) {
        self.routes.retain(|current| current != route);
    }

    /// Drops all candidates. Used when a new RIB view starts.
    pub fn clear(&mut self) {
        self.routes.clear();
    }

    /// Returns the best candidate: minimal `(tos, priority)`, ties broken
    /// by insertion order (oldest wins).
    pub fn best(&self) -> Option<&Route> {
        let mut best: Option<&Route> = None;
        for route in &self.routes {
            match best {
                Some(current) if route.preference() >= current.preference() => {}
                _ => best = Some(route),
            }
        }
        best
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
