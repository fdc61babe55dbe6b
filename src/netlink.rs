//! Netlink integration: route dumps, route installation and the live
//! route subscription.
//!
//! The kernel is reached through the [`RouteSocket`] trait so the rest of
//! the daemon never touches netlink types. [`KernelSocket`] is the real
//! implementation: dumps and installs go through an rtnetlink handle,
//! while the subscription owns a raw netlink socket bound to the IPv4 and
//! IPv6 route multicast groups. Keeping the subscription on its own socket
//! lets us observe receive-buffer overflows (`ENOBUFS`) directly, which
//! the observer treats as a signal to resynchronise.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::IpNet;
use parking_lot::Mutex;
use rtnetlink::packet_core::{NetlinkMessage, NetlinkPayload};
use rtnetlink::packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteNextHop, RouteProtocol, RouteScope,
    RouteType,
};
use rtnetlink::packet_route::{AddressFamily, RouteNetlinkMessage};
use rtnetlink::sys::protocols::NETLINK_ROUTE;
use rtnetlink::sys::{AsyncSocket, AsyncSocketExt, SocketAddr, TokioSocket};
use rtnetlink::{Handle, RouteMessageBuilder};
use tokio::sync::mpsc;

use crate::route::{Family, NextHop, NextHops, Route, RouteKind, RouteUpdate, UpdateKind};
use crate::{Error, Result};

/// Table id the kernel uses as "unspecified". Dump requests carry it to
/// ask for every table; updates carrying it are not real routes.
const RT_TABLE_UNSPEC: u8 = 0;

/// Error that terminated a route subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    /// The socket receive buffer overflowed (`ENOBUFS`); updates were
    /// lost.
    Overflow,
    /// Any other socket failure.
    Other(String),
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketError::Overflow => write!(f, "receive buffer overflow"),
            SocketError::Other(message) => write!(f, "{}", message),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(err: io::Error) -> Self {
        if err.raw_os_error() == Some(libc::ENOBUFS) {
            SocketError::Overflow
        } else {
            SocketError::Other(err.to_string())
        }
    }
}

/// A live route subscription.
///
/// Updates arrive through a bounded channel; when the underlying socket
/// fails the stream ends and the error is retrievable with
/// [`Subscription::take_error`]. Dropping the subscription closes the
/// socket.
pub struct Subscription {
    events: mpsc::Receiver<RouteUpdate>,
    failure: Arc<Mutex<Option<SocketError>>>,
}

impl Subscription {
    /// Receives the next route update, or `None` once the subscription
    /// ended.
    pub async fn recv(&mut self) -> Option<RouteUpdate> {
        self.events.recv().await
    }

    /// After [`recv`](Self::recv) returned `None`, the error that ended
    /// the stream.
    pub fn take_error(&mut self) -> Option<SocketError> {
        self.failure.lock().take()
    }
}

/// Kernel routing-socket operations used by the daemon.
#[async_trait]
pub trait RouteSocket: Send + Sync + 'static {
    /// Lists the routes of one family across all routing tables.
    async fn list_routes(&self, family: Family) -> Result<Vec<Route>>;

    /// Opens a subscription to route changes, buffered at `capacity`.
    fn subscribe(&self, capacity: usize) -> Result<Subscription>;

    /// Installs `route`, replacing any FIB entry with the same
    /// destination, table, ToS, protocol and priority. No retry here;
    /// retrying is the caller's business.
    async fn replace_route(&self, route: &Route) -> Result<()>;
}

/// The real kernel socket, backed by rtnetlink.
pub struct KernelSocket {
    handle: Handle,
    socket_size: usize,
}

impl KernelSocket {
    /// Connects to the kernel. `socket_size` sets the receive buffer of
    /// subscription sockets; 0 keeps the kernel default.
    ///
    /// Must be called from a tokio runtime: the rtnetlink connection runs
    /// as a background task.
    pub fn new(socket_size: usize) -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(Self {
            handle,
            socket_size,
        })
    }
}

#[async_trait]
impl RouteSocket for KernelSocket {
    async fn list_routes(&self, family: Family) -> Result<Vec<Route>> {
        let message = match family {
            Family::V4 => RouteMessageBuilder::<Ipv4Addr>::default()
                .table_id(RT_TABLE_UNSPEC as u32)
                .build(),
            Family::V6 => RouteMessageBuilder::<Ipv6Addr>::default()
                .table_id(RT_TABLE_UNSPEC as u32)
                .build(),
        };
        let mut stream = self.handle.route().get(message).execute();
        let mut routes = Vec::new();
        while let Some(message) = stream.try_next().await? {
            let Some(route) = route_from_message(&message) else {
                continue;
            };
            if route.table == RT_TABLE_UNSPEC as u32 {
                continue;
            }
            routes.push(route);
        }
        Ok(routes)
    }

    fn subscribe(&self, capacity: usize) -> Result<Subscription> {
        let mut socket = TokioSocket::new(NETLINK_ROUTE)?;
        if self.socket_size > 0 {
            socket.socket_mut().set_rx_buf_sz(self.socket_size)?;
        }
        let groups =
            nl_mgrp(libc::RTNLGRP_IPV4_ROUTE) | nl_mgrp(libc::RTNLGRP_IPV6_ROUTE);
        socket.socket_mut().bind(&SocketAddr::new(0, groups))?;

        let (events_tx, events_rx) = mpsc::channel(capacity);
        let failure = Arc::new(Mutex::new(None));
        tokio::spawn(monitor_socket(socket, events_tx, failure.clone()));
        Ok(Subscription {
            events: events_rx,
            failure,
        })
    }

    async fn replace_route(&self, route: &Route) -> Result<()> {
        let message = message_from_route(route);
        self.handle.route().add(message).replace().execute().await?;
        Ok(())
    }
}

/// Multicast group mask for groups that fit the legacy 32-bit bind field.
const fn nl_mgrp(group: u32) -> u32 {
    if group == 0 {
        0
    } else {
        1 << (group - 1)
    }
}

/// Receive loop of a subscription socket. Exits when the subscriber goes
/// away or the socket fails; in the latter case the error is stored for
/// [`Subscription::take_error`] before the channel closes.
async fn monitor_socket(
    mut socket: TokioSocket,
    events: mpsc::Sender<RouteUpdate>,
    failure: Arc<Mutex<Option<SocketError>>>,
) {
    loop {
        tokio::select! {
            _ = events.closed() => return,
            received = socket.recv_from_full() => {
                let data = match received {
                    Ok((data, _addr)) => data,
                    Err(err) => {
                        *failure.lock() = Some(SocketError::from(err));
                        return;
                    }
                };
                if forward_datagram(&data, &events, &failure).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Parses one datagram and forwards its route updates. `Err` means the
/// subscription must end, either because of a poisoned stream or because
/// the subscriber went away.
async fn forward_datagram(
    data: &[u8],
    events: &mpsc::Sender<RouteUpdate>,
    failure: &Mutex<Option<SocketError>>,
) -> std::result::Result<(), ()> {
    let mut offset = 0;
    while offset < data.len() {
        let message = match NetlinkMessage::<RouteNetlinkMessage>::deserialize(&data[offset..])
        {
            Ok(message) => message,
            Err(err) => {
                *failure.lock() =
                    Some(SocketError::Other(format!("cannot parse netlink message: {}", err)));
                return Err(());
            }
        };
        let length = message.header.length as usize;
        if length == 0 {
            break;
        }
        // Messages are 4-byte aligned within a datagram.
        offset += (length + 3) & !3;

        match message.payload {
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRoute(route)) => {
                send_update(events, UpdateKind::New, &route).await?;
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelRoute(route)) => {
                send_update(events, UpdateKind::Del, &route).await?;
            }
            NetlinkPayload::Error(err) => {
                *failure.lock() =
                    Some(SocketError::Other(format!("netlink error message: {:?}", err)));
                return Err(());
            }
            NetlinkPayload::Overrun(_) => {
                *failure.lock() = Some(SocketError::Overflow);
                return Err(());
            }
            _ => {}
        }
    }
    Ok(())
}

async fn send_update(
    events: &mpsc::Sender<RouteUpdate>,
    kind: UpdateKind,
    message: &RouteMessage,
) -> std::result::Result<(), ()> {
    let Some(route) = route_from_message(message) else {
        return Ok(());
    };
    if route.table == RT_TABLE_UNSPEC as u32 {
        // Unspecified-table updates are stream bookkeeping, not routes.
        return Ok(());
    }
    events
        .send(RouteUpdate { kind, route })
        .await
        .map_err(|_| ())
}

fn route_address_ip(address: &RouteAddress) -> Option<IpAddr> {
    match address {
        RouteAddress::Inet(addr) => Some(IpAddr::V4(*addr)),
        RouteAddress::Inet6(addr) => Some(IpAddr::V6(*addr)),
        _ => None,
    }
}

fn ip_route_address(address: IpAddr) -> RouteAddress {
    match address {
        IpAddr::V4(addr) => RouteAddress::Inet(addr),
        IpAddr::V6(addr) => RouteAddress::Inet6(addr),
    }
}

fn next_hop_from_message(hop: &RouteNextHop) -> NextHop {
    let gateway = hop.attributes.iter().find_map(|attribute| match attribute {
        RouteAttribute::Gateway(address) => route_address_ip(address),
        _ => None,
    });
    NextHop {
        gateway,
        link: (hop.interface_index != 0).then_some(hop.interface_index),
    }
}

fn next_hop_to_message(hop: &NextHop) -> RouteNextHop {
    let mut message = RouteNextHop::default();
    if let Some(link) = hop.link {
        message.interface_index = link;
    }
    if let Some(gateway) = hop.gateway {
        message
            .attributes
            .push(RouteAttribute::Gateway(ip_route_address(gateway)));
    }
    message
}

/// Converts a kernel route message into a [`Route`]. Returns `None` for
/// non-IP families and malformed destinations.
pub(crate) fn route_from_message(message: &RouteMessage) -> Option<Route> {
    let family = match message.header.address_family {
        AddressFamily::Inet => Family::V4,
        AddressFamily::Inet6 => Family::V6,
        _ => return None,
    };
    let mut destination = None;
    let mut table = None;
    let mut priority = 0;
    let mut gateway = None;
    let mut link = None;
    let mut multi: Option<Vec<NextHop>> = None;
    for attribute in &message.attributes {
        match attribute {
            RouteAttribute::Destination(address) => destination = route_address_ip(address),
            RouteAttribute::Table(id) => table = Some(*id),
            RouteAttribute::Priority(metric) => priority = *metric,
            RouteAttribute::Gateway(address) => gateway = route_address_ip(address),
            RouteAttribute::Oif(index) => link = Some(*index),
            RouteAttribute::MultiPath(hops) => {
                multi = Some(hops.iter().map(next_hop_from_message).collect());
            }
            _ => {}
        }
    }
    let address = destination.unwrap_or(match family {
        Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    });
    let destination =
        IpNet::new(address, message.header.destination_prefix_length).ok()?;
    let next_hops = match (multi, gateway, link) {
        (Some(hops), _, _) => NextHops::Multi(hops),
        (None, None, None) => NextHops::None,
        (None, gateway, link) => NextHops::Single(NextHop { gateway, link }),
    };
    Some(Route {
        destination,
        table: table.unwrap_or(message.header.table as u32),
        protocol: message.header.protocol.into(),
        priority,
        tos: message.header.tos,
        kind: match message.header.kind {
            RouteType::Unicast => RouteKind::Unicast,
            RouteType::BlackHole => RouteKind::Blackhole,
            other => RouteKind::Other(other.into()),
        },
        next_hops,
    })
}

/// Converts a [`Route`] into the message installed through rtnetlink.
pub(crate) fn message_from_route(route: &Route) -> RouteMessage {
    let mut message = RouteMessage::default();
    message.header.address_family = match route.family() {
        Family::V4 => AddressFamily::Inet,
        Family::V6 => AddressFamily::Inet6,
    };
    message.header.destination_prefix_length = route.destination.prefix_len();
    message.header.tos = route.tos;
    message.header.protocol = RouteProtocol::from(route.protocol);
    message.header.scope = RouteScope::Universe;
    message.header.kind = match route.kind {
        RouteKind::Unicast => RouteType::Unicast,
        RouteKind::Blackhole => RouteType::BlackHole,
        RouteKind::Other(kind) => RouteType::from(kind),
    };
    if route.table <= 255 {
        message.header.table = route.table as u8;
    } else {
        message.header.table = RT_TABLE_UNSPEC;
        message.attributes.push(RouteAttribute::Table(route.table));
    }
    message.attributes.push(RouteAttribute::Destination(ip_route_address(
        route.destination.addr(),
    )));
    if route.priority != 0 {
        message
            .attributes
            .push(RouteAttribute::Priority(route.priority));
    }
    match &route.next_hops {
        NextHops::None => {}
        NextHops::Single(hop) => {
            if let Some(gateway) = hop.gateway {
                message
                    .attributes
                    .push(RouteAttribute::Gateway(ip_route_address(gateway)));
            }
            if let Some(link) = hop.link {
                message.attributes.push(RouteAttribute::Oif(link));
            }
        }
        NextHops::Multi(hops) => {
            message.attributes.push(RouteAttribute::MultiPath(
                hops.iter().map(next_hop_to_message).collect(),
            ));
        }
    }
    message
}

pub mod mock {
    //! Scriptable in-memory socket, the test double for [`KernelSocket`].
    //!
    //! Dumps return scripted per-family route lists, installed routes are
    //! recorded, and live updates or socket errors are injected by the
    //! test. Panics on misuse; this is test support, not production code.

    use std::collections::HashMap;

    use super::*;

    #[derive(Default)]
    struct MockState {
        routes: HashMap<Family, Vec<Route>>,
        installed: Vec<Route>,
        install_failures: usize,
        list_failures: usize,
        subscriptions: usize,
        events: Option<mpsc::Sender<RouteUpdate>>,
        failure: Option<Arc<Mutex<Option<SocketError>>>>,
    }

    /// In-memory [`RouteSocket`] implementation.
    #[derive(Clone, Default)]
    pub struct MockSocket {
        state: Arc<Mutex<MockState>>,
    }

    impl MockSocket {
        pub fn new() -> Self {
            Self::default()
        }

        /// Sets the routes returned by subsequent dumps of `family`.
        pub fn set_routes(&self, family: Family, routes: Vec<Route>) {
            self.state.lock().routes.insert(family, routes);
        }

        /// Makes the next `count` install attempts fail.
        pub fn fail_installs(&self, count: usize) {
            self.state.lock().install_failures = count;
        }

        /// Makes the next `count` dumps fail.
        pub fn fail_lists(&self, count: usize) {
            self.state.lock().list_failures = count;
        }

        /// Routes installed so far, oldest first.
        pub fn installed(&self) -> Vec<Route> {
            self.state.lock().installed.clone()
        }

        /// The most recently installed route.
        pub fn last_installed(&self) -> Option<Route> {
            self.state.lock().installed.last().cloned()
        }

        /// Forgets previously recorded installs.
        pub fn clear_installed(&self) {
            self.state.lock().installed.clear();
        }

        /// Number of subscriptions opened so far.
        pub fn subscription_count(&self) -> usize {
            self.state.lock().subscriptions
        }

        /// Waits until at least `count` subscriptions have been opened.
        pub async fn wait_subscriptions(&self, count: usize) {
            for _ in 0..500 {
                if self.subscription_count() >= count {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            }
            panic!("still {} subscriptions", self.subscription_count());
        }

        /// Injects a live route update into the current subscription.
        pub async fn inject(&self, kind: UpdateKind, route: Route) {
            let sender = self
                .state
                .lock()
                .events
                .clone()
                .expect("no active subscription");
            sender
                .send(RouteUpdate { kind, route })
                .await
                .expect("subscription closed");
        }

        /// Terminates the current subscription with `error`. Updates
        /// already buffered are still delivered first.
        pub fn inject_error(&self, error: SocketError) {
            let mut state = self.state.lock();
            let failure = state.failure.clone().expect("no active subscription");
            *failure.lock() = Some(error);
            state.events = None;
        }
    }

    #[async_trait]
    impl RouteSocket for MockSocket {
        async fn list_routes(&self, family: Family) -> Result<Vec<Route>> {
            let mut state = self.state.lock();
            if state.list_failures > 0 {
                state.list_failures -= 1;
                return Err(Error::Io(io::Error::other("injected list failure")));
            }
            Ok(state.routes.get(&family).cloned().unwrap_or_default())
        }

        fn subscribe(&self, capacity: usize) -> Result<Subscription> {
            let (events_tx, events_rx) = mpsc::channel(capacity);
            let failure = Arc::new(Mutex::new(None));
            let mut state = self.state.lock();
            state.events = Some(events_tx);
            state.failure = Some(failure.clone());
            state.subscriptions += 1;
            Ok(Subscription {
                events: events_rx,
                failure,
            })
        }

        async fn replace_route(&self, route: &Route) -> Result<()> {
            let mut state = self.state.lock();
            if state.install_failures > 0 {
                state.install_failures -= 1;
                return Err(Error::Io(io::Error::other("injected install failure")));
            }
            state.installed.push(route.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn test_round_trip_v4_gateway_route() {
        let route = Route::new(prefix("0.0.0.0/0"), 254)
            .with_protocol(254)
            .with_priority(u32::MAX)
            .with_gateway("192.0.2.1".parse().unwrap());
        let message = message_from_route(&route);
        assert_eq!(route_from_message(&message), Some(route));
    }

    #[test]
    fn test_round_trip_v6_route() {
        let route = Route::new(prefix("2001:db8::/32"), 100)
            .with_protocol(3)
            .with_priority(1024)
            .with_gateway("2001:db8::1".parse().unwrap());
        let message = message_from_route(&route);
        assert_eq!(message.header.address_family, AddressFamily::Inet6);
        assert_eq!(route_from_message(&message), Some(route));
    }

    #[test]
    fn test_round_trip_blackhole() {
        let route = Route::new(prefix("0.0.0.0/0"), 254)
            .with_protocol(254)
            .with_priority(u32::MAX)
            .with_kind(RouteKind::Blackhole);
        let message = message_from_route(&route);
        assert_eq!(message.header.kind, RouteType::BlackHole);
        assert_eq!(route_from_message(&message), Some(route));
    }

    #[test]
    fn test_round_trip_ecmp() {
        let route = Route::new(prefix("10.0.0.0/8"), 254).with_next_hops(NextHops::Multi(vec![
            NextHop {
                gateway: Some("192.0.2.1".parse().unwrap()),
                link: Some(2),
            },
            NextHop {
                gateway: Some("192.0.2.2".parse().unwrap()),
                link: Some(3),
            },
        ]));
        let message = message_from_route(&route);
        assert_eq!(route_from_message(&message), Some(route));
    }

    #[test]
    fn test_round_trip_device_route() {
        let route = Route::new(prefix("192.0.2.0/24"), 254)
            .with_next_hops(NextHops::Single(NextHop::device(7)));
        let message = message_from_route(&route);
        assert_eq!(route_from_message(&message), Some(route));
    }

    #[test]
    fn test_large_table_uses_attribute() {
        let route = Route::new(prefix("10.0.0.0/8"), 5000);
        let message = message_from_route(&route);
        assert_eq!(message.header.table, RT_TABLE_UNSPEC);
        assert!(message
            .attributes
            .iter()
            .any(|attribute| matches!(attribute, RouteAttribute::Table(5000))));
        assert_eq!(route_from_message(&message).unwrap().table, 5000);
    }

    #[test]
    fn test_missing_destination_defaults_to_any() {
        let mut message = RouteMessage::default();
        message.header.address_family = AddressFamily::Inet;
        message.header.table = 254;
        let route = route_from_message(&message).unwrap();
        assert_eq!(route.destination, prefix("0.0.0.0/0"));
        assert_eq!(route.table, 254);
    }

    #[test]
    fn test_non_ip_family_is_skipped() {
        let message = RouteMessage::default();
        assert_eq!(route_from_message(&message), None);
    }
}
