//! Kernel route observer.
//!
//! The observer owns the route subscription and turns the kernel's view of
//! the FIB into a totally-ordered notification stream for a single
//! downstream consumer: `StartOfRib`, the bulk dump (IPv4 first, then
//! IPv6) and the live updates after `EndOfRib`. On any subscription error
//! it resynchronises from scratch, so consumers never need to care about
//! lost messages: a fresh `StartOfRib` invalidates everything they knew.
//!
//! The state machine mirrors the dump sequence:
//!
//! ```text
//! Idle -> DumpingV4 -> DumpingV6 -> Live
//!            ^                        |
//!            +---- resync backoff ----+
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};

use crate::backoff::ExponentialBackoff;
use crate::config::NetlinkConfig;
use crate::netlink::{RouteSocket, SocketError, Subscription};
use crate::reporter::Reporter;
use crate::route::{Family, Route, RouteUpdate, UpdateKind};
use crate::Result;

/// One event of the observer's notification stream. A `StartOfRib`
/// invalidates all previously seen routes; the updates between it and the
/// matching `EndOfRib` form a complete snapshot of the FIB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    StartOfRib,
    EndOfRib,
    Update(RouteUpdate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FsmState {
    Idle,
    DumpingV4,
    DumpingV6,
    Live,
}

/// The downstream consumer went away; the observer should exit.
struct Stopped;

/// The kernel route observer task. Create it with [`Observer::new`] and
/// drive it with [`Observer::run`].
pub struct Observer {
    reporter: Arc<Reporter>,
    socket: Arc<dyn RouteSocket>,
    channel_size: usize,
    cure_interval: Duration,
    downstream: mpsc::Sender<Notification>,
    dying: watch::Receiver<bool>,

    state: FsmState,
    subscription: Option<Subscription>,
    dump: Option<mpsc::Receiver<Result<Route>>>,
    backoff: ExponentialBackoff,
    transition_at: Option<Instant>,
    cure_at: Option<Instant>,
}

impl Observer {
    /// Creates an observer feeding `downstream` until `dying` fires.
    pub fn new(
        reporter: Arc<Reporter>,
        socket: Arc<dyn RouteSocket>,
        config: &NetlinkConfig,
        downstream: mpsc::Sender<Notification>,
        dying: watch::Receiver<bool>,
    ) -> Self {
        Self {
            reporter,
            socket,
            channel_size: config.channel_size,
            cure_interval: Duration::from_millis(config.cure_interval),
            downstream,
            dying,
            state: FsmState::Idle,
            subscription: None,
            dump: None,
            backoff: ExponentialBackoff::new(
                Duration::from_millis(config.backoff_interval),
                Duration::from_millis(config.backoff_max_interval),
            ),
            transition_at: None,
            cure_at: None,
        }
    }

    /// Runs the observer until shutdown or until the downstream is gone.
    pub async fn run(mut self) {
        tracing::debug!("starting route observer");
        if self.transition().await.is_err() {
            return;
        }
        loop {
            tokio::select! {
                _ = self.dying.changed() => break,

                _ = time::sleep_until(self.transition_at.unwrap_or_else(Instant::now)),
                        if self.transition_at.is_some() => {
                    self.transition_at = None;
                    if self.transition().await.is_err() {
                        break;
                    }
                }

                _ = time::sleep_until(self.cure_at.unwrap_or_else(Instant::now)),
                        if self.cure_at.is_some() => {
                    tracing::debug!("no netlink error since a while, resync backoff reset");
                    self.cure_at = None;
                }

                item = recv_dump(&mut self.dump), if self.dump.is_some() => {
                    if self.handle_dump_item(item).await.is_err() {
                        break;
                    }
                }

                update = recv_live(&mut self.subscription),
                        if self.state == FsmState::Live && self.subscription.is_some() => {
                    if self.handle_live_update(update).await.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("route observer stopped");
    }

    /// Moves the FSM one step forward. `Idle` also covers re-entry after a
    /// resync: the previous subscription is gone and a fresh cycle starts.
    async fn transition(&mut self) -> std::result::Result<(), Stopped> {
        tracing::debug!(state = ?self.state, "route observer transition");
        match self.state {
            FsmState::Idle => {
                // Subscribe before dumping so updates racing the dump are
                // buffered instead of lost.
                match self.socket.subscribe(self.channel_size) {
                    Ok(subscription) => self.subscription = Some(subscription),
                    Err(err) => {
                        tracing::error!(error = %err, "cannot subscribe to route updates");
                        self.resync_later();
                        return Ok(());
                    }
                }
                self.notify(Notification::StartOfRib).await?;
                self.dump = Some(self.spawn_dump(Family::V4));
                self.state = FsmState::DumpingV4;
            }
            FsmState::DumpingV4 => {
                self.dump = Some(self.spawn_dump(Family::V6));
                self.state = FsmState::DumpingV6;
            }
            FsmState::DumpingV6 => {
                self.notify(Notification::EndOfRib).await?;
                self.state = FsmState::Live;
            }
            FsmState::Live => unreachable!("no transition out of the live state"),
        }
        Ok(())
    }

    /// Spawns the short-lived task injecting one family's routes.
    fn spawn_dump(&self, family: Family) -> mpsc::Receiver<Result<Route>> {
        let (tx, rx) = mpsc::channel(self.channel_size);
        let socket = Arc::clone(&self.socket);
        let reporter = Arc::clone(&self.reporter);
        tokio::spawn(async move {
            match socket.list_routes(family).await {
                Ok(routes) => {
                    tracing::debug!(count = routes.len(), family = %family,
                        "enumerated initial routes");
                    let counter = match family {
                        Family::V4 => reporter.counter("route.initial.ipv4"),
                        Family::V6 => reporter.counter("route.initial.ipv6"),
                    };
                    for route in routes {
                        if tx.send(Ok(route)).await.is_err() {
                            return;
                        }
                        counter.inc(1);
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                }
            }
        });
        rx
    }

    async fn handle_dump_item(
        &mut self,
        item: Option<Result<Route>>,
    ) -> std::result::Result<(), Stopped> {
        match item {
            Some(Ok(route)) => {
                self.notify(Notification::Update(RouteUpdate {
                    kind: UpdateKind::New,
                    route,
                }))
                .await?;
            }
            Some(Err(err)) => {
                tracing::error!(error = %err, "cannot enumerate initial routes");
                self.resync_later();
            }
            None => {
                // This family is exhausted, move on.
                self.dump = None;
                self.transition().await?;
            }
        }
        Ok(())
    }

    async fn handle_live_update(
        &mut self,
        update: Option<RouteUpdate>,
    ) -> std::result::Result<(), Stopped> {
        match update {
            Some(update) => {
                self.reporter.counter("route.updates").inc(1);
                self.notify(Notification::Update(update)).await?;
            }
            None => {
                let error = self
                    .subscription
                    .take()
                    .and_then(|mut subscription| subscription.take_error());
                match error {
                    Some(SocketError::Overflow) => {
                        tracing::info!("netlink receive buffer too small");
                        self.reporter.counter("error.overflow").inc(1);
                    }
                    Some(SocketError::Other(err)) => {
                        tracing::error!(error = %err,
                            "fatal error while receiving route updates");
                        self.reporter.counter("error.unknown").inc(1);
                    }
                    None => {
                        tracing::error!("route subscription closed unexpectedly");
                        self.reporter.counter("error.unknown").inc(1);
                    }
                }
                self.resync_later();
            }
        }
        Ok(())
    }

    /// Schedules a full resync after the current backoff interval. The
    /// backoff resets only when the previous error episode is older than
    /// the cure interval.
    fn resync_later(&mut self) {
        self.subscription = None;
        self.dump = None;
        self.state = FsmState::Idle;
        if self.cure_at.is_none() {
            self.backoff.reset();
            self.cure_at = Some(Instant::now() + self.cure_interval);
        }
        let delay = self.backoff.next_interval();
        tracing::debug!(delay = ?delay, elapsed = ?self.backoff.elapsed(),
            "sleeping before netlink resync");
        self.transition_at = Some(Instant::now() + delay);
    }

    async fn notify(&self, notification: Notification) -> std::result::Result<(), Stopped> {
        self.downstream
            .send(notification)
            .await
            .map_err(|_| Stopped)
    }
}

async fn recv_dump(dump: &mut Option<mpsc::Receiver<Result<Route>>>) -> Option<Result<Route>> {
    match dump {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_live(subscription: &mut Option<Subscription>) -> Option<RouteUpdate> {
    match subscription {
        Some(subscription) => loop {
            let update = subscription.recv().await?;
            if update.route.table == 0 {
                // Unspecified-table sentinel from the socket layer, never
                // a user-visible route.
                continue;
            }
            return Some(update);
        },
        None => std::future::pending().await,
    }
}
