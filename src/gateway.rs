//! Per-gateway agent: candidate bookkeeping, target election and route
//! installation with retry.
//!
//! Each configured gateway runs as one task consuming the observer's
//! notification stream through its own inbox. The agent keeps the set of
//! kernel routes matching its `from` selector, elects the best one, and
//! makes sure its mirror (rewritten to the `to` identity) stays installed.
//! Installation failures are retried forever with exponential backoff; a
//! failing gateway never affects the others.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};

use crate::backoff::ExponentialBackoff;
use crate::config::{GatewayConfig, ToSelector};
use crate::netlink::RouteSocket;
use crate::observer::Notification;
use crate::reporter::Reporter;
use crate::route::{CandidateSet, NextHops, Route, RouteKind, UpdateKind};

/// Gauge values for `gwN.state`.
pub const STATE_MISSING: i64 = 0;
pub const STATE_INSTALLING: i64 = 1;
pub const STATE_INSTALLED: i64 = 2;

const INSTALL_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const INSTALL_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Failure durations after which install errors get louder.
const INSTALL_INFO_DELAY: Duration = Duration::from_secs(5);
const INSTALL_WARNING_DELAY: Duration = Duration::from_secs(30);
const INSTALL_ERROR_DELAY: Duration = Duration::from_secs(60);

/// Builds the route to install from the best candidate and the `to`
/// configuration. Without a candidate, a blackhole route is synthesised
/// when asked for; otherwise there is nothing to install. Only the
/// identity fields are rewritten; ToS, route type and the next-hop
/// payload stay the candidate's.
fn target_route(candidates: &CandidateSet, config: &ToSelector) -> Option<Route> {
    let mut target = match candidates.best() {
        Some(best) => best.clone(),
        None if config.blackhole => Route::new(config.prefix.0, config.table.0)
            .with_kind(RouteKind::Blackhole)
            .with_next_hops(NextHops::None),
        None => return None,
    };
    target.destination = config.prefix.0;
    target.table = config.table.0;
    target.protocol = config.protocol.0;
    target.priority = config.metric;
    Some(target)
}

/// One last-resort gateway and its agent state.
pub struct GatewayAgent {
    index: usize,
    label: String,
    config: GatewayConfig,
    reporter: Arc<Reporter>,
    socket: Arc<dyn RouteSocket>,
    inbox: mpsc::Receiver<Notification>,
    dying: watch::Receiver<bool>,

    candidates: CandidateSet,
    current: Option<Route>,
    backoff: ExponentialBackoff,
    install_at: Option<Instant>,
}

impl GatewayAgent {
    /// Creates the agent for gateway number `index` (1-based).
    pub fn new(
        index: usize,
        config: GatewayConfig,
        reporter: Arc<Reporter>,
        socket: Arc<dyn RouteSocket>,
        inbox: mpsc::Receiver<Notification>,
        dying: watch::Receiver<bool>,
    ) -> Self {
        let label = format!("gw{}<{}-{}>", index, config.from.prefix, config.from.table);
        Self {
            index,
            label,
            config,
            reporter,
            socket,
            inbox,
            dying,
            candidates: CandidateSet::new(),
            current: None,
            backoff: ExponentialBackoff::new(INSTALL_BACKOFF_INITIAL, INSTALL_BACKOFF_MAX),
            install_at: None,
        }
    }

    /// Runs the agent until shutdown.
    pub async fn run(mut self) {
        tracing::info!(gateway = %self.label, "starting gateway handler");
        self.reporter.counter("count").inc(1);
        loop {
            tokio::select! {
                _ = self.dying.changed() => break,

                notification = self.inbox.recv() => {
                    match notification {
                        Some(notification) => self.process_notification(notification),
                        None => break,
                    }
                }

                _ = time::sleep_until(self.install_at.unwrap_or_else(Instant::now)),
                        if self.install_at.is_some() => {
                    self.install_tick().await;
                }
            }
        }
        self.reporter.counter("count").dec(1);
        tracing::info!(gateway = %self.label, "stopping gateway handler");
    }

    fn process_notification(&mut self, notification: Notification) {
        match notification {
            Notification::StartOfRib => {
                tracing::debug!(gateway = %self.label, "received start of RIB event");
                // The kernel's state stays authoritative until the new
                // view stabilises: only the candidates are dropped, not
                // the current target.
                self.candidates.clear();
            }
            Notification::EndOfRib => {
                tracing::debug!(gateway = %self.label, "received end of RIB event");
                self.elect();
            }
            Notification::Update(update) => {
                self.reporter
                    .counter(&format!("gw{}.updates.total", self.index))
                    .inc(1);
                let route = update.route;
                if self.config.to.matches(&route) {
                    self.reporter
                        .counter(&format!("gw{}.updates.target", self.index))
                        .inc(1);
                    match update.kind {
                        UpdateKind::Del => {
                            tracing::debug!(gateway = %self.label, route = %route,
                                "update removes current gateway target");
                            self.current = None;
                            self.elect();
                        }
                        UpdateKind::New => {
                            tracing::debug!(gateway = %self.label, route = %route,
                                "update matches current gateway target");
                            self.current = Some(route);
                            self.elect();
                        }
                    }
                } else if self.config.from.matches(&route) {
                    self.reporter
                        .counter(&format!("gw{}.updates.source", self.index))
                        .inc(1);
                    match update.kind {
                        UpdateKind::Del => {
                            tracing::debug!(gateway = %self.label, route = %route,
                                "update deletes a candidate to gateway");
                            self.candidates.remove(&route);
                            self.elect();
                        }
                        UpdateKind::New => {
                            tracing::debug!(gateway = %self.label, route = %route,
                                "update adds a candidate to gateway");
                            self.candidates.insert(route);
                            self.elect();
                        }
                    }
                } else {
                    self.reporter
                        .counter(&format!("gw{}.updates.alien", self.index))
                        .inc(1);
                }
            }
        }
    }

    /// Elects the target route and triggers installation when it changed.
    fn elect(&mut self) {
        let Some(target) = target_route(&self.candidates, &self.config.to) else {
            tracing::debug!(gateway = %self.label, "no candidate for gateway");
            if self.current.is_none() {
                self.reporter
                    .gauge(&format!("gw{}.state", self.index))
                    .update(STATE_MISSING);
            }
            // An installed route is left alone until something contradicts
            // it.
            return;
        };
        if self.current.as_ref() == Some(&target) {
            tracing::debug!(gateway = %self.label, "no change for gateway");
            return;
        }
        self.reporter
            .counter(&format!("gw{}.changes", self.index))
            .inc(1);
        tracing::info!(
            gateway = %self.label,
            from = %self
                .current
                .as_ref()
                .map(|route| route.to_string())
                .unwrap_or_else(|| "none".to_string()),
            to = %target,
            "last-resort gateway change"
        );
        self.current = Some(target);
        self.reporter
            .gauge(&format!("gw{}.state", self.index))
            .update(STATE_INSTALLING);
        self.backoff.reset();
        // First attempt fires right away, retries follow the backoff.
        self.install_at = Some(Instant::now());
    }

    /// One installation attempt of the current target.
    async fn install_tick(&mut self) {
        self.install_at = None;
        let Some(route) = self.current.clone() else {
            // The target went away while a retry was pending.
            return;
        };
        tracing::debug!(gateway = %self.label, route = %route, "installing route");
        match self.socket.replace_route(&route).await {
            Ok(()) => {
                self.reporter
                    .gauge(&format!("gw{}.state", self.index))
                    .update(STATE_INSTALLED);
            }
            Err(err) => {
                let elapsed = self.backoff.elapsed();
                if elapsed > INSTALL_ERROR_DELAY {
                    tracing::error!(gateway = %self.label, route = %route, error = %err,
                        elapsed = ?elapsed, "unable to install route");
                } else if elapsed > INSTALL_WARNING_DELAY {
                    tracing::warn!(gateway = %self.label, route = %route, error = %err,
                        elapsed = ?elapsed, "unable to install route");
                } else if elapsed > INSTALL_INFO_DELAY {
                    tracing::info!(gateway = %self.label, route = %route, error = %err,
                        elapsed = ?elapsed, "unable to install route");
                } else {
                    tracing::debug!(gateway = %self.label, route = %route, error = %err,
                        elapsed = ?elapsed, "unable to install route");
                }
                self.reporter
                    .counter(&format!("gw{}.install.errors", self.index))
                    .inc(1);
                self.reporter.counter("install.errors").inc(1);
                self.install_at = Some(Instant::now() + self.backoff.next_interval());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FromSelector, Prefix, Protocol, Table};
    use crate::netlink::mock::MockSocket;
    use crate::route::RouteUpdate;

    const SETTLE: Duration = Duration::from_millis(50);

    fn prefix(s: &str) -> Prefix {
        s.parse().unwrap()
    }

    fn route(destination: &str, table: u32) -> Route {
        Route::new(destination.parse().unwrap(), table)
    }

    fn simple_config() -> GatewayConfig {
        GatewayConfig {
            from: FromSelector {
                prefix: prefix("0.0.0.0/0"),
                table: Table(254),
                protocol: None,
                metric: None,
            },
            to: ToSelector {
                prefix: prefix("0.0.0.0/0"),
                table: Table(254),
                protocol: Protocol(254),
                metric: u32::MAX,
                blackhole: false,
            },
        }
    }

    fn blackhole_config() -> GatewayConfig {
        let mut config = simple_config();
        config.to.blackhole = true;
        config
    }

    /// The mirror of the plain default route under the default identity.
    fn mirror() -> Route {
        route("0.0.0.0/0", 254)
            .with_protocol(254)
            .with_priority(u32::MAX)
    }

    fn new_update(route: Route) -> Notification {
        Notification::Update(RouteUpdate {
            kind: UpdateKind::New,
            route,
        })
    }

    fn del_update(route: Route) -> Notification {
        Notification::Update(RouteUpdate {
            kind: UpdateKind::Del,
            route,
        })
    }

    enum Step {
        Notify(Notification),
        /// Let the agent settle, then forget recorded installs.
        Forget,
    }

    struct TestRun {
        last: Option<Route>,
        socket: Arc<MockSocket>,
        reporter: Arc<Reporter>,
    }

    async fn run_gateway(config: GatewayConfig, steps: Vec<Step>) -> TestRun {
        let reporter = Arc::new(Reporter::new());
        let socket = Arc::new(MockSocket::new());
        let (tx, rx) = mpsc::channel(100);
        let (dying_tx, dying_rx) = watch::channel(false);
        let agent = GatewayAgent::new(
            1,
            config,
            reporter.clone(),
            socket.clone() as Arc<dyn RouteSocket>,
            rx,
            dying_rx,
        );
        let task = tokio::spawn(agent.run());
        for step in steps {
            match step {
                Step::Notify(notification) => tx.send(notification).await.unwrap(),
                Step::Forget => {
                    time::sleep(SETTLE).await;
                    socket.clear_installed();
                }
            }
        }
        time::sleep(SETTLE).await;
        let last = socket.last_installed();
        dying_tx.send(true).unwrap();
        task.await.unwrap();
        TestRun {
            last,
            socket,
            reporter,
        }
    }

    #[test]
    fn test_target_route_without_candidate() {
        let to = ToSelector {
            prefix: prefix("10.0.0.0/8"),
            table: Table(254),
            protocol: Protocol(5),
            metric: 1000,
            blackhole: false,
        };
        assert_eq!(target_route(&CandidateSet::new(), &to), None);
    }

    #[test]
    fn test_target_route_synthesises_blackhole() {
        let to = ToSelector {
            prefix: prefix("10.0.0.0/8"),
            table: Table(254),
            protocol: Protocol(5),
            metric: 1000,
            blackhole: true,
        };
        let target = target_route(&CandidateSet::new(), &to).unwrap();
        assert_eq!(
            target,
            route("10.0.0.0/8", 254)
                .with_protocol(5)
                .with_priority(1000)
                .with_kind(RouteKind::Blackhole)
        );
    }

    #[test]
    fn test_target_route_overrides_identity_and_keeps_payload() {
        let mut candidates = CandidateSet::new();
        candidates.insert(
            route("0.0.0.0/0", 254)
                .with_tos(4)
                .with_gateway("192.0.2.1".parse().unwrap()),
        );
        let to = ToSelector {
            prefix: prefix("10.0.0.0/8"),
            table: Table(200),
            protocol: Protocol(254),
            metric: u32::MAX,
            blackhole: false,
        };
        let target = target_route(&candidates, &to).unwrap();
        assert_eq!(
            target,
            route("10.0.0.0/8", 200)
                .with_protocol(254)
                .with_priority(u32::MAX)
                .with_tos(4)
                .with_gateway("192.0.2.1".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_empty_rib_installs_nothing() {
        let run = run_gateway(
            simple_config(),
            vec![
                Step::Notify(Notification::StartOfRib),
                Step::Notify(Notification::EndOfRib),
            ],
        )
        .await;
        assert_eq!(run.last, None);
        assert_eq!(run.reporter.gauge("gw1.state").value(), STATE_MISSING);
    }

    #[tokio::test]
    async fn test_empty_rib_with_blackhole_installs_fallback() {
        let run = run_gateway(
            blackhole_config(),
            vec![
                Step::Notify(Notification::StartOfRib),
                Step::Notify(Notification::EndOfRib),
            ],
        )
        .await;
        assert_eq!(run.last, Some(mirror().with_kind(RouteKind::Blackhole)));
        assert_eq!(run.reporter.gauge("gw1.state").value(), STATE_INSTALLED);
    }

    #[tokio::test]
    async fn test_matching_route_is_mirrored() {
        let run = run_gateway(
            simple_config(),
            vec![
                Step::Notify(Notification::StartOfRib),
                Step::Notify(new_update(route("0.0.0.0/0", 254))),
                Step::Notify(Notification::EndOfRib),
            ],
        )
        .await;
        assert_eq!(run.last, Some(mirror()));
        assert_eq!(run.reporter.counter("gw1.updates.source").count(), 1);
        assert_eq!(run.reporter.counter("gw1.changes").count(), 1);
    }

    #[tokio::test]
    async fn test_non_matching_route_is_alien() {
        let run = run_gateway(
            simple_config(),
            vec![
                Step::Notify(Notification::StartOfRib),
                Step::Notify(new_update(route("10.0.0.0/8", 254))),
                Step::Notify(Notification::EndOfRib),
            ],
        )
        .await;
        assert_eq!(run.last, None);
        assert_eq!(run.reporter.counter("gw1.updates.alien").count(), 1);
        assert_eq!(run.reporter.counter("gw1.updates.total").count(), 1);
    }

    #[tokio::test]
    async fn test_candidate_disappearing_before_end_keeps_install() {
        // The mirror was installed when the candidate appeared; deleting
        // the candidate elects nothing, which leaves the install alone.
        let run = run_gateway(
            simple_config(),
            vec![
                Step::Notify(Notification::StartOfRib),
                Step::Notify(new_update(route("0.0.0.0/0", 254))),
                Step::Notify(del_update(route("0.0.0.0/0", 254))),
                Step::Notify(Notification::EndOfRib),
            ],
        )
        .await;
        assert_eq!(run.last, Some(mirror()));
    }

    #[tokio::test]
    async fn test_candidate_update_replaces_slot() {
        let updated = route("0.0.0.0/0", 254).with_gateway("1.1.1.1".parse().unwrap());
        let run = run_gateway(
            simple_config(),
            vec![
                Step::Notify(Notification::StartOfRib),
                Step::Notify(new_update(route("0.0.0.0/0", 254))),
                Step::Notify(new_update(updated)),
                Step::Notify(Notification::EndOfRib),
            ],
        )
        .await;
        assert_eq!(
            run.last,
            Some(mirror().with_gateway("1.1.1.1".parse().unwrap()))
        );
    }

    #[tokio::test]
    async fn test_worse_candidate_does_not_preempt() {
        let backup = route("0.0.0.0/0", 254)
            .with_priority(200)
            .with_gateway("1.1.1.1".parse().unwrap());
        let run = run_gateway(
            simple_config(),
            vec![
                Step::Notify(Notification::StartOfRib),
                Step::Notify(new_update(route("0.0.0.0/0", 254))),
                Step::Notify(new_update(backup)),
                Step::Notify(Notification::EndOfRib),
            ],
        )
        .await;
        assert_eq!(run.last, Some(mirror()));
        assert_eq!(run.reporter.counter("gw1.changes").count(), 1);
    }

    #[tokio::test]
    async fn test_backup_takes_over_when_candidate_vanishes() {
        let backup = route("0.0.0.0/0", 254)
            .with_priority(200)
            .with_gateway("1.1.1.1".parse().unwrap());
        let run = run_gateway(
            simple_config(),
            vec![
                Step::Notify(Notification::StartOfRib),
                Step::Notify(new_update(route("0.0.0.0/0", 254))),
                Step::Notify(Notification::EndOfRib),
                Step::Notify(new_update(backup)),
                Step::Notify(del_update(route("0.0.0.0/0", 254))),
            ],
        )
        .await;
        // The backup keeps its next hop but takes the mirror identity.
        assert_eq!(
            run.last,
            Some(mirror().with_gateway("1.1.1.1".parse().unwrap()))
        );
    }

    #[tokio::test]
    async fn test_target_deletion_triggers_reinstall() {
        let run = run_gateway(
            simple_config(),
            vec![
                Step::Notify(Notification::StartOfRib),
                Step::Notify(new_update(route("0.0.0.0/0", 254))),
                Step::Notify(Notification::EndOfRib),
                Step::Forget,
                Step::Notify(del_update(mirror())),
            ],
        )
        .await;
        assert_eq!(run.last, Some(mirror()));
        assert_eq!(run.reporter.counter("gw1.updates.target").count(), 1);
    }

    #[tokio::test]
    async fn test_modified_target_is_reinstalled() {
        // The kernel reports our mirror with an unexpected gateway: the
        // election notices the difference and reinstalls the real target.
        let run = run_gateway(
            simple_config(),
            vec![
                Step::Notify(Notification::StartOfRib),
                Step::Notify(new_update(route("0.0.0.0/0", 254))),
                Step::Notify(Notification::EndOfRib),
                Step::Forget,
                Step::Notify(new_update(
                    mirror().with_gateway("1.1.1.1".parse().unwrap()),
                )),
            ],
        )
        .await;
        assert_eq!(run.last, Some(mirror()));
    }

    #[tokio::test]
    async fn test_resync_with_same_routes_does_not_reinstall() {
        // A resync replays the same RIB: the elected target equals the
        // current one and no new install is emitted.
        let run = run_gateway(
            simple_config(),
            vec![
                Step::Notify(Notification::StartOfRib),
                Step::Notify(new_update(route("0.0.0.0/0", 254))),
                Step::Notify(Notification::EndOfRib),
                Step::Forget,
                Step::Notify(Notification::StartOfRib),
                Step::Notify(new_update(route("0.0.0.0/0", 254))),
                Step::Notify(Notification::EndOfRib),
            ],
        )
        .await;
        assert_eq!(run.last, None);
        assert_eq!(run.reporter.counter("gw1.changes").count(), 1);
    }

    #[tokio::test]
    async fn test_install_failure_is_retried_until_success() {
        let reporter = Arc::new(Reporter::new());
        let socket = Arc::new(MockSocket::new());
        socket.fail_installs(2);
        let (tx, rx) = mpsc::channel(100);
        let (dying_tx, dying_rx) = watch::channel(false);
        let agent = GatewayAgent::new(
            1,
            simple_config(),
            reporter.clone(),
            socket.clone() as Arc<dyn RouteSocket>,
            rx,
            dying_rx,
        );
        let task = tokio::spawn(agent.run());

        tx.send(Notification::StartOfRib).await.unwrap();
        tx.send(new_update(route("0.0.0.0/0", 254))).await.unwrap();
        tx.send(Notification::EndOfRib).await.unwrap();

        // Attempts at 0 ms, 100 ms and 300 ms; the third one succeeds.
        time::sleep(Duration::from_millis(600)).await;
        assert_eq!(socket.installed(), vec![mirror()]);
        assert_eq!(reporter.counter("gw1.install.errors").count(), 2);
        assert_eq!(reporter.counter("install.errors").count(), 2);
        assert_eq!(reporter.gauge("gw1.state").value(), STATE_INSTALLED);

        dying_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
