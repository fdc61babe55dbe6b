//! Supervision of the observer and the gateway agents.
//!
//! The supervisor owns the lifecycle of every task: it wires the observer
//! to the agents through the fan-out, signals shutdown through a shared
//! watch channel and joins everything before returning. The fan-out is the
//! only place where one notification becomes many: each agent gets its own
//! bounded inbox and sees the observer's exact emission order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::DaemonConfig;
use crate::gateway::GatewayAgent;
use crate::netlink::RouteSocket;
use crate::observer::{Notification, Observer};
use crate::reporter::Reporter;

/// Capacity of each gateway agent's inbox. A full inbox blocks the
/// fan-out, slowing everyone down uniformly rather than dropping or
/// reordering notifications.
const INBOX_SIZE: usize = 100;

/// Hooks into the process manager hosting the daemon.
///
/// The supervisor calls [`ready`](Lifecycle::ready) once all components
/// run, then [`watchdog`](Lifecycle::watchdog) on the interval the
/// implementation asks for. Integration with a concrete service manager
/// (systemd and friends) lives outside the core.
pub trait Lifecycle: Send + Sync + 'static {
    /// All components are up.
    fn ready(&self);

    /// How often to tick the watchdog, if at all.
    fn watchdog_interval(&self) -> Option<Duration> {
        None
    }

    /// Periodic liveness tick.
    fn watchdog(&self) {}
}

/// A [`Lifecycle`] that only logs; the default for plain deployments.
pub struct LogLifecycle;

impl Lifecycle for LogLifecycle {
    fn ready(&self) {
        tracing::info!("daemon ready");
    }
}

/// Running daemon components.
pub struct Supervisor {
    dying: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Starts the observer, the fan-out and one agent per configured
    /// gateway.
    pub fn start(
        reporter: Arc<Reporter>,
        socket: Arc<dyn RouteSocket>,
        config: &DaemonConfig,
        lifecycle: Arc<dyn Lifecycle>,
    ) -> Self {
        let (dying_tx, dying_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let mut inboxes = Vec::new();
        for (position, gateway) in config.gateways.iter().enumerate() {
            let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_SIZE);
            inboxes.push(inbox_tx);
            let agent = GatewayAgent::new(
                position + 1,
                gateway.clone(),
                reporter.clone(),
                socket.clone(),
                inbox_rx,
                dying_rx.clone(),
            );
            tasks.push(tokio::spawn(agent.run()));
        }

        let (notifications_tx, notifications_rx) = mpsc::channel(config.netlink.channel_size);
        tasks.push(tokio::spawn(fan_out(
            reporter.clone(),
            notifications_rx,
            inboxes,
            dying_rx.clone(),
        )));

        let observer = Observer::new(
            reporter,
            socket,
            &config.netlink,
            notifications_tx,
            dying_rx.clone(),
        );
        tasks.push(tokio::spawn(observer.run()));

        lifecycle.ready();
        if let Some(interval) = lifecycle.watchdog_interval() {
            tasks.push(tokio::spawn(watchdog(lifecycle, interval, dying_rx)));
        }

        Self {
            dying: dying_tx,
            tasks,
        }
    }

    /// Signals every task to stop and waits for their termination.
    pub async fn shutdown(self) {
        tracing::info!("shutting down");
        let _ = self.dying.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        tracing::info!("all components stopped");
    }
}

/// Delivers every observer notification to every agent, in order. After
/// shutdown is requested, notifications are discarded instead.
async fn fan_out(
    reporter: Arc<Reporter>,
    mut notifications: mpsc::Receiver<Notification>,
    inboxes: Vec<mpsc::Sender<Notification>>,
    mut dying: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = dying.changed() => return,

            notification = notifications.recv() => {
                let Some(notification) = notification else {
                    return;
                };
                for inbox in &inboxes {
                    reporter.counter("notification.count").inc(1);
                    tokio::select! {
                        _ = dying.changed() => return,
                        result = inbox.send(notification.clone()) => {
                            // A gone agent only matters during shutdown.
                            let _ = result;
                        }
                    }
                }
            }
        }
    }
}

async fn watchdog(lifecycle: Arc<dyn Lifecycle>, period: Duration, mut dying: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = dying.changed() => return,
            _ = ticker.tick() => lifecycle.watchdog(),
        }
    }
}
