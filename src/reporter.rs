//! Metrics registry shared by all daemon components.
//!
//! Counters and gauges are registered on first use and addressed by name,
//! with per-gateway metrics living under a `gwN.` prefix. Handles are cheap
//! to clone and safe to use from any task; logging itself goes through
//! `tracing` and is not part of this registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// A monotonically adjustable counter.
///
/// `dec` exists for the few metrics that track a current population (for
/// example the number of running gateway handlers).
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicI64>);

impl Counter {
    /// Increments the counter by `n`.
    pub fn inc(&self, n: i64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Decrements the counter by `n`.
    pub fn dec(&self, n: i64) {
        self.0.fetch_sub(n, Ordering::Relaxed);
    }

    /// Returns the current value.
    pub fn count(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge holding the latest reported value.
#[derive(Debug, Clone, Default)]
pub struct Gauge(Arc<AtomicI64>);

impl Gauge {
    /// Replaces the gauge value.
    pub fn update(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// Returns the current value.
    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Registry of named counters and gauges.
#[derive(Debug, Default)]
pub struct Reporter {
    counters: RwLock<HashMap<String, Counter>>,
    gauges: RwLock<HashMap<String, Gauge>>,
}

impl Reporter {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counter registered under `name`, creating it on first
    /// use.
    pub fn counter(&self, name: &str) -> Counter {
        if let Some(counter) = self.counters.read().get(name) {
            return counter.clone();
        }
        self.counters
            .write()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Returns the gauge registered under `name`, creating it on first use.
    pub fn gauge(&self, name: &str) -> Gauge {
        if let Some(gauge) = self.gauges.read().get(name) {
            return gauge.clone();
        }
        self.gauges
            .write()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Returns all metric values, sorted by name. Gauges and counters share
    /// the namespace.
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        let mut snapshot = BTreeMap::new();
        for (name, counter) in self.counters.read().iter() {
            snapshot.insert(name.clone(), counter.count());
        }
        for (name, gauge) in self.gauges.read().iter() {
            snapshot.insert(name.clone(), gauge.value());
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_inc_dec() {
        let reporter = Reporter::new();
        reporter.counter("updates").inc(3);
        reporter.counter("updates").inc(2);
        reporter.counter("updates").dec(1);
        assert_eq!(reporter.counter("updates").count(), 4);
    }

    #[test]
    fn test_gauge_update() {
        let reporter = Reporter::new();
        reporter.gauge("gw1.state").update(2);
        assert_eq!(reporter.gauge("gw1.state").value(), 2);
        reporter.gauge("gw1.state").update(0);
        assert_eq!(reporter.gauge("gw1.state").value(), 0);
    }

    #[test]
    fn test_handles_share_state() {
        let reporter = Reporter::new();
        let first = reporter.counter("count");
        let second = reporter.counter("count");
        first.inc(1);
        assert_eq!(second.count(), 1);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let reporter = Reporter::new();
        reporter.counter("b").inc(2);
        reporter.counter("a").inc(1);
        reporter.gauge("c").update(3);
        let snapshot = reporter.snapshot();
        let names: Vec<_> = snapshot.keys().cloned().collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(snapshot["c"], 3);
    }

    #[test]
    fn test_concurrent_registration() {
        use std::thread;

        let reporter = Arc::new(Reporter::new());
        let mut handles = vec![];
        for _ in 0..8 {
            let reporter = reporter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    reporter.counter("shared").inc(1);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(reporter.counter("shared").count(), 800);
    }
}
