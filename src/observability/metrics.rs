// Supervisor metrics
//
// Counters and gauges for the portal bridge:
// - Spawn requests accepted and rejected by the portal
// - Signal requests and kill escalations
// - Lifecycle signals received, exits discarded, anomalies
// - Processes currently tracked
// - Portal call round-trip latency

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counter metric (monotonically increasing)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Histogram bucket for latency tracking
#[derive(Debug)]
pub struct HistogramBucket {
    pub le: f64, // upper bound in seconds
    pub count: AtomicU64,
}

/// Histogram metric for portal call latency
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum: AtomicU64, // microseconds
    count: AtomicU64,
}

impl Histogram {
    pub fn new_latency() -> Self {
        let buckets = [0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]
            .into_iter()
            .map(|le| HistogramBucket {
                le,
                count: AtomicU64::new(0),
            })
            .collect();

        Self {
            buckets,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_sum_micros(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn get_bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < 0.0001)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// Metrics owned by one supervisor instance
#[derive(Debug)]
pub struct SupervisorMetrics {
    pub launches: Counter,
    pub launch_failures: Counter,
    pub signals_sent: Counter,
    pub signal_failures: Counter,
    pub kill_escalations: Counter,
    pub spawn_started: Counter,
    pub spawn_exited: Counter,
    pub exits_ignored: Counter,
    pub anomalies: Counter,
    pub tracked_processes: Gauge,
    pub call_latency: Histogram,
}

/// Point-in-time copy of [`SupervisorMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub launches: u64,
    pub launch_failures: u64,
    pub signals_sent: u64,
    pub signal_failures: u64,
    pub kill_escalations: u64,
    pub spawn_started: u64,
    pub spawn_exited: u64,
    pub exits_ignored: u64,
    pub anomalies: u64,
    pub tracked_processes: u64,
    pub portal_calls: u64,
}

impl SupervisorMetrics {
    pub fn new() -> Self {
        Self {
            launches: Counter::new(),
            launch_failures: Counter::new(),
            signals_sent: Counter::new(),
            signal_failures: Counter::new(),
            kill_escalations: Counter::new(),
            spawn_started: Counter::new(),
            spawn_exited: Counter::new(),
            exits_ignored: Counter::new(),
            anomalies: Counter::new(),
            tracked_processes: Gauge::new(),
            call_latency: Histogram::new_latency(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            launches: self.launches.get(),
            launch_failures: self.launch_failures.get(),
            signals_sent: self.signals_sent.get(),
            signal_failures: self.signal_failures.get(),
            kill_escalations: self.kill_escalations.get(),
            spawn_started: self.spawn_started.get(),
            spawn_exited: self.spawn_exited.get(),
            exits_ignored: self.exits_ignored.get(),
            anomalies: self.anomalies.get(),
            tracked_processes: self.tracked_processes.get(),
            portal_calls: self.call_latency.get_count(),
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();
        let counters = [
            ("launches_total", "Spawn requests accepted by the portal", &self.launches),
            ("launch_failures_total", "Spawn requests rejected or failed", &self.launch_failures),
            ("signals_sent_total", "SpawnSignal requests accepted", &self.signals_sent),
            ("signal_failures_total", "SpawnSignal requests rejected or failed", &self.signal_failures),
            ("kill_escalations_total", "SIGTERM to SIGKILL escalations", &self.kill_escalations),
            ("spawn_started_total", "SpawnStarted signals received", &self.spawn_started),
            ("spawn_exited_total", "SpawnExited signals received", &self.spawn_exited),
            ("exits_ignored_total", "Exit statuses discarded on request", &self.exits_ignored),
            ("anomalies_total", "Lifecycle signals or queries for untracked PIDs", &self.anomalies),
        ];

        for (name, help, counter) in counters {
            output.push_str(&format!("# HELP portalbox_{} {}\n", name, help));
            output.push_str(&format!("# TYPE portalbox_{} counter\n", name));
            output.push_str(&format!("portalbox_{} {}\n", name, counter.get()));
        }

        output.push_str("# HELP portalbox_tracked_processes Processes awaiting SpawnExited\n");
        output.push_str("# TYPE portalbox_tracked_processes gauge\n");
        output.push_str(&format!(
            "portalbox_tracked_processes {}\n",
            self.tracked_processes.get()
        ));

        output.push_str("# HELP portalbox_call_latency_seconds Portal method call latency\n");
        output.push_str("# TYPE portalbox_call_latency_seconds histogram\n");
        for bucket in &self.call_latency.buckets {
            output.push_str(&format!(
                "portalbox_call_latency_seconds_bucket{{le=\"{}\"}} {}\n",
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "portalbox_call_latency_seconds_sum {}\n",
            self.call_latency.get_sum_micros() as f64 / 1_000_000.0
        ));
        output.push_str(&format!(
            "portalbox_call_latency_seconds_count {}\n",
            self.call_latency.get_count()
        ));

        output
    }
}

impl Default for SupervisorMetrics {
    fn default() -> Self {
        Self::new()
    }
}
