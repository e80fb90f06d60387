//! Prometheus metrics for the protocol engine.
//!
//! Exposed through a process-wide registry; the embedding application
//! decides how to serve it.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Session metrics
    /// Sessions successfully established
    pub sessions_opened_total: IntCounter,
    /// Sessions closed (clean or fatal)
    pub sessions_closed_total: IntCounter,

    // Command metrics
    /// Commands sent, by kind (query/prepare/execute/bulk_execute)
    pub commands_total: IntCounterVec,
    /// Transparent re-prepares after metadata invalidation
    pub reprepares_total: IntCounter,

    // Batch metrics
    /// Batches executed
    pub batches_total: IntCounter,
    /// Batch size distribution
    pub batch_rows: Histogram,

    // Failover metrics
    /// Failover attempts
    pub failovers_total: IntCounter,
    /// Currently blacklisted hosts
    pub blacklisted_hosts: IntGauge,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let sessions_opened_total = IntCounter::with_opts(Opts::new(
            "hermes_sessions_opened_total",
            "Sessions successfully established",
        ))
        .unwrap();

        let sessions_closed_total = IntCounter::with_opts(Opts::new(
            "hermes_sessions_closed_total",
            "Sessions closed",
        ))
        .unwrap();

        let commands_total = IntCounterVec::new(
            Opts::new("hermes_commands_total", "Commands sent by kind"),
            &["kind"],
        )
        .unwrap();

        let reprepares_total = IntCounter::with_opts(Opts::new(
            "hermes_reprepares_total",
            "Transparent statement re-prepares",
        ))
        .unwrap();

        let batches_total = IntCounter::with_opts(Opts::new(
            "hermes_batches_total",
            "Batch executions",
        ))
        .unwrap();

        let batch_rows = Histogram::with_opts(
            HistogramOpts::new("hermes_batch_rows", "Rows per batch")
                .buckets(vec![1.0, 10.0, 100.0, 1000.0, 10000.0]),
        )
        .unwrap();

        let failovers_total = IntCounter::with_opts(Opts::new(
            "hermes_failovers_total",
            "Failover attempts",
        ))
        .unwrap();

        let blacklisted_hosts = IntGauge::with_opts(Opts::new(
            "hermes_blacklisted_hosts",
            "Currently blacklisted hosts",
        ))
        .unwrap();

        registry
            .register(Box::new(sessions_opened_total.clone()))
            .unwrap();
        registry
            .register(Box::new(sessions_closed_total.clone()))
            .unwrap();
        registry.register(Box::new(commands_total.clone())).unwrap();
        registry
            .register(Box::new(reprepares_total.clone()))
            .unwrap();
        registry.register(Box::new(batches_total.clone())).unwrap();
        registry.register(Box::new(batch_rows.clone())).unwrap();
        registry
            .register(Box::new(failovers_total.clone()))
            .unwrap();
        registry
            .register(Box::new(blacklisted_hosts.clone()))
            .unwrap();

        Self {
            registry,
            sessions_opened_total,
            sessions_closed_total,
            commands_total,
            reprepares_total,
            batches_total,
            batch_rows,
            failovers_total,
            blacklisted_hosts,
        }
    }

    pub fn record_session_opened(&self) {
        self.sessions_opened_total.inc();
    }

    pub fn record_session_closed(&self) {
        self.sessions_closed_total.inc();
    }

    pub fn record_command(&self, kind: &str) {
        self.commands_total.with_label_values(&[kind]).inc();
    }

    pub fn record_reprepare(&self) {
        self.reprepares_total.inc();
    }

    pub fn record_batch(&self, rows: usize) {
        self.batches_total.inc();
        self.batch_rows.observe(rows as f64);
    }

    pub fn record_failover(&self) {
        self.failovers_total.inc();
    }

    pub fn set_blacklisted_hosts(&self, count: usize) {
        self.blacklisted_hosts.set(count as i64);
    }
}
