//! Process metrics: atomic counters rendered in Prometheus text format.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Metrics {
    pub register_total: Counter,
    pub heartbeat_total: Counter,
    pub scheduler_file_total: Counter,
    /// Requests answered with a peer handoff.
    pub scheduler_peer_hits: Counter,
    pub report_total: Counter,
    pub jobs_created_total: Counter,
    pub persist_runs_total: Counter,
    pub repos_persisted_total: Counter,
    pub online_nodes: Gauge,
}

impl Metrics {
    /// Prometheus exposition format, one family per counter.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let counters: [(&str, &str, u64); 8] = [
            (
                "scheduler_register_total",
                "Speed node register calls",
                self.register_total.get(),
            ),
            (
                "scheduler_heartbeat_total",
                "Speed node heartbeats",
                self.heartbeat_total.get(),
            ),
            (
                "scheduler_file_requests_total",
                "SchedulerFile decisions",
                self.scheduler_file_total.get(),
            ),
            (
                "scheduler_file_peer_hits_total",
                "SchedulerFile decisions answered with a peer",
                self.scheduler_peer_hits.get(),
            ),
            (
                "scheduler_report_total",
                "Progress reports",
                self.report_total.get(),
            ),
            (
                "scheduler_jobs_created_total",
                "Cache jobs created",
                self.jobs_created_total.get(),
            ),
            (
                "scheduler_persist_runs_total",
                "PersistRepo sweeps",
                self.persist_runs_total.get(),
            ),
            (
                "scheduler_repos_persisted_total",
                "Repositories promoted",
                self.repos_persisted_total.get(),
            ),
        ];
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        }
        out.push_str(&format!(
            "# HELP scheduler_online_nodes Registered online speed nodes\n\
             # TYPE scheduler_online_nodes gauge\nscheduler_online_nodes {}\n",
            self.online_nodes.get()
        ));
        out
    }
}
