//! Metrics for holdfast.

use iroh_metrics::{
    core::{Counter, Metric},
    struct_iterable::Iterable,
};

/// Counters for the access controller and the pin coordinator.
#[allow(missing_docs)]
#[derive(Debug, Clone, Iterable)]
pub struct Metrics {
    pub entries_admitted: Counter,
    pub entries_rejected: Counter,

    pub pin_requests_received: Counter,
    pub pin_requests_invalid: Counter,
    pub pin_requests_mismatched: Counter,
    pub pin_requests_duplicate: Counter,
    pub databases_pinned: Counter,
    pub pin_failures: Counter,

    pub peers_discovered: Counter,
    pub peers_connected: Counter,
    pub peers_disconnected: Counter,

    pub pinner_tick_main: Counter,
    pub pinner_tick_liveness: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            entries_admitted: Counter::new("Number of log entries admitted by the access controller"),
            entries_rejected: Counter::new("Number of log entries rejected by the access controller"),

            pin_requests_received: Counter::new("Number of pin requests received on the topic"),
            pin_requests_invalid: Counter::new("Number of pin requests that failed to decode"),
            pin_requests_mismatched: Counter::new(
                "Number of pin requests whose manifest named a different access controller",
            ),
            pin_requests_duplicate: Counter::new(
                "Number of pin requests for an already pending or pinned database",
            ),
            databases_pinned: Counter::new("Number of databases opened for replication"),
            pin_failures: Counter::new("Number of pin attempts that failed"),

            peers_discovered: Counter::new("Number of peer discovery events observed"),
            peers_connected: Counter::new("Number of peer connect events observed"),
            peers_disconnected: Counter::new("Number of peer disconnect events observed"),

            pinner_tick_main: Counter::new("Number of times the pin actor loop ticked"),
            pinner_tick_liveness: Counter::new("Number of liveness ticks in the pin actor"),
        }
    }
}

impl Metric for Metrics {
    fn name() -> &'static str {
        "holdfast"
    }
}
