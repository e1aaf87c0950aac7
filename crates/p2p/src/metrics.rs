//! Domain metrics for the sync client and server.
//!
//! Metrics are domain-specific rather than generic event counters; use
//! traces for event-level granularity during investigations.

use prometheus::{register_counter, Counter};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Domain-specific metrics for sync monitoring.
pub struct Metrics {
    // === Client ===
    /// Blocks promoted out of quarantine to the receiver.
    pub blocks_promoted: Counter,
    /// Quarantined blocks dropped without ever becoming trusted.
    pub untrusted_evictions: Counter,
    /// Peer exchanges that failed (transport, protocol, or validation).
    pub requests_failed: Counter,

    // === Server ===
    /// Responses served to peers.
    pub payloads_served: Counter,
    /// Streams dropped because admission throttling hit its ceiling.
    pub admissions_expired: Counter,
    /// Requests rejected by range validation.
    pub requests_rejected: Counter,
}

fn metrics() -> &'static Metrics {
    METRICS.get_or_init(|| Metrics {
        blocks_promoted: register_counter!(
            "opsync_blocks_promoted_total",
            "Blocks promoted out of quarantine to the receiver"
        )
        .unwrap(),
        untrusted_evictions: register_counter!(
            "opsync_untrusted_evictions_total",
            "Quarantined blocks dropped without ever becoming trusted"
        )
        .unwrap(),
        requests_failed: register_counter!(
            "opsync_requests_failed_total",
            "Peer exchanges that failed"
        )
        .unwrap(),
        payloads_served: register_counter!(
            "opsync_payloads_served_total",
            "Responses served to peers"
        )
        .unwrap(),
        admissions_expired: register_counter!(
            "opsync_admissions_expired_total",
            "Streams dropped at the admission throttling ceiling"
        )
        .unwrap(),
        requests_rejected: register_counter!(
            "opsync_requests_rejected_total",
            "Requests rejected by range validation"
        )
        .unwrap(),
    })
}

pub fn record_block_promoted() {
    metrics().blocks_promoted.inc();
}

pub fn record_untrusted_eviction() {
    metrics().untrusted_evictions.inc();
}

pub fn record_request_failed() {
    metrics().requests_failed.inc();
}

pub fn record_payload_served() {
    metrics().payloads_served.inc();
}

pub fn record_admission_expired() {
    metrics().admissions_expired.inc();
}

pub fn record_request_rejected() {
    metrics().requests_rejected.inc();
}
