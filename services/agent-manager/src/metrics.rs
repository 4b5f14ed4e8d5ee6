// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Prometheus metrics for the agent manager
//!
//! Exports metrics for monitoring agent traffic including:
//! - Installed attaches by kind
//! - Requests sent, timeouts and disconnects
//! - Cluster forwarding failures and rebalance outcomes

use prometheus::{Counter, CounterVec, GaugeVec, Opts, Registry, TextEncoder};

// Static metric initialization uses expect because these are compile-time
// constant definitions that cannot fail in practice. If they do fail, it indicates
// a programming error (e.g., invalid metric name) that should cause a panic at startup.
#[allow(clippy::expect_used)]
mod metrics_impl {
    use super::*;
    use lazy_static::lazy_static;

    lazy_static! {
        /// Registry for all agent manager metrics
        pub static ref REGISTRY: Registry = Registry::new();

        /// Attaches currently installed, by kind
        pub static ref ATTACHES: GaugeVec = GaugeVec::new(
            Opts::new(
                "agent_manager_attaches",
                "Attaches currently installed in the ownership table"
            ),
            &["kind"]
        ).expect("valid metric name");

        /// Requests handed to an attache
        pub static ref REQUESTS: CounterVec = CounterVec::new(
            Opts::new(
                "agent_manager_requests_total",
                "Total requests sent to agents"
            ),
            &["in_sequence"]
        ).expect("valid metric name");

        /// Synchronous sends that gave up waiting
        pub static ref TIMEOUTS: CounterVec = CounterVec::new(
            Opts::new(
                "agent_manager_timeouts_total",
                "Total synchronous sends that timed out"
            ),
            &["kind"]
        ).expect("valid metric name");

        /// Agent disconnects by the event applied to the host
        pub static ref DISCONNECTS: CounterVec = CounterVec::new(
            Opts::new(
                "agent_manager_disconnects_total",
                "Total agent disconnects"
            ),
            &["event"]
        ).expect("valid metric name");

        /// Requests that could not be forwarded to the owning peer
        pub static ref FORWARD_FAILURES: Counter = Counter::with_opts(
            Opts::new(
                "agent_manager_forward_failures_total",
                "Total requests that exhausted their forwarding attempts"
            )
        ).expect("valid metric name");

        /// Agent transfers by outcome
        pub static ref REBALANCES: CounterVec = CounterVec::new(
            Opts::new(
                "agent_manager_rebalances_total",
                "Total agent ownership transfers"
            ),
            &["outcome"]
        ).expect("valid metric name");
    }
}

pub use metrics_impl::{
    ATTACHES, DISCONNECTS, FORWARD_FAILURES, REBALANCES, REGISTRY, REQUESTS, TIMEOUTS,
};

/// Register all metrics with the registry
///
/// Should be called once during application startup.
/// Panics if registration fails (indicates a programming error).
#[allow(clippy::expect_used)]
pub fn register_metrics() {
    REGISTRY
        .register(Box::new(ATTACHES.clone()))
        .expect("Failed to register ATTACHES");
    REGISTRY
        .register(Box::new(REQUESTS.clone()))
        .expect("Failed to register REQUESTS");
    REGISTRY
        .register(Box::new(TIMEOUTS.clone()))
        .expect("Failed to register TIMEOUTS");
    REGISTRY
        .register(Box::new(DISCONNECTS.clone()))
        .expect("Failed to register DISCONNECTS");
    REGISTRY
        .register(Box::new(FORWARD_FAILURES.clone()))
        .expect("Failed to register FORWARD_FAILURES");
    REGISTRY
        .register(Box::new(REBALANCES.clone()))
        .expect("Failed to register REBALANCES");
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

pub fn set_attaches(kind: &str, count: usize) {
    ATTACHES.with_label_values(&[kind]).set(count as f64);
}

pub fn record_request(in_sequence: bool) {
    let label = if in_sequence { "true" } else { "false" };
    REQUESTS.with_label_values(&[label]).inc();
}

pub fn record_timeout(kind: &str) {
    TIMEOUTS.with_label_values(&[kind]).inc();
}

pub fn record_disconnect(event: &str) {
    DISCONNECTS.with_label_values(&[event]).inc();
}

pub fn record_forward_failure() {
    FORWARD_FAILURES.inc();
}

pub fn record_rebalance(outcome: &str) {
    REBALANCES.with_label_values(&[outcome]).inc();
}
