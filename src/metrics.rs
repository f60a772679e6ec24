//! Prometheus metrics collection for imgate.
//!
//! Metrics live in `OnceLock` statics registered by [`init`]. Recording
//! before `init` is a silent no-op, so library code (and unit tests) never
//! need a registry.
//!
//! - `imgate_connections` - open client connections (gauge)
//! - `imgate_messages_enqueued_total` / `_dropped_total` / `_evicted_total` - outbound delivery
//! - `imgate_group_fanout` - recipients per group notify (histogram)
//! - `imgate_action_total{action,result}` / `imgate_action_duration_seconds{action}` - dispatch
//! - `imgate_route_calls_total{service,result}` - routed RPC calls

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

// ========================================================================
// Connection registry
// ========================================================================

/// Currently open client connections (pending and signed in).
pub static CONNECTIONS: OnceLock<IntGauge> = OnceLock::new();

/// Messages accepted by an outbound channel.
pub static MESSAGES_ENQUEUED: OnceLock<IntCounter> = OnceLock::new();

/// Messages discarded because an outbound channel was full.
pub static MESSAGES_DROPPED: OnceLock<IntCounter> = OnceLock::new();

/// Connections torn down on overflow or found closed during delivery.
pub static CONNECTIONS_EVICTED: OnceLock<IntCounter> = OnceLock::new();

// ========================================================================
// Group presence
// ========================================================================

pub static ACTIVE_GROUPS: OnceLock<IntGauge> = OnceLock::new();

/// Recipients per group notify.
pub static GROUP_FANOUT: OnceLock<Histogram> = OnceLock::new();

/// Notifies refused by mute gating.
pub static NOTIFY_SUPPRESSED: OnceLock<IntCounter> = OnceLock::new();

// ========================================================================
// Dispatch and routing
// ========================================================================

pub static ACTION_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();

pub static ACTION_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

pub static ROUTE_CALLS: OnceLock<IntCounterVec> = OnceLock::new();

/// Version of the route table snapshot currently published.
pub static ROUTE_TABLE_VERSION: OnceLock<IntGauge> = OnceLock::new();

pub static DISCOVERY_EVENTS: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize the Prometheus metrics registry.
///
/// Must be called once at startup before metrics are scraped.
pub fn init() {
    let r = registry();

    macro_rules! register {
        ($metric:ident, $init:expr) => {
            let m = $init.expect(concat!(stringify!($metric), " creation failed"));
            if let Err(e) = r.register(Box::new(m.clone())) {
                tracing::warn!(
                    error = %e,
                    concat!("Failed to register metric ", stringify!($metric))
                );
            }
            let _ = $metric.set(m);
        };
    }

    register!(CONNECTIONS, IntGauge::new("imgate_connections", "Open client connections"));
    register!(
        MESSAGES_ENQUEUED,
        IntCounter::new("imgate_messages_enqueued_total", "Messages accepted by outbound channels")
    );
    register!(
        MESSAGES_DROPPED,
        IntCounter::new(
            "imgate_messages_dropped_total",
            "Messages dropped on full outbound channels"
        )
    );
    register!(
        CONNECTIONS_EVICTED,
        IntCounter::new("imgate_connections_evicted_total", "Connections evicted during delivery")
    );

    register!(
        ACTIVE_GROUPS,
        IntGauge::new("imgate_active_groups", "Groups held by the presence engine")
    );
    register!(
        GROUP_FANOUT,
        Histogram::with_opts(
            HistogramOpts::new("imgate_group_fanout", "Recipients per group notify")
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0])
        )
    );
    register!(
        NOTIFY_SUPPRESSED,
        IntCounter::new("imgate_notify_suppressed_total", "Group notifies refused by mute gating")
    );

    register!(
        ACTION_COUNTER,
        IntCounterVec::new(
            Opts::new("imgate_action_total", "Client actions dispatched"),
            &["action", "result"]
        )
    );
    register!(
        ACTION_LATENCY,
        HistogramVec::new(
            HistogramOpts::new("imgate_action_duration_seconds", "Client action latency")
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 3.0]),
            &["action"]
        )
    );
    register!(
        ROUTE_CALLS,
        IntCounterVec::new(
            Opts::new("imgate_route_calls_total", "Routed RPC calls"),
            &["service", "result"]
        )
    );
    register!(
        ROUTE_TABLE_VERSION,
        IntGauge::new("imgate_route_table_version", "Published route table version")
    );
    register!(
        DISCOVERY_EVENTS,
        IntCounterVec::new(
            Opts::new("imgate_discovery_events_total", "Discovery watch events applied"),
            &["prefix", "kind"]
        )
    );
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
            String::new()
        }
    }
}

// ============================================================================
// Recording helpers
// ============================================================================

#[inline]
pub fn inc_connected() {
    if let Some(g) = CONNECTIONS.get() {
        g.inc();
    }
}

#[inline]
pub fn dec_connected() {
    if let Some(g) = CONNECTIONS.get() {
        g.dec();
    }
}

#[inline]
pub fn record_enqueued() {
    if let Some(c) = MESSAGES_ENQUEUED.get() {
        c.inc();
    }
}

#[inline]
pub fn record_dropped() {
    if let Some(c) = MESSAGES_DROPPED.get() {
        c.inc();
    }
}

#[inline]
pub fn record_evicted() {
    if let Some(c) = CONNECTIONS_EVICTED.get() {
        c.inc();
    }
}

#[inline]
pub fn set_active_groups(count: i64) {
    if let Some(g) = ACTIVE_GROUPS.get() {
        g.set(count);
    }
}

/// Record message fan-out (how many devices received a group notify).
#[inline]
pub fn record_fanout(recipients: usize) {
    if let Some(h) = GROUP_FANOUT.get() {
        h.observe(recipients as f64);
    }
}

#[inline]
pub fn record_notify_suppressed() {
    if let Some(c) = NOTIFY_SUPPRESSED.get() {
        c.inc();
    }
}

/// Record one dispatched action with its latency and result label.
#[inline]
pub fn record_action(action: &str, result: &str, duration_secs: f64) {
    if let Some(c) = ACTION_COUNTER.get() {
        c.with_label_values(&[action, result]).inc();
    }
    if let Some(h) = ACTION_LATENCY.get() {
        h.with_label_values(&[action]).observe(duration_secs);
    }
}

#[inline]
pub fn record_route_call(service: &str, result: &str) {
    if let Some(c) = ROUTE_CALLS.get() {
        c.with_label_values(&[service, result]).inc();
    }
}

#[inline]
pub fn set_route_table_version(version: u64) {
    if let Some(g) = ROUTE_TABLE_VERSION.get() {
        g.set(version as i64);
    }
}

#[inline]
pub fn record_discovery_event(prefix: &str, kind: &str) {
    if let Some(c) = DISCOVERY_EVENTS.get() {
        c.with_label_values(&[prefix, kind]).inc();
    }
}
