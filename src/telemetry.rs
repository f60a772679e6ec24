//! Telemetry utilities for action timing and span construction.

use std::time::Instant;

/// Guard for timing one dispatched action.
///
/// Records latency and the result label when dropped; the label defaults
/// to `"ok"` until [`ActionTimer::fail`] is called.
pub struct ActionTimer {
    action: String,
    result: &'static str,
    start: Instant,
}

impl ActionTimer {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            result: "ok",
            start: Instant::now(),
        }
    }

    /// Label this action with an error code.
    pub fn fail(&mut self, code: &'static str) {
        self.result = code;
    }
}

impl Drop for ActionTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        crate::metrics::record_action(&self.action, self.result, duration);
    }
}

/// Standardized span constructors.
pub mod spans {
    use imgate_proto::{Gid, Uid};
    use tracing::{Span, info_span};

    /// Span for a client connection.
    pub fn connection(conn: Uid, peer: &str) -> Span {
        info_span!("connection", conn = conn, peer = %peer)
    }

    /// Span for a routed call.
    pub fn route(action: &str, service: &str, instance: &str) -> Span {
        info_span!("route", action = %action, service = %service, instance = %instance)
    }

    /// Span for a group fan-out.
    pub fn fanout(gid: Gid, sender: Uid) -> Span {
        info_span!("fanout", gid = gid, sender = sender)
    }
}
