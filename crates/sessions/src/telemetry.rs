//! Counters and gauges for the session lifecycle. No-ops without the `metrics` feature.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

pub(crate) fn session_created() {
    #[cfg(feature = "metrics")]
    counter!("wagate_sessions_created_total").increment(1);
}

pub(crate) fn session_expired(reason: &'static str) {
    #[cfg(feature = "metrics")]
    counter!("wagate_sessions_expired_total", "reason" => reason).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = reason;
}

pub(crate) fn reconnect_attempt() {
    #[cfg(feature = "metrics")]
    counter!("wagate_reconnect_attempts_total").increment(1);
}

pub(crate) fn message_received() {
    #[cfg(feature = "metrics")]
    counter!("wagate_messages_received_total").increment(1);
}

pub(crate) fn message_sent() {
    #[cfg(feature = "metrics")]
    counter!("wagate_messages_sent_total").increment(1);
}

pub(crate) fn webhook_failed() {
    #[cfg(feature = "metrics")]
    counter!("wagate_webhook_failures_total").increment(1);
}

pub(crate) fn active_sessions(count: usize) {
    #[cfg(feature = "metrics")]
    gauge!("wagate_sessions_active").set(count as f64);
    #[cfg(not(feature = "metrics"))]
    let _ = count;
}
