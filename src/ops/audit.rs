use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use tracing::event;

/// Channel lifecycle and flow-control event types emitted by the session
/// engine.
pub const CHANNEL_CREATE: &str = "channel_create";
pub const CHANNEL_CLOSE: &str = "channel_close";
pub const CHANNEL_CLOSE_FORCED: &str = "channel_close_forced";
pub const FLOW_ENFORCED: &str = "flow_enforced";
pub const FLOW_REMOVED: &str = "flow_removed";
pub const LARGE_TRANSACTION: &str = "large_transaction";
pub const DTX_TIMEOUT: &str = "dtx_timeout";

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub event_type: String,
    /// Channel log subject, e.g. `[conn:3(guest)]`.
    pub subject: String,
    pub detail: String,
}

#[derive(Clone, Default)]
pub struct AuditSink {
    inner: Arc<Mutex<Vec<AuditEvent>>>,
}

impl AuditSink {
    pub fn record(&self, event: AuditEvent) {
        self.inner.lock().push(event);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static AUDIT_SINK: OnceLock<AuditSink> = OnceLock::new();

pub fn install_sink(sink: AuditSink) {
    let _ = AUDIT_SINK.set(sink);
}

/// Copy of every recorded event, for mirroring to external sinks and for
/// assertions in tests.
pub fn snapshot() -> Vec<AuditEvent> {
    AUDIT_SINK
        .get()
        .map(|sink| sink.inner.lock().clone())
        .unwrap_or_default()
}

/// Recorded events whose subject matches exactly.
pub fn snapshot_for(subject: &str) -> Vec<AuditEvent> {
    AUDIT_SINK
        .get()
        .map(|sink| {
            sink.inner
                .lock()
                .iter()
                .filter(|e| e.subject == subject)
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

/// Emit a structured audit event and record it in the process-wide sink.
pub fn emit(event_type: &str, subject: &str, detail: &str) {
    event!(
        target: "audit",
        tracing::Level::INFO,
        %event_type,
        %subject,
        %detail
    );
    let sink = AUDIT_SINK.get_or_init(AuditSink::default);
    sink.record(AuditEvent {
        event_type: event_type.to_string(),
        subject: subject.to_string(),
        detail: detail.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_records_into_sink() {
        emit(FLOW_ENFORCED, "[test-audit:1(guest)]", "orders");
        let events = snapshot_for("[test-audit:1(guest)]");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, FLOW_ENFORCED);
        assert_eq!(events[0].detail, "orders");
    }
}
