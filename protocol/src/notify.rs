//! # Notification Sink Capability
//!
//! The router reports trade progress through three callback slots. How those
//! become toasts, terminal lines, or push notifications is the application
//! shell's problem; the core only promises structured payloads.

use serde::Serialize;

/// A structured notification payload.
///
/// `detail` is free-form JSON so each action can attach what it knows
/// (order id, status, rejection reason, ...) without this crate dictating
/// a rendering schema.
#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    /// Short machine-readable label, e.g. `"trade-completed"`.
    pub code: String,
    /// Human-readable one-liner.
    pub message: String,
    /// Action-specific structured detail.
    pub detail: serde_json::Value,
}

impl Notice {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Callback slots the router invokes as trades progress.
///
/// Implementations must be fast and must not block: these are called on the
/// message-delivery path.
pub trait NotificationSink: Send + Sync {
    /// A trade step succeeded (escrow funded, purchase completed, ...).
    fn on_success(&self, notice: Notice);

    /// Something was rejected or failed (CantDo, payment failure, ...).
    fn on_error(&self, notice: Notice);

    /// Neutral progress information (status changes, informational actions).
    fn on_info(&self, notice: Notice);
}

/// A sink that swallows everything. Default for tests and headless use.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn on_success(&self, _notice: Notice) {}
    fn on_error(&self, _notice: Notice) {}
    fn on_info(&self, _notice: Notice) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Test sink that records every notice it sees.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub notices: Mutex<Vec<(&'static str, Notice)>>,
    }

    impl NotificationSink for RecordingSink {
        fn on_success(&self, notice: Notice) {
            self.notices.lock().push(("success", notice));
        }
        fn on_error(&self, notice: Notice) {
            self.notices.lock().push(("error", notice));
        }
        fn on_info(&self, notice: Notice) {
            self.notices.lock().push(("info", notice));
        }
    }

    #[test]
    fn notice_detail_is_attached() {
        let n = Notice::new("x", "y").with_detail(serde_json::json!({"order": "1"}));
        assert_eq!(n.detail["order"], "1");
    }

    #[test]
    fn recording_sink_captures_slots() {
        let sink = RecordingSink::default();
        sink.on_error(Notice::new("cant-do", "rejected"));
        let notices = sink.notices.lock();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, "error");
        assert_eq!(notices[0].1.code, "cant-do");
    }
}
