//! Per-run recording of capability invocations.
//!
//! A [`CallTracker`] is created for exactly one sandbox run and threaded
//! through every capability closure. Calls are opened with [`CallTracker::begin`]
//! before the environment is touched and closed afterwards, so a run that
//! faults mid-way still leaves a complete log.

use crate::core::dedup::{Repeated, collapse};
use crate::core::types::CallRecord;

#[derive(Debug, Clone)]
struct PendingCall {
    method: String,
    args: Vec<String>,
}

#[derive(Debug, Default)]
pub struct CallTracker {
    records: Vec<CallRecord>,
    pending: Option<PendingCall>,
}

impl CallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a call. A call still pending from a previous `begin` is closed as interrupted.
    pub fn begin(&mut self, method: &str, args: Vec<String>) {
        self.interrupt("superseded by another call");
        self.pending = Some(PendingCall {
            method: method.to_string(),
            args,
        });
    }

    pub fn succeed(&mut self) {
        self.close(true, None);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.close(false, Some(error.into()));
    }

    /// Close any pending call as failed with `reason`. No-op when nothing is pending.
    pub fn interrupt(&mut self, reason: &str) {
        if self.pending.is_some() {
            self.close(false, Some(format!("interrupted: {reason}")));
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn records(&self) -> &[CallRecord] {
        &self.records
    }

    pub fn into_records(mut self) -> Vec<CallRecord> {
        self.interrupt("run ended");
        self.records
    }

    /// Human-readable log with consecutive identical lines collapsed.
    pub fn render_deduplicated(&self) -> Vec<String> {
        render_calls(&self.records)
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    fn close(&mut self, success: bool, error: Option<String>) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let hint = error
            .as_deref()
            .and_then(|err| translate_error(&pending.method, err));
        self.records.push(CallRecord {
            method: pending.method,
            args: pending.args,
            success,
            error,
            hint,
        });
    }
}

/// Collapse consecutive identical `signature + outcome` lines.
pub fn render_calls(records: &[CallRecord]) -> Vec<Repeated<String>> {
    collapse(records.iter().map(CallRecord::render))
}

/// Map known environment error shapes to an actionable hint.
pub fn translate_error(method: &str, error: &str) -> Option<String> {
    let lower = error.to_ascii_lowercase();
    let hint = if lower.contains("single character") || lower.contains("item letter") {
        "pass one inventory letter as a string, e.g. drop(\"a\"); read inventory() for letters"
    } else if lower.contains("unknown direction") {
        "use a direction constant such as EAST or Direction::NE"
    } else if lower.contains("can't move") || lower.contains("blocked") {
        "that square is blocked; inspect screen() before moving"
    } else if lower.contains("nothing to attack") || lower.contains("no monster") {
        "no target there; check visible_monsters() first"
    } else if lower.contains("not carrying") || lower.contains("don't have") {
        "item not in inventory; check inventory() first"
    } else if method == "move_to" && lower.contains("out of bounds") {
        "target must be on the map; read position() and screen() first"
    } else {
        return None;
    };
    Some(hint.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies calls are recorded in invocation order with outcomes.
    #[test]
    fn records_calls_in_order() {
        let mut tracker = CallTracker::new();
        tracker.begin("move", vec!["EAST".into()]);
        tracker.succeed();
        tracker.begin("attack", vec!["EAST".into()]);
        tracker.fail("nothing to attack");

        let records = tracker.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].signature(), "move(EAST)");
        assert!(records[0].success);
        assert!(!records[1].success);
        assert_eq!(
            records[1].hint.as_deref(),
            Some("no target there; check visible_monsters() first")
        );
    }

    /// Verifies a pending call is finalized as failed on interrupt.
    #[test]
    fn interrupt_closes_pending_call() {
        let mut tracker = CallTracker::new();
        tracker.begin("search", Vec::new());
        assert!(tracker.has_pending());
        tracker.interrupt("panicked");
        assert!(!tracker.has_pending());

        let records = tracker.into_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].error.as_deref(), Some("interrupted: panicked"));
    }

    /// Verifies the rendering collapses consecutive identical lines only.
    #[test]
    fn deduplicated_rendering() {
        let mut tracker = CallTracker::new();
        for _ in 0..3 {
            tracker.begin("search", Vec::new());
            tracker.succeed();
        }
        tracker.begin("move", vec!["WEST".into()]);
        tracker.succeed();
        tracker.begin("search", Vec::new());
        tracker.succeed();

        assert_eq!(
            tracker.render_deduplicated(),
            vec!["search() ok (x3)", "move(WEST) ok", "search() ok"]
        );
    }

    /// Verifies unknown errors carry no hint.
    #[test]
    fn unknown_errors_have_no_hint() {
        assert_eq!(translate_error("pray", "You feel that Anhur is displeased."), None);
    }
}
