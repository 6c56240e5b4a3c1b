use std::collections::HashMap;
use std::fmt::Write as _;

use parking_lot::Mutex;

/// In-process metric registry, rendered as Prometheus text exposition
/// on the admin listener.
#[derive(Debug, Default)]
struct TelemetryState {
    pages_total: HashMap<String, u64>,
    builds_started_total: u64,
    builds_total: HashMap<String, u64>,
    tlog_records: u64,
    goproxy_latest_total: HashMap<String, u64>,
    verify_mismatch_total: u64,
}

#[derive(Debug, Default)]
pub struct Telemetry {
    state: Mutex<TelemetryState>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_page(&self, page: &str) {
        let mut guard = self.state.lock();
        let entry = guard.pages_total.entry(page.to_string()).or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn record_build_started(&self) {
        let mut guard = self.state.lock();
        guard.builds_started_total = guard.builds_started_total.saturating_add(1);
    }

    /// `result` is "ok" or a failure kind.
    pub fn record_build(&self, result: &str) {
        let mut guard = self.state.lock();
        let entry = guard.builds_total.entry(result.to_string()).or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn set_tlog_records(&self, count: u64) {
        self.state.lock().tlog_records = count;
    }

    pub fn record_goproxy_latest(&self, result: &str) {
        let mut guard = self.state.lock();
        let entry = guard
            .goproxy_latest_total
            .entry(result.to_string())
            .or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn record_verify_mismatch(&self) {
        let mut guard = self.state.lock();
        guard.verify_mismatch_total = guard.verify_mismatch_total.saturating_add(1);
    }

    pub fn render(&self) -> String {
        let guard = self.state.lock();
        let mut out = String::new();
        out.push_str("# TYPE gobuild_pages_total counter\n");
        for (page, value) in &guard.pages_total {
            let _ = writeln!(out, "gobuild_pages_total{{page=\"{}\"}} {}", page, value);
        }
        out.push_str("# TYPE gobuild_builds_started_total counter\n");
        let _ = writeln!(
            out,
            "gobuild_builds_started_total {}",
            guard.builds_started_total
        );
        out.push_str("# TYPE gobuild_builds_total counter\n");
        for (result, value) in &guard.builds_total {
            let _ = writeln!(
                out,
                "gobuild_builds_total{{result=\"{}\"}} {}",
                result, value
            );
        }
        out.push_str("# TYPE gobuild_tlog_records gauge\n");
        let _ = writeln!(out, "gobuild_tlog_records {}", guard.tlog_records);
        out.push_str("# TYPE gobuild_goproxy_latest_total counter\n");
        for (result, value) in &guard.goproxy_latest_total {
            let _ = writeln!(
                out,
                "gobuild_goproxy_latest_total{{result=\"{}\"}} {}",
                result, value
            );
        }
        out.push_str("# TYPE gobuild_verify_mismatch_total counter\n");
        let _ = writeln!(
            out,
            "gobuild_verify_mismatch_total {}",
            guard.verify_mismatch_total
        );
        out
    }
}
