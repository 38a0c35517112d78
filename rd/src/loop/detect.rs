//! Marker detection over the streamed delta buffer
//!
//! Detection runs on the concatenation of message deltas but keeps only a
//! bounded sliding window in memory. Hits are sticky, so detection stays
//! idempotent even after the matching text falls out of the window.

use crate::domain::{COMPLETE_MARKER, ERROR_MARKER, PLAN_READY_MARKER};

/// Sliding-window size. Plenty of room for any marker that may arrive
/// split across deltas.
const WINDOW_CAP: usize = 4096;

/// Incremental scanner for completion, plan-ready and error markers
#[derive(Debug, Clone)]
pub struct MarkerScanner {
    stop_pattern: String,
    window: String,
    found_stop: bool,
    found_plan_ready: bool,
    error: Option<String>,
}

impl MarkerScanner {
    pub fn new(stop_pattern: &str) -> Self {
        Self {
            stop_pattern: stop_pattern.to_string(),
            window: String::new(),
            found_stop: false,
            found_plan_ready: false,
            error: None,
        }
    }

    /// Feed one delta into the scanner
    pub fn push(&mut self, delta: &str) {
        self.window.push_str(delta);
        self.scan();
        self.trim();
    }

    fn scan(&mut self) {
        if !self.found_stop
            && (!self.stop_pattern.is_empty() && self.window.contains(&self.stop_pattern)
                || self.window.contains(COMPLETE_MARKER))
        {
            self.found_stop = true;
        }
        if !self.found_plan_ready && self.window.contains(PLAN_READY_MARKER) {
            self.found_plan_ready = true;
        }
        if let Some(idx) = self.window.find(ERROR_MARKER) {
            let rest = &self.window[idx + ERROR_MARKER.len()..];
            let message = rest.lines().next().unwrap_or("").trim();
            if !message.is_empty() {
                self.error = Some(message.to_string());
            }
        }
    }

    fn trim(&mut self) {
        if self.window.len() <= WINDOW_CAP {
            return;
        }
        let mut cut = self.window.len() - WINDOW_CAP;
        while !self.window.is_char_boundary(cut) {
            cut += 1;
        }
        self.window.drain(..cut);
    }

    /// Stop pattern or the canonical completion marker seen
    pub fn stop_detected(&self) -> bool {
        self.found_stop
    }

    pub fn plan_ready_detected(&self) -> bool {
        self.found_plan_ready
    }

    /// `ERROR:<message>` injected by the backend, if any
    pub fn error_detected(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_stop_pattern() {
        let mut scanner = MarkerScanner::new("DONE_NOW");
        scanner.push("work work ");
        assert!(!scanner.stop_detected());
        scanner.push("all DONE_NOW bye");
        assert!(scanner.stop_detected());
    }

    #[test]
    fn test_detects_canonical_marker_regardless_of_pattern() {
        let mut scanner = MarkerScanner::new("SOMETHING_ELSE");
        scanner.push("finishing up <promise>COMPLETE</promise>");
        assert!(scanner.stop_detected());
    }

    #[test]
    fn test_detects_marker_split_across_deltas() {
        let mut scanner = MarkerScanner::new("COMPLETE");
        scanner.push("<promise>COM");
        assert!(!scanner.plan_ready_detected());
        scanner.push("PLETE</promise>");
        assert!(scanner.stop_detected());
    }

    #[test]
    fn test_detects_plan_ready() {
        let mut scanner = MarkerScanner::new("COMPLETE");
        scanner.push("plan drafted <promise>PLAN_");
        scanner.push("READY</promise>");
        assert!(scanner.plan_ready_detected());
        assert!(!scanner.stop_detected());
    }

    #[test]
    fn test_detects_error_message() {
        let mut scanner = MarkerScanner::new("COMPLETE");
        scanner.push("ERROR:rate limit exceeded\nmore text");
        assert_eq!(scanner.error_detected(), Some("rate limit exceeded"));
    }

    #[test]
    fn test_detection_is_sticky_past_window() {
        let mut scanner = MarkerScanner::new("COMPLETE");
        scanner.push("<promise>COMPLETE</promise>");
        assert!(scanner.stop_detected());

        // Push far more than the window keeps; the hit must survive
        for _ in 0..100 {
            scanner.push(&"x".repeat(256));
        }
        assert!(scanner.stop_detected());
    }

    #[test]
    fn test_window_is_bounded() {
        let mut scanner = MarkerScanner::new("COMPLETE");
        for _ in 0..1000 {
            scanner.push(&"y".repeat(128));
        }
        assert!(scanner.window.len() <= WINDOW_CAP);
    }

    #[test]
    fn test_multibyte_trim_keeps_char_boundary() {
        let mut scanner = MarkerScanner::new("COMPLETE");
        for _ in 0..200 {
            scanner.push(&"日本語テキスト".repeat(8));
        }
        assert!(scanner.window.len() <= WINDOW_CAP + 4);
    }
}
