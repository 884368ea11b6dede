//! Non-fatal findings collected while converting a recording.
//!
//! Each pipeline stage returns its own stats value next to its output; the
//! driver gathers them into a [`ConversionReport`]. Nothing in here is ever
//! written into the output document.

use std::fmt;

use tracing::warn;

use crate::identity::ResolveStats;
use crate::metadata::MetadataStats;
use crate::perf_script::ParseStats;
use crate::timeline::TimelineStats;

/// How many individual findings are retained per stage for reporting.
pub const MAX_SAMPLES: usize = 8;

/// A single non-fatal finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A line in the process snapshot sections that isn't /proc/<pid>/stat.
    MalformedStatLine { line: usize, text: String },
    /// A `perf script` line that matched no known record shape.
    UnrecognizedLine { line: usize, text: String },
    /// A known record type whose payload or numbers failed to parse.
    MalformedRecord {
        line: usize,
        kind: String,
        text: String,
    },
    /// Several snapshot processes carry the same name; none was picked.
    AmbiguousName {
        sched_pid: i32,
        comm: String,
        candidates: Vec<i32>,
    },
    /// No evidence linked the scheduler pid to a thread.
    Unresolved { sched_pid: i32, comm: String },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::MalformedStatLine { line, text } => {
                write!(f, "metadata line {line}: not a /proc stat line: {text}")
            }
            Diagnostic::UnrecognizedLine { line, text } => {
                write!(f, "perf script line {line}: unrecognized record: {text}")
            }
            Diagnostic::MalformedRecord { line, kind, text } => {
                write!(f, "perf script line {line}: malformed {kind}: {text}")
            }
            Diagnostic::AmbiguousName {
                sched_pid,
                comm,
                candidates,
            } => {
                write!(
                    f,
                    "pid {sched_pid} ({comm}): name matches snapshot pids {candidates:?}"
                )
            }
            Diagnostic::Unresolved { sched_pid, comm } => {
                write!(f, "pid {sched_pid} ({comm}): no matching thread found")
            }
        }
    }
}

/// Bounded collection of findings: counts everything, keeps the first few.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Total number of findings recorded.
    pub total: usize,
    /// The first [`MAX_SAMPLES`] findings.
    pub samples: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.total += 1;
        if self.samples.len() < MAX_SAMPLES {
            self.samples.push(diagnostic);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    fn log(&self, what: &str) {
        if self.is_empty() {
            return;
        }
        warn!("{} {what}", self.total);
        for sample in &self.samples {
            warn!("  {sample}");
        }
        if self.total > self.samples.len() {
            warn!("  ... and {} more", self.total - self.samples.len());
        }
    }
}

/// Everything the stages had to say about one conversion.
#[derive(Debug, Clone, Default)]
pub struct ConversionReport {
    pub metadata: MetadataStats,
    pub parse: ParseStats,
    pub resolve: ResolveStats,
    pub timeline: TimelineStats,
    /// Number of records in the output document
    pub emitted_events: usize,
}

impl ConversionReport {
    /// Returns true if any stage recorded something worth a warning.
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.metadata.diagnostics.is_empty()
            || !self.parse.diagnostics.is_empty()
            || !self.resolve.diagnostics.is_empty()
    }

    /// Emit the end-of-run summary through `tracing`.
    pub fn log_warnings(&self) {
        self.metadata
            .diagnostics
            .log("malformed process snapshot line(s) skipped");
        self.parse
            .diagnostics
            .log("perf script line(s) dropped");
        if self.resolve.unresolved > 0 {
            warn!(
                "{} thread(s) could not be linked to a process; shown as unresolved",
                self.resolve.unresolved
            );
        }
        self.resolve
            .diagnostics
            .log("identity resolution finding(s)");
        if self.timeline.out_of_order > 0 {
            warn!(
                "{} switch event(s) went back in time on their CPU",
                self.timeline.out_of_order
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_keep_first_samples() {
        let mut diags = Diagnostics::default();
        for line in 0..(MAX_SAMPLES + 5) {
            diags.push(Diagnostic::UnrecognizedLine {
                line,
                text: "junk".to_string(),
            });
        }
        assert_eq!(diags.total, MAX_SAMPLES + 5);
        assert_eq!(diags.samples.len(), MAX_SAMPLES);
        assert_eq!(
            diags.samples[0],
            Diagnostic::UnrecognizedLine {
                line: 0,
                text: "junk".to_string()
            }
        );
    }

    #[test]
    fn test_diagnostic_display() {
        let d = Diagnostic::AmbiguousName {
            sched_pid: 42,
            comm: "worker".to_string(),
            candidates: vec![10, 11],
        };
        assert_eq!(
            d.to_string(),
            "pid 42 (worker): name matches snapshot pids [10, 11]"
        );
    }

    #[test]
    fn test_empty_report_has_no_warnings() {
        assert!(!ConversionReport::default().has_warnings());
    }
}
