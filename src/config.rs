//! Conversion options.
//!
//! Kept separate from the CLI so library users and tests can build a
//! conversion without going through argument parsing.

use std::path::PathBuf;
use std::time::Duration;

/// Default threshold above which a blocked interval lands on the CPU
/// process's highlight track.
pub const DEFAULT_BLOCKED_THRESHOLD: Duration = Duration::from_millis(3);

/// Configuration for a single conversion run.
#[derive(Debug, Clone)]
pub struct ConvertConfig {
    /// Blocked intervals strictly longer than this are highlighted
    pub blocked_threshold: Duration,
    /// Where the JSON document is written
    pub output: PathBuf,
    /// Portion of the recording to convert
    pub window: TimeWindow,
    /// How scheduler pids are linked to namespace pids
    pub resolve: ResolvePolicy,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        ConvertConfig {
            blocked_threshold: DEFAULT_BLOCKED_THRESHOLD,
            output: PathBuf::from("trace.json"),
            window: TimeWindow::default(),
            resolve: ResolvePolicy::default(),
        }
    }
}

/// Restriction of the conversion to part of the recording.
///
/// Offsets are relative to the first event carrying a non-zero timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeWindow {
    /// Leading time to drop
    pub skip: Duration,
    /// Amount of time to keep after `skip` (None = until the end)
    pub duration: Option<Duration>,
}

impl TimeWindow {
    /// Whether the window keeps everything.
    pub fn is_unbounded(&self) -> bool {
        self.skip.is_zero() && self.duration.is_none()
    }

    /// Absolute bounds in nanoseconds given the first observed timestamp.
    ///
    /// The upper bound is `None` when no duration is configured.
    pub fn bounds(&self, first_ts: u64) -> (u64, Option<u64>) {
        let start = first_ts.saturating_add(duration_ns(self.skip));
        let end = self
            .duration
            .map(|d| start.saturating_add(duration_ns(d)));
        (start, end)
    }
}

/// Precedence knobs for identity resolution.
///
/// Lifecycle evidence (a PERF_RECORD_COMM name confirming a pid pairing) is
/// always tried first; these control the weaker fallbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvePolicy {
    /// Match by command name against the /proc snapshots
    pub name_fallback: bool,
    /// Accept a pid pairing whose name was never confirmed
    pub trust_pairings: bool,
}

impl Default for ResolvePolicy {
    fn default() -> Self {
        ResolvePolicy {
            name_fallback: true,
            trust_pairings: true,
        }
    }
}

/// Convert a `Duration` to whole nanoseconds, saturating at `u64::MAX`.
pub fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
