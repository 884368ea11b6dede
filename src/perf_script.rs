//! Parser for `perf script` output.
//!
//! The capture runs `perf script --show-task-events --fields
//! pid,tid,cpu,time,event,trace --ns`, which yields two shapes of line:
//!
//! ```text
//! 1234/1234  [002] 3376096.441959680:  sched:sched_switch: prev_comm=sshd prev_pid=1234 ...
//! 6802/6802  [004] 926991.760617747: PERF_RECORD_COMM exec: ifconfig:6802/6802
//! ^^^^ ^^^^   ^^^  ^^^^^^^^^^^^^^^^
//! pid  tid    cpu  timestamp
//! ```
//!
//! The leading pid/tid is the task that was current when the record was
//! taken, numbered the way perf sees it. Pids inside `sched:` payloads are
//! the scheduler's own numbering, which can differ when perf runs in a pid
//! namespace; [`crate::identity`] links the two.
//!
//! Parsing never fails as a whole: unknown or mangled lines are dropped
//! and counted in [`ParseStats`].

use std::collections::BTreeMap;
use std::iter::Enumerate;
use std::str::Lines;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::debug;

use crate::diagnostics::{Diagnostic, Diagnostics};

/// Fields common to every record line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Pid of the current task, perf numbering
    pub pid: i32,
    /// Tid of the current task, perf numbering
    pub tid: i32,
    pub cpu: u32,
    /// Timestamp in nanoseconds
    pub ts: u64,
}

/// What a lifecycle record says happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleKind {
    /// Name announcement; `exec` is set when it came from an exec rather
    /// than the startup synthesis of existing tasks.
    Comm { exec: bool, comm: String },
    /// Task creation with its parent.
    Fork { ppid: i32, ptid: i32 },
    /// Task exit.
    Exit { ppid: i32, ptid: i32 },
}

/// A PERF_RECORD_COMM/FORK/EXIT record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLifecycleEvent {
    pub header: RecordHeader,
    /// Pid of the task the record is about, perf numbering
    pub pid: i32,
    /// Tid of the task the record is about, perf numbering
    pub tid: i32,
    pub kind: LifecycleKind,
}

/// One side of a context switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchTask {
    /// Scheduler pid (kernel numbering)
    pub pid: i32,
    pub comm: String,
    pub prio: i32,
}

/// A `sched:sched_switch` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchEvent {
    pub header: RecordHeader,
    pub prev: SwitchTask,
    /// Why `prev` stopped running, e.g. `S`, `D` or `R+`
    pub prev_state: String,
    pub next: SwitchTask,
}

/// A `sched:sched_wakeup`, `sched_waking` or `sched_wakeup_new` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeupEvent {
    pub header: RecordHeader,
    /// Scheduler pid of the task being woken
    pub pid: i32,
    pub comm: String,
    pub prio: i32,
    pub target_cpu: Option<u32>,
}

/// A `sched:sched_stat_runtime` record: CFS accounting for the task
/// currently on the record's core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub header: RecordHeader,
    /// Scheduler pid of the accounted task
    pub pid: i32,
    pub comm: String,
    pub runtime: u64,
    pub vruntime: u64,
}

/// Every record the conversion cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    Lifecycle(TaskLifecycleEvent),
    Switch(SwitchEvent),
    Wakeup(WakeupEvent),
    Runtime(RuntimeEvent),
}

impl RawEvent {
    pub fn header(&self) -> &RecordHeader {
        match self {
            RawEvent::Lifecycle(ev) => &ev.header,
            RawEvent::Switch(ev) => &ev.header,
            RawEvent::Wakeup(ev) => &ev.header,
            RawEvent::Runtime(ev) => &ev.header,
        }
    }

    pub fn ts(&self) -> u64 {
        self.header().ts
    }
}

/// Counters from a pass over the `perf script` text.
#[derive(Debug, Clone, Default)]
pub struct ParseStats {
    pub lines: usize,
    pub switches: usize,
    pub wakeups: usize,
    pub lifecycle: usize,
    pub runtime_stats: usize,
    /// Recognized records that the conversion doesn't use, by name
    pub skipped: BTreeMap<String, usize>,
    /// Most fractional-second digits seen in a timestamp (9 = ns)
    pub ts_digits: u32,
    pub diagnostics: Diagnostics,
}

impl ParseStats {
    pub fn events(&self) -> usize {
        self.switches + self.wakeups + self.lifecycle + self.runtime_stats
    }

    /// Finest timestamp resolution present in the source, in nanoseconds.
    pub fn source_resolution_ns(&self) -> u64 {
        10u64.pow(9 - self.ts_digits.min(9))
    }
}

struct Patterns {
    header: Regex,
    sched: Regex,
    perf_record: Regex,
    switch: Regex,
    switch_legacy: Regex,
    wakeup: Regex,
    wakeup_legacy: Regex,
    stat_runtime: Regex,
    comm: Regex,
    fork_exit: Regex,
}

/// Line grammars, compiled once at first use.
static PATTERNS: LazyLock<Patterns> = LazyLock::new(|| {
    let re = |pattern: &str| Regex::new(pattern).expect("Invalid perf script regex pattern");
    Patterns {
        header: re(r"^ *(-?\d+)/(-?\d+) +\[0*(\d+)\] +(\d+)\.(\d+): +(.*)$"),
        sched: re(r"^sched:(\w+): +(.*)$"),
        perf_record: re(r"^PERF_RECORD_([A-Z]+)(.*)$"),
        // Comms may contain spaces, so anchor on the key names instead of
        // splitting on whitespace.
        switch: re(concat!(
            r"^prev_comm=(.*) prev_pid=(-?\d+) prev_prio=(-?\d+) prev_state=(\S+)",
            r" ==> next_comm=(.*) next_pid=(-?\d+) next_prio=(-?\d+)\s*$"
        )),
        // Older perf builds print `prev:pid [prio] state ==> next:pid [prio]`.
        switch_legacy: re(r"^(.*?):(-?\d+) \[(-?\d+)\] (\S+) ==> (.*):(-?\d+) \[(-?\d+)\]\s*$"),
        wakeup: re(r"^comm=(.*) pid=(-?\d+) prio=(-?\d+)(?: success=\d+)?(?: target_cpu=(\d+))?\s*$"),
        stat_runtime: re(
            r"^comm=(.*) pid=(-?\d+) runtime=(\d+) \[ns\] vruntime=(\d+) \[ns\]\s*$",
        ),
        wakeup_legacy: re(r"^(.*?):(-?\d+) \[(-?\d+)\](?: .*?)? CPU:(\d+)\s*$"),
        comm: re(r"^(?: exec)?: (.*):(-?\d+)/(-?\d+)\s*$"),
        fork_exit: re(r"^\((-?\d+):(-?\d+)\):\((-?\d+):(-?\d+)\)"),
    }
});

/// Outcome of looking at one line.
#[derive(Debug, PartialEq, Eq)]
enum Parsed {
    Event(RawEvent),
    /// A valid record we don't need, keyed by record name
    Ignored(String),
    Blank,
}

#[derive(Debug, PartialEq, Eq)]
enum LineError {
    Unrecognized,
    Malformed(String),
}

fn num<T: std::str::FromStr>(caps: &Captures<'_>, idx: usize, kind: &str) -> Result<T, LineError> {
    caps.get(idx)
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| LineError::Malformed(kind.to_string()))
}

/// Convert `secs` and a fractional part of up to 9 digits to nanoseconds.
fn timestamp_ns(secs: &str, frac: &str) -> Option<u64> {
    let digits = u32::try_from(frac.len()).ok()?;
    if digits == 0 || digits > 9 {
        return None;
    }
    let secs: u64 = secs.parse().ok()?;
    let frac: u64 = frac.parse().ok()?;
    secs.checked_mul(1_000_000_000)?
        .checked_add(frac * 10u64.pow(9 - digits))
}

fn parse_line(line: &str) -> Result<(Parsed, u32), LineError> {
    if line.trim().is_empty() {
        return Ok((Parsed::Blank, 0));
    }
    let p = &*PATTERNS;
    let caps = p.header.captures(line).ok_or(LineError::Unrecognized)?;
    let frac = &caps[5];
    let header = RecordHeader {
        pid: num(&caps, 1, "pid")?,
        tid: num(&caps, 2, "tid")?,
        cpu: num(&caps, 3, "cpu")?,
        ts: timestamp_ns(&caps[4], frac)
            .ok_or_else(|| LineError::Malformed("timestamp".to_string()))?,
    };
    let digits = u32::try_from(frac.len()).unwrap_or(9);
    let rest = caps.get(6).map_or("", |m| m.as_str());

    if let Some(sched) = p.sched.captures(rest) {
        return parse_sched(header, &sched[1], &sched[2]).map(|parsed| (parsed, digits));
    }
    if let Some(record) = p.perf_record.captures(rest) {
        return parse_perf_record(header, &record[1], &record[2]).map(|parsed| (parsed, digits));
    }
    Err(LineError::Unrecognized)
}

fn parse_sched(header: RecordHeader, name: &str, payload: &str) -> Result<Parsed, LineError> {
    let p = &*PATTERNS;
    match name {
        "sched_switch" => {
            let caps = p
                .switch
                .captures(payload)
                .or_else(|| p.switch_legacy.captures(payload))
                .ok_or_else(|| LineError::Malformed(name.to_string()))?;
            Ok(Parsed::Event(RawEvent::Switch(SwitchEvent {
                header,
                prev: SwitchTask {
                    comm: caps[1].to_string(),
                    pid: num(&caps, 2, name)?,
                    prio: num(&caps, 3, name)?,
                },
                prev_state: caps[4].to_string(),
                next: SwitchTask {
                    comm: caps[5].to_string(),
                    pid: num(&caps, 6, name)?,
                    prio: num(&caps, 7, name)?,
                },
            })))
        }
        "sched_wakeup" | "sched_waking" | "sched_wakeup_new" => {
            let caps = p
                .wakeup
                .captures(payload)
                .or_else(|| p.wakeup_legacy.captures(payload))
                .ok_or_else(|| LineError::Malformed(name.to_string()))?;
            let target_cpu = match caps.get(4) {
                Some(m) => Some(
                    m.as_str()
                        .parse()
                        .map_err(|_| LineError::Malformed(name.to_string()))?,
                ),
                None => None,
            };
            Ok(Parsed::Event(RawEvent::Wakeup(WakeupEvent {
                header,
                comm: caps[1].to_string(),
                pid: num(&caps, 2, name)?,
                prio: num(&caps, 3, name)?,
                target_cpu,
            })))
        }
        "sched_stat_runtime" => {
            let caps = p
                .stat_runtime
                .captures(payload)
                .ok_or_else(|| LineError::Malformed(name.to_string()))?;
            Ok(Parsed::Event(RawEvent::Runtime(RuntimeEvent {
                header,
                comm: caps[1].to_string(),
                pid: num(&caps, 2, name)?,
                runtime: num(&caps, 3, name)?,
                vruntime: num(&caps, 4, name)?,
            })))
        }
        other => Ok(Parsed::Ignored(format!("sched:{other}"))),
    }
}

fn parse_perf_record(header: RecordHeader, kind: &str, rest: &str) -> Result<Parsed, LineError> {
    let p = &*PATTERNS;
    let record = format!("PERF_RECORD_{kind}");
    match kind {
        "COMM" => {
            let caps = p
                .comm
                .captures(rest)
                .ok_or_else(|| LineError::Malformed(record.clone()))?;
            Ok(Parsed::Event(RawEvent::Lifecycle(TaskLifecycleEvent {
                header,
                pid: num(&caps, 2, &record)?,
                tid: num(&caps, 3, &record)?,
                kind: LifecycleKind::Comm {
                    exec: rest.starts_with(" exec"),
                    comm: caps[1].to_string(),
                },
            })))
        }
        "FORK" | "EXIT" => {
            // Startup FORK records at timestamp zero carry less than the
            // COMM records perf synthesizes alongside them.
            if kind == "FORK" && header.ts == 0 {
                return Ok(Parsed::Ignored(format!("{record} (startup)")));
            }
            let caps = p
                .fork_exit
                .captures(rest)
                .ok_or_else(|| LineError::Malformed(record.clone()))?;
            let pid = num(&caps, 1, &record)?;
            let tid = num(&caps, 2, &record)?;
            let ppid = num(&caps, 3, &record)?;
            let ptid = num(&caps, 4, &record)?;
            let kind = if kind == "FORK" {
                LifecycleKind::Fork { ppid, ptid }
            } else {
                LifecycleKind::Exit { ppid, ptid }
            };
            Ok(Parsed::Event(RawEvent::Lifecycle(TaskLifecycleEvent {
                header,
                pid,
                tid,
                kind,
            })))
        }
        _ => Err(LineError::Unrecognized),
    }
}

/// Lazy iterator over the records in `perf script` text.
///
/// Records come out in input order. To start over, build a new iterator
/// from the same text.
pub struct RawEvents<'a> {
    lines: Enumerate<Lines<'a>>,
    stats: ParseStats,
}

impl<'a> RawEvents<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            lines: text.lines().enumerate(),
            stats: ParseStats::default(),
        }
    }

    pub fn into_stats(self) -> ParseStats {
        self.stats
    }
}

impl Iterator for RawEvents<'_> {
    type Item = RawEvent;

    fn next(&mut self) -> Option<Self::Item> {
        for (idx, line) in self.lines.by_ref() {
            self.stats.lines += 1;
            let line_no = idx + 1;
            match parse_line(line) {
                Ok((Parsed::Event(event), digits)) => {
                    self.stats.ts_digits = self.stats.ts_digits.max(digits);
                    match &event {
                        RawEvent::Switch(_) => self.stats.switches += 1,
                        RawEvent::Wakeup(_) => self.stats.wakeups += 1,
                        RawEvent::Lifecycle(_) => self.stats.lifecycle += 1,
                        RawEvent::Runtime(_) => self.stats.runtime_stats += 1,
                    }
                    return Some(event);
                }
                Ok((Parsed::Ignored(name), _)) => {
                    *self.stats.skipped.entry(name).or_default() += 1;
                }
                Ok((Parsed::Blank, _)) => {}
                Err(LineError::Unrecognized) => {
                    debug!("Dropping unrecognized line {line_no}: {line}");
                    self.stats.diagnostics.push(Diagnostic::UnrecognizedLine {
                        line: line_no,
                        text: line.to_string(),
                    });
                }
                Err(LineError::Malformed(kind)) => {
                    debug!("Dropping malformed {kind} on line {line_no}: {line}");
                    self.stats.diagnostics.push(Diagnostic::MalformedRecord {
                        line: line_no,
                        kind,
                        text: line.to_string(),
                    });
                }
            }
        }
        None
    }
}

/// Parse all of `text`, returning the records and the final counters.
pub fn parse_events(text: &str) -> (Vec<RawEvent>, ParseStats) {
    let mut events = RawEvents::new(text);
    let collected: Vec<RawEvent> = events.by_ref().collect();
    (collected, events.into_stats())
}
