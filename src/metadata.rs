//! Parser for the capture metadata member (`perf-mdata.txt`).
//!
//! The file is written by the capture script and looks like:
//!
//! ```text
//! ## System performance data
//! # date: Tue Jul 18 16:10:18 UTC 2023
//! # system: Linux host 6.1.0 #1 SMP x86_64 GNU/Linux
//! # duration: 10 seconds
//! # perf-version: perf version 6.1
//! # perf-sched-cmd: perf sched record --mmap-pages 8M sleep 10
//! # perf-script-cmd: perf script --show-task-events --fields pid,tid,cpu,time,event,trace --ns
//! ## before
//! 1 (init) S 0 1 1 0 -1 4194560 ...
//! ## after
//! 1 (init) S 0 1 1 0 -1 4194560 ...
//! ```
//!
//! Process lines use the `/proc/<pid>/stat` layout documented in proc(5).

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use tracing::debug;

use crate::diagnostics::{Diagnostic, Diagnostics};

/// `PF_KTHREAD` from linux/sched.h.
pub const PF_KTHREAD: u64 = 0x0020_0000;

/// Pid of kthreadd, parent of every kernel thread.
pub const KTHREADD_PID: i32 = 2;

/// Minimum number of numeric fields after the state (up to `starttime`).
const MIN_STAT_FIELDS: usize = 19;

/// Everything recorded about the capture environment.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureMetadata {
    /// Output of `date` when the capture started
    pub date: String,
    /// Output of `uname -a`
    pub system: Option<String>,
    /// Length of the recording
    pub duration: Duration,
    /// Output of `perf --version`
    pub perf_version: Option<String>,
    /// The `perf sched record` command line
    pub sched_cmd: Option<String>,
    /// The `perf script` command line
    pub script_cmd: Option<String>,
    /// Keys this parser doesn't interpret, kept for reference
    pub extra: BTreeMap<String, String>,
    /// Process table read before recording started
    pub before: Vec<ProcStat>,
    /// Process table read after recording finished
    pub after: Vec<ProcStat>,
}

/// Scheduling policy from the `policy` stat field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    Normal,
    Fifo,
    RoundRobin,
    Batch,
    Idle,
    Deadline,
    Unknown(i64),
}

impl SchedPolicy {
    fn from_raw(policy: i64) -> Self {
        match policy {
            0 => SchedPolicy::Normal,
            1 => SchedPolicy::Fifo,
            2 => SchedPolicy::RoundRobin,
            3 => SchedPolicy::Batch,
            5 => SchedPolicy::Idle,
            6 => SchedPolicy::Deadline,
            other => SchedPolicy::Unknown(other),
        }
    }

    /// Short tag for real-time policies, used to decorate thread names.
    pub fn realtime_tag(&self) -> Option<&'static str> {
        match self {
            SchedPolicy::Fifo => Some("FIFO"),
            SchedPolicy::RoundRobin => Some("RR"),
            _ => None,
        }
    }
}

/// The subset of `/proc/<pid>/stat` used for identity matching and display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: i32,
    /// Program name, truncated by the kernel to 15 bytes
    pub comm: String,
    /// Single-letter state, e.g. `S` or `R`
    pub state: char,
    pub ppid: i32,
    pub pgrp: i32,
    pub session: i32,
    pub flags: u64,
    pub utime: u64,
    pub stime: u64,
    pub priority: i64,
    pub nice: i64,
    pub num_threads: i64,
    /// Start time after boot, in clock ticks
    pub starttime: u64,
    pub rt_priority: Option<u64>,
    pub policy: Option<SchedPolicy>,
}

impl ProcStat {
    /// Kernel threads carry `PF_KTHREAD`, or at least hang off kthreadd.
    pub fn is_kernel_thread(&self) -> bool {
        self.flags & PF_KTHREAD != 0 || self.ppid == KTHREADD_PID || self.pid == KTHREADD_PID
    }

    pub fn sched_policy(&self) -> SchedPolicy {
        self.policy.unwrap_or(SchedPolicy::Normal)
    }
}

/// Counters from parsing the metadata member.
#[derive(Debug, Clone, Default)]
pub struct MetadataStats {
    pub stat_lines: usize,
    pub diagnostics: Diagnostics,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Before,
    After,
}

// Greedy comm match so names like "foo (bar)" keep their parentheses.
static STAT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+) \((.*)\) (\S) ([\d -]+)$").expect("Invalid stat line regex pattern")
});

/// Parse a single `/proc/<pid>/stat` line.
///
/// Returns `None` when the line doesn't have the expected shape.
pub fn parse_stat_line(line: &str) -> Option<ProcStat> {
    let caps = STAT_RE.captures(line.trim_end())?;
    let pid = caps[1].parse().ok()?;
    let comm = caps[2].to_string();
    let state = caps[3].chars().next()?;

    let fields: Vec<&str> = caps[4].split_whitespace().collect();
    if fields.len() < MIN_STAT_FIELDS {
        return None;
    }
    // Every field must be numeric even if we don't keep it; a stray token
    // means the line was cut or mangled.
    if !fields
        .iter()
        .all(|f| f.parse::<i64>().is_ok() || f.parse::<u64>().is_ok())
    {
        return None;
    }

    let signed = |idx: usize| fields.get(idx).and_then(|f| f.parse::<i64>().ok());
    let unsigned = |idx: usize| fields.get(idx).and_then(|f| f.parse::<u64>().ok());
    let int = |idx: usize| signed(idx).and_then(|v| i32::try_from(v).ok());

    Some(ProcStat {
        pid,
        comm,
        state,
        ppid: int(0)?,
        pgrp: int(1)?,
        session: int(2)?,
        flags: unsigned(5)?,
        utime: unsigned(10)?,
        stime: unsigned(11)?,
        priority: signed(14)?,
        nice: signed(15)?,
        num_threads: signed(16)?,
        starttime: unsigned(18)?,
        rt_priority: unsigned(36),
        policy: signed(37).map(SchedPolicy::from_raw),
    })
}

/// Parse the `duration` value, e.g. `10 seconds`.
fn parse_duration(value: &str) -> Result<Duration> {
    let mut words = value.split_whitespace();
    let number = words.next().context("empty duration")?;
    let secs: f64 = number
        .parse()
        .with_context(|| format!("invalid duration number '{number}'"))?;
    if !secs.is_finite() || secs < 0.0 {
        bail!("invalid duration '{value}'");
    }
    match words.next() {
        None | Some("seconds" | "second" | "secs" | "sec" | "s") => {}
        Some(unit) => bail!("unsupported duration unit '{unit}'"),
    }
    Duration::try_from_secs_f64(secs).with_context(|| format!("duration '{value}' out of range"))
}

/// Parse the whole metadata member.
///
/// Fails if `date` or `duration` is absent. Malformed process lines are
/// skipped and reported through the returned stats.
pub fn parse_metadata(text: &str) -> Result<(CaptureMetadata, MetadataStats)> {
    let mut stats = MetadataStats::default();
    let mut keys: BTreeMap<String, String> = BTreeMap::new();
    let mut before = Vec::new();
    let mut after = Vec::new();
    let mut section = Section::Before;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix("##") {
            match comment.trim() {
                "before" => section = Section::Before,
                "after" => section = Section::After,
                _ => {}
            }
            continue;
        }
        if let Some(kv) = line.strip_prefix("# ") {
            if let Some((key, value)) = kv.split_once(':') {
                keys.insert(key.trim().to_string(), value.trim().to_string());
            }
            continue;
        }

        match parse_stat_line(line) {
            Some(stat) => {
                stats.stat_lines += 1;
                match section {
                    Section::Before => before.push(stat),
                    Section::After => after.push(stat),
                }
            }
            None => {
                debug!("Skipping malformed stat line {line_no}: {line}");
                stats.diagnostics.push(Diagnostic::MalformedStatLine {
                    line: line_no,
                    text: line.to_string(),
                });
            }
        }
    }

    let date = keys
        .remove("date")
        .context("metadata is missing the required 'date' field")?;
    let raw_duration = keys
        .remove("duration")
        .context("metadata is missing the required 'duration' field")?;
    let duration = parse_duration(&raw_duration)
        .with_context(|| format!("metadata has an invalid 'duration' field: '{raw_duration}'"))?;

    let metadata = CaptureMetadata {
        date,
        system: keys.remove("system"),
        duration,
        perf_version: keys.remove("perf-version"),
        sched_cmd: keys.remove("perf-sched-cmd"),
        script_cmd: keys.remove("perf-script-cmd"),
        extra: keys,
        before,
        after,
    };
    Ok((metadata, stats))
}
