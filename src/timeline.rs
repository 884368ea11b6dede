//! Reconstructs running and blocked intervals from switch and wakeup
//! records.
//!
//! One pass in file order. Each thread has at most one open interval and
//! each core at most one running task; a switch on core `c` closes the
//! outgoing thread's running interval, opens its blocked one, and does the
//! reverse for the incoming thread. Whatever is still open when the records
//! run out is closed at the trace end and flagged, since its real length
//! isn't known.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tracing::debug;

use crate::config::{duration_ns, TimeWindow};
use crate::identity::IDLE_PID;
use crate::perf_script::{RawEvent, RuntimeEvent, SwitchEvent, WakeupEvent};

/// What a thread was doing during an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreadState {
    Running,
    Blocked,
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadState::Running => f.write_str("Running"),
            ThreadState::Blocked => f.write_str("Blocked"),
        }
    }
}

/// CPU time charged to a running interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runtime {
    /// Reported by the fair scheduler's runtime accounting
    Cfs { runtime: u64, vruntime: u64 },
    /// No accounting record covered the run (e.g. real-time tasks); the
    /// wall-clock length stands in.
    Estimated(u64),
}

impl Runtime {
    pub fn ns(&self) -> u64 {
        match *self {
            Runtime::Cfs { runtime, .. } => runtime,
            Runtime::Estimated(ns) => ns,
        }
    }

    /// Combine the runtimes of two runs stored as one interval.
    fn merge(self, later: Runtime) -> Runtime {
        match (self, later) {
            (Runtime::Cfs { runtime: a, .. }, Runtime::Cfs { runtime: b, vruntime }) => {
                Runtime::Cfs {
                    runtime: a + b,
                    vruntime,
                }
            }
            (a, b) => Runtime::Estimated(a.ns() + b.ns()),
        }
    }
}

/// A stretch of time a thread spent in one state. `end` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
    pub state: ThreadState,
    /// Core the thread ran on (running intervals only)
    pub cpu: Option<u32>,
    /// Priority reported when the thread was switched in
    pub prio: Option<i32>,
    /// Expanded `prev_state`: the state a running interval ended in, or the
    /// state a blocked interval started in
    pub label: Option<String>,
    /// Time from the first wakeup to running again (blocked intervals only)
    pub wakeup_latency: Option<u64>,
    /// CPU time of a running interval ended by a switch
    pub runtime: Option<Runtime>,
    /// Closed by the end of the trace rather than by a switch
    pub closed_at_end: bool,
}

impl Interval {
    pub fn duration(&self) -> u64 {
        self.end - self.start
    }
}

/// A stretch of time one task ran on a core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreInterval {
    pub start: u64,
    pub end: u64,
    pub sched_pid: i32,
    pub closed_at_end: bool,
}

impl CoreInterval {
    pub fn duration(&self) -> u64 {
        self.end - self.start
    }
}

/// Per-thread and per-core intervals for the converted part of the trace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timeline {
    pub start: u64,
    pub end: u64,
    /// Keyed by scheduler pid; sorted, non-overlapping, alternating
    pub threads: BTreeMap<i32, Vec<Interval>>,
    pub cores: BTreeMap<u32, Vec<CoreInterval>>,
}

impl Timeline {
    /// Total running time of one thread.
    pub fn running_ns(&self, sched_pid: i32) -> u64 {
        self.threads.get(&sched_pid).map_or(0, |intervals| {
            intervals
                .iter()
                .filter(|i| i.state == ThreadState::Running)
                .map(Interval::duration)
                .sum()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty() && self.cores.is_empty()
    }
}

/// Counters from interval reconstruction.
#[derive(Debug, Clone, Default)]
pub struct TimelineStats {
    pub switches: usize,
    pub wakeups: usize,
    pub runtime_samples: usize,
    /// Records outside the configured window
    pub outside_window: usize,
    /// Switches earlier than the previous one on the same core
    pub out_of_order: usize,
    pub intervals: usize,
    pub closed_at_end: usize,
}

/// Expand a `prev_state` code into something readable, e.g. `S [Sleeping]`.
pub fn expand_state(state: &str) -> String {
    let meaning = match state {
        "R" => "Runnable",
        "R+" => "Runnable (Preempted)",
        "S" => "Sleeping",
        "D" => "Uninterruptible Sleep",
        "T" => "Stopped",
        "t" => "Traced",
        "X" => "Exit (Dead)",
        "Z" => "Exit (Zombie)",
        "x" => "Task Dead",
        "I" => "Idle",
        "K" => "Wake Kill",
        "W" => "Waking",
        "P" => "Parked",
        "N" => "No Load",
        _ => "Unknown",
    };
    format!("{state} [{meaning}]")
}

#[derive(Debug)]
struct Open {
    start: u64,
    state: ThreadState,
    cpu: Option<u32>,
    prio: Option<i32>,
    label: Option<String>,
    woken_at: Option<u64>,
}

impl Open {
    fn running(start: u64, cpu: u32, prio: i32) -> Self {
        Open {
            start,
            state: ThreadState::Running,
            cpu: Some(cpu),
            prio: Some(prio),
            label: None,
            woken_at: None,
        }
    }

    fn blocked(start: u64, label: String) -> Self {
        Open {
            start,
            state: ThreadState::Blocked,
            cpu: None,
            prio: None,
            label: Some(label),
            woken_at: None,
        }
    }

    fn close(
        self,
        end: u64,
        label: Option<String>,
        runtime: Option<Runtime>,
        closed_at_end: bool,
    ) -> Interval {
        let wakeup_latency = match self.state {
            ThreadState::Blocked => self.woken_at.map(|woken| end.saturating_sub(woken)),
            ThreadState::Running => None,
        };
        Interval {
            start: self.start,
            end,
            state: self.state,
            cpu: self.cpu,
            prio: self.prio,
            label: label.or(self.label),
            wakeup_latency,
            runtime,
            closed_at_end,
        }
    }
}

/// Latest runtime accounting seen on a core.
#[derive(Debug, Clone, Copy)]
struct RuntimeSample {
    ts: u64,
    sched_pid: i32,
    runtime: u64,
    vruntime: u64,
}

#[derive(Default)]
struct Builder {
    open: BTreeMap<i32, Open>,
    runtime_on_core: BTreeMap<u32, RuntimeSample>,
    on_core: BTreeMap<u32, (i32, u64)>,
    last_on_core: BTreeMap<u32, u64>,
    threads: BTreeMap<i32, Vec<Interval>>,
    cores: BTreeMap<u32, Vec<CoreInterval>>,
    stats: TimelineStats,
}

impl Builder {
    /// Store a closed interval, dropping empty ones and merging with a
    /// directly preceding interval in the same state.
    fn push(&mut self, sched_pid: i32, interval: Interval) {
        if interval.end <= interval.start {
            return;
        }
        let intervals = self.threads.entry(sched_pid).or_default();
        if let Some(last) = intervals.last_mut() {
            if last.state == interval.state && last.end == interval.start {
                last.end = interval.end;
                last.closed_at_end = interval.closed_at_end;
                match interval.state {
                    ThreadState::Running => {
                        if interval.label.is_some() {
                            last.label = interval.label;
                        }
                        last.runtime = match (last.runtime, interval.runtime) {
                            (Some(a), Some(b)) => Some(a.merge(b)),
                            (a, b) => a.or(b),
                        };
                    }
                    ThreadState::Blocked => {
                        last.wakeup_latency = last.wakeup_latency.or(interval.wakeup_latency);
                    }
                }
                return;
            }
        }
        intervals.push(interval);
    }

    /// Move a thread into `next`, closing whatever it had open.
    fn transition(
        &mut self,
        sched_pid: i32,
        ts: u64,
        next: Open,
        end_label: Option<String>,
        runtime: Option<Runtime>,
    ) {
        match self.open.remove(&sched_pid) {
            Some(open) if open.state == next.state => {
                // Already there (lost record or repeated switch); keep going.
                self.open.insert(sched_pid, open);
            }
            Some(open) => {
                let ts = ts.max(open.start);
                let closed = open.close(ts, end_label, runtime, false);
                self.push(sched_pid, closed);
                self.open.insert(sched_pid, Open { start: ts, ..next });
            }
            None => {
                self.open.insert(sched_pid, next);
            }
        }
    }

    fn switch(&mut self, ev: &SwitchEvent) {
        let ts = ev.header.ts;
        let cpu = ev.header.cpu;
        if let Some(last) = self.last_on_core.get(&cpu) {
            if ts < *last {
                self.stats.out_of_order += 1;
                debug!("cpu {cpu}: switch at {ts} precedes previous one at {last}, skipped");
                return;
            }
        }
        self.last_on_core.insert(cpu, ts);
        self.stats.switches += 1;

        if ev.prev.pid != IDLE_PID {
            let state = expand_state(&ev.prev_state);
            let runtime = self.runtime_of(ev.prev.pid, cpu, ts);
            self.transition(
                ev.prev.pid,
                ts,
                Open::blocked(ts, state.clone()),
                Some(state),
                runtime,
            );
        }
        if ev.next.pid != IDLE_PID {
            self.transition(
                ev.next.pid,
                ts,
                Open::running(ts, cpu, ev.next.prio),
                None,
                None,
            );
        }

        if let Some((sched_pid, start)) = self.on_core.remove(&cpu) {
            self.push_core(cpu, sched_pid, start, ts, false);
        }
        if ev.next.pid != IDLE_PID {
            self.on_core.insert(cpu, (ev.next.pid, ts));
        }
    }

    /// Runtime of the run `sched_pid` is ending on `cpu` at `ts`: the core's
    /// last accounting record if it is for this task and this run, else the
    /// run's length.
    fn runtime_of(&self, sched_pid: i32, cpu: u32, ts: u64) -> Option<Runtime> {
        let open = self.open.get(&sched_pid)?;
        if open.state != ThreadState::Running {
            return None;
        }
        match self.runtime_on_core.get(&cpu) {
            Some(sample) if sample.sched_pid == sched_pid && sample.ts >= open.start => {
                Some(Runtime::Cfs {
                    runtime: sample.runtime,
                    vruntime: sample.vruntime,
                })
            }
            _ => Some(Runtime::Estimated(ts.saturating_sub(open.start))),
        }
    }

    fn runtime(&mut self, ev: &RuntimeEvent) {
        self.stats.runtime_samples += 1;
        self.runtime_on_core.insert(
            ev.header.cpu,
            RuntimeSample {
                ts: ev.header.ts,
                sched_pid: ev.pid,
                runtime: ev.runtime,
                vruntime: ev.vruntime,
            },
        );
    }

    fn wakeup(&mut self, ev: &WakeupEvent) {
        self.stats.wakeups += 1;
        if let Some(open) = self.open.get_mut(&ev.pid) {
            if open.state == ThreadState::Blocked && open.woken_at.is_none() {
                open.woken_at = Some(ev.header.ts.max(open.start));
            }
        }
    }

    fn push_core(&mut self, cpu: u32, sched_pid: i32, start: u64, end: u64, closed_at_end: bool) {
        if end <= start {
            return;
        }
        self.cores.entry(cpu).or_default().push(CoreInterval {
            start,
            end,
            sched_pid,
            closed_at_end,
        });
    }

    fn finish(mut self, start: u64, end: u64) -> (Timeline, TimelineStats) {
        for (sched_pid, open) in std::mem::take(&mut self.open) {
            let closed = open.close(end.max(start), None, None, true);
            if closed.end > closed.start {
                self.stats.closed_at_end += 1;
            }
            self.push(sched_pid, closed);
        }
        for (cpu, (sched_pid, from)) in std::mem::take(&mut self.on_core) {
            self.push_core(cpu, sched_pid, from, end, true);
        }
        // A thread whose only interval was empty leaves an empty list behind.
        self.threads.retain(|_, intervals| !intervals.is_empty());

        self.stats.intervals = self.threads.values().map(Vec::len).sum();
        let timeline = Timeline {
            start,
            end,
            threads: self.threads,
            cores: self.cores,
        };
        (timeline, self.stats)
    }
}

/// Filter for the configured time window.
struct WindowFilter {
    skip: bool,
    lo: u64,
    hi: Option<u64>,
}

impl WindowFilter {
    fn new(window: TimeWindow, events: &[RawEvent]) -> Self {
        // Offsets count from the first record with a real timestamp; startup
        // records at 0 are always kept.
        let first = events.iter().map(RawEvent::ts).find(|ts| *ts > 0).unwrap_or(0);
        let (lo, hi) = window.bounds(first);
        WindowFilter {
            skip: !window.skip.is_zero(),
            lo,
            hi,
        }
    }

    fn contains(&self, ts: u64) -> bool {
        (!self.skip || ts >= self.lo) && self.hi.map_or(true, |hi| ts <= hi)
    }
}

/// Build the timeline for the part of the trace inside `window`.
///
/// `capture` is the recording length from the metadata; the trace is
/// considered to last at least that long after the first switch of the
/// whole recording, whatever the window starts at.
pub fn build_timeline(
    events: &[RawEvent],
    capture: Duration,
    window: TimeWindow,
) -> (Timeline, TimelineStats) {
    let filter = WindowFilter::new(window, events);
    let recording_start = events.iter().find_map(|event| match event {
        RawEvent::Switch(ev) => Some(ev.header.ts),
        _ => None,
    });
    let mut builder = Builder::default();
    let mut first_switch: Option<u64> = None;
    let mut last_ts = 0;

    for event in events {
        let ts = event.ts();
        match event {
            RawEvent::Switch(ev) => {
                if !filter.contains(ts) {
                    builder.stats.outside_window += 1;
                    continue;
                }
                first_switch.get_or_insert(ts);
                last_ts = last_ts.max(ts);
                builder.switch(ev);
            }
            RawEvent::Wakeup(ev) => {
                if !filter.contains(ts) {
                    builder.stats.outside_window += 1;
                    continue;
                }
                last_ts = last_ts.max(ts);
                builder.wakeup(ev);
            }
            RawEvent::Runtime(ev) => {
                if !filter.contains(ts) {
                    builder.stats.outside_window += 1;
                    continue;
                }
                builder.runtime(ev);
            }
            RawEvent::Lifecycle(_) => {}
        }
    }

    let Some(start) = first_switch else {
        debug!("No switch records inside the window");
        return builder.finish(0, 0);
    };
    let recording_end = recording_start
        .unwrap_or(start)
        .saturating_add(duration_ns(capture));
    let mut end = last_ts.max(recording_end);
    if let Some(hi) = filter.hi {
        end = end.min(hi.max(last_ts));
    }

    let (timeline, stats) = builder.finish(start, end);
    debug!(
        "Built {} intervals for {} threads on {} cores ({} closed at trace end)",
        stats.intervals,
        timeline.threads.len(),
        timeline.cores.len(),
        stats.closed_at_end
    );
    (timeline, stats)
}
