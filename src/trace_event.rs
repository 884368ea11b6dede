//! Chrome Trace Event JSON output.
//!
//! The document is a bare JSON array. Format reference:
//! https://docs.google.com/document/d/1CvAClvFfyA5R-PhYUmn5OOQtYMH4h6I0nSsKchNAySU/preview
//!
//! Timestamps are microseconds. They are written as `ns / 1000` floats so
//! nanosecond sources keep their digits; viewers that round to whole
//! microseconds will show the rounding, not this code.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};

use crate::identity::{Identities, ThreadIdentity};
use crate::perf_script::{LifecycleKind, RawEvent, TaskLifecycleEvent};
use crate::pseudo::{PseudoProcess, PseudoProcesses, Slice};
use crate::rank::RankedProcess;
use crate::timeline::{Interval, Runtime, ThreadState, Timeline};

pub const CATEGORY: &str = "sched";
pub const UNRESOLVED_LABEL: &str = "(unresolved: no matching process found)";

/// Record type ("phase").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    #[serde(rename = "M")]
    Metadata,
    #[serde(rename = "X")]
    Complete,
    #[serde(rename = "i")]
    Instant,
}

/// One record of the output array.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEvent {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cat: Option<&'static str>,
    pub ph: Phase,
    pub pid: i32,
    pub tid: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dur: Option<f64>,
    /// Instant event scope
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<&'static str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<&'static str, JsonValue>,
}

fn micros(ns: u64) -> f64 {
    ns as f64 / 1000.0
}

impl TraceEvent {
    fn metadata(name: &str, pid: i32, tid: i32, key: &'static str, value: JsonValue) -> Self {
        TraceEvent {
            name: name.to_string(),
            cat: None,
            ph: Phase::Metadata,
            pid,
            tid,
            ts: None,
            dur: None,
            s: None,
            args: BTreeMap::from([(key, value)]),
        }
    }

    pub fn process_name(pid: i32, name: &str) -> Self {
        Self::metadata("process_name", pid, 0, "name", json!(name))
    }

    pub fn process_labels(pid: i32, labels: &str) -> Self {
        Self::metadata("process_labels", pid, 0, "labels", json!(labels))
    }

    pub fn process_sort_index(pid: i32, index: i64) -> Self {
        Self::metadata("process_sort_index", pid, 0, "sort_index", json!(index))
    }

    pub fn thread_name(pid: i32, tid: i32, name: &str) -> Self {
        Self::metadata("thread_name", pid, tid, "name", json!(name))
    }

    pub fn thread_sort_index(pid: i32, tid: i32, index: i64) -> Self {
        Self::metadata("thread_sort_index", pid, tid, "sort_index", json!(index))
    }

    pub fn complete(
        name: &str,
        pid: i32,
        tid: i32,
        start: u64,
        end: u64,
        args: BTreeMap<&'static str, JsonValue>,
    ) -> Self {
        TraceEvent {
            name: name.to_string(),
            cat: Some(CATEGORY),
            ph: Phase::Complete,
            pid,
            tid,
            ts: Some(micros(start)),
            dur: Some(micros(end.saturating_sub(start))),
            s: None,
            args,
        }
    }

    pub fn instant(
        name: &str,
        pid: i32,
        tid: i32,
        ts: u64,
        args: BTreeMap<&'static str, JsonValue>,
    ) -> Self {
        TraceEvent {
            name: name.to_string(),
            cat: Some(CATEGORY),
            ph: Phase::Instant,
            pid,
            tid,
            ts: Some(micros(ts)),
            dur: None,
            s: Some("t"),
            args,
        }
    }
}

fn interval_args(sched_pid: i32, interval: &Interval) -> BTreeMap<&'static str, JsonValue> {
    let mut args = BTreeMap::new();
    args.insert("sched pid", json!(sched_pid));
    if let Some(cpu) = interval.cpu {
        args.insert("cpu", json!(cpu));
    }
    if let Some(prio) = interval.prio {
        args.insert("prio", json!(prio));
    }
    if let Some(label) = &interval.label {
        let key = match interval.state {
            ThreadState::Running => "end state",
            ThreadState::Blocked => "state",
        };
        args.insert(key, json!(label));
    }
    if let Some(latency) = interval.wakeup_latency {
        args.insert("wakeup latency (ns)", json!(latency));
    }
    match interval.runtime {
        Some(Runtime::Cfs { runtime, vruntime }) => {
            args.insert("CFS runtime (ns)", json!(runtime));
            args.insert("CFS vruntime (ns)", json!(vruntime));
        }
        Some(Runtime::Estimated(ns)) => {
            args.insert("Non-CFS runtime (ns)", json!(ns));
        }
        None => {}
    }
    if interval.closed_at_end {
        args.insert("open at trace end", json!(true));
    }
    args
}

fn slice_args(slice: &Slice) -> BTreeMap<&'static str, JsonValue> {
    let mut args = BTreeMap::new();
    if slice.sched_pid != 0 {
        args.insert("sched pid", json!(slice.sched_pid));
    }
    if let Some(state) = &slice.state {
        args.insert("state", json!(state));
    }
    if let Some(latency) = slice.wakeup_latency {
        args.insert("wakeup latency (ns)", json!(latency));
    }
    args
}

/// Everything the emitter draws from.
pub struct TraceInput<'a> {
    pub events: &'a [RawEvent],
    pub identities: &'a Identities,
    pub timeline: &'a Timeline,
    pub pseudo: &'a PseudoProcesses,
    pub ranked: &'a [RankedProcess],
}

struct Emitter<'a> {
    input: &'a TraceInput<'a>,
    out: Vec<TraceEvent>,
}

impl<'a> Emitter<'a> {
    fn thread(&mut self, pid: i32, tid: i32, sort_index: i64, thread: &ThreadIdentity) {
        let Some(intervals) = self.input.timeline.threads.get(&thread.sched_pid) else {
            return;
        };
        self.out
            .push(TraceEvent::thread_name(pid, tid, &thread.display_name()));
        self.out
            .push(TraceEvent::thread_sort_index(pid, tid, sort_index));
        for interval in intervals {
            self.out.push(TraceEvent::complete(
                &interval.state.to_string(),
                pid,
                tid,
                interval.start,
                interval.end,
                interval_args(thread.sched_pid, interval),
            ));
        }
    }

    fn pseudo_process(&mut self, process: &PseudoProcess, sort_index: i64) {
        let pid = process.pid;
        self.out.push(TraceEvent::process_name(pid, process.name));
        self.out.push(TraceEvent::process_labels(pid, process.label));
        self.out.push(TraceEvent::process_sort_index(pid, sort_index));

        let mut position = 0;
        for track in &process.tracks {
            self.out.push(TraceEvent::thread_name(pid, track.tid, &track.name));
            self.out
                .push(TraceEvent::thread_sort_index(pid, track.tid, position));
            position += 1;
            for slice in &track.slices {
                self.out.push(TraceEvent::complete(
                    &slice.name,
                    pid,
                    track.tid,
                    slice.start,
                    slice.end,
                    slice_args(slice),
                ));
            }
        }
        let identities = self.input.identities;
        for sched_pid in &process.threads {
            if let Some(thread) = identities.thread(*sched_pid) {
                self.thread(pid, *sched_pid, position, thread);
                position += 1;
            }
        }
    }

    fn real_process(&mut self, ranked: &RankedProcess) {
        let identities = self.input.identities;
        let Some(process) = identities.processes.get(&ranked.key) else {
            return;
        };
        let pid = process.pid;
        self.out.push(TraceEvent::process_name(pid, &process.name));
        if process.is_unresolved() {
            self.out.push(TraceEvent::process_labels(pid, UNRESOLVED_LABEL));
        }
        self.out
            .push(TraceEvent::process_sort_index(pid, ranked.sort_index));
        for (position, sched_pid) in process.threads.iter().enumerate() {
            if let Some(thread) = identities.thread(*sched_pid) {
                self.thread(pid, thread.tid(), position as i64, thread);
            }
        }
    }

    /// Viewer (pid, tid) for a lifecycle record, if its thread was resolved.
    fn place(&self, ev: &TaskLifecycleEvent) -> Option<(i32, i32)> {
        let identities = self.input.identities;
        let header = (ev.header.pid, ev.header.tid);
        let sched_pid = identities
            .by_namespace
            .get(&header)
            .or_else(|| identities.by_namespace.get(&(ev.pid, ev.tid)))?;
        let thread = identities.thread(*sched_pid)?;
        if !self.input.timeline.threads.contains_key(sched_pid) {
            return None;
        }
        if thread.kernel {
            return Some((self.input.pseudo.kernel.pid, *sched_pid));
        }
        let process = identities.process_of(*sched_pid)?;
        Some((process.pid, thread.tid()))
    }

    fn lifecycle(&mut self) {
        let timeline = self.input.timeline;
        for event in self.input.events {
            let RawEvent::Lifecycle(ev) = event else {
                continue;
            };
            let ts = ev.header.ts;
            if ts < timeline.start || ts > timeline.end {
                continue;
            }
            let (name, mut args) = match &ev.kind {
                LifecycleKind::Comm { .. } => continue,
                LifecycleKind::Fork { ppid, ptid } => {
                    let name = if *ppid == ev.pid {
                        "thread_spawn"
                    } else {
                        "process fork"
                    };
                    let mut args = BTreeMap::new();
                    args.insert("parent pid", json!(ppid));
                    args.insert("parent tid", json!(ptid));
                    (name, args)
                }
                LifecycleKind::Exit { .. } => ("thread_exit", BTreeMap::new()),
            };
            let Some((pid, tid)) = self.place(ev) else {
                continue;
            };
            args.insert("pid", json!(ev.pid));
            args.insert("tid", json!(ev.tid));
            args.insert("cpu", json!(ev.header.cpu));
            self.out.push(TraceEvent::instant(name, pid, tid, ts, args));
        }
    }
}

/// Lay out the whole document: pseudo-processes, ranked processes, then
/// lifecycle instants.
pub fn build_trace(input: &TraceInput<'_>) -> Vec<TraceEvent> {
    let mut emitter = Emitter {
        input,
        out: Vec::new(),
    };
    for (index, process) in input.pseudo.iter().enumerate() {
        emitter.pseudo_process(process, index as i64);
    }
    for ranked in input.ranked {
        emitter.real_process(ranked);
    }
    emitter.lifecycle();
    emitter.out
}

/// Serialize `events` as a JSON array, one record per line.
pub fn write_events<W: Write>(mut writer: W, events: &[TraceEvent]) -> Result<()> {
    writer.write_all(b"[\n")?;
    for (idx, event) in events.iter().enumerate() {
        if idx > 0 {
            writer.write_all(b",\n")?;
        }
        serde_json::to_writer(&mut writer, event)?;
    }
    writer.write_all(b"\n]\n")?;
    writer.flush()?;
    Ok(())
}

/// Write the document to `path`.
pub fn write_trace(path: &Path, events: &[TraceEvent]) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create output file {}", path.display()))?;
    write_events(BufWriter::new(file), events)
        .with_context(|| format!("Failed to write trace to {}", path.display()))
}
