//! Linking scheduler pids to threads and processes.
//!
//! `sched:` payloads number tasks the way the kernel does, while the
//! `pid/tid` prefix of each line and the PERF_RECORD_* payloads use perf's
//! numbering. When perf runs inside a pid namespace the two differ, so every
//! scheduler pid has to be matched against two differently keyed sources:
//!
//! - the namespace side ([`LifecycleIndex`]), built from COMM/FORK records
//!   in event order, and
//! - the host side ([`SnapshotIndex`]), built from the `/proc` snapshots
//!   taken before and after recording.
//!
//! A switch record's prefix describes the task being switched out, so each
//! switch also yields a pairing observation `prev_pid <-> pid/tid`.
//!
//! Evidence is tried strongest first (see [`Evidence`]); anything left over
//! becomes an explicit [`Link::Unresolved`] placeholder instead of being
//! dropped or merged into something else.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::debug;

use crate::config::{duration_ns, ResolvePolicy};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::metadata::{CaptureMetadata, ProcStat};
use crate::perf_script::{LifecycleKind, RawEvent, SwitchEvent};

/// The kernel keeps 15 bytes of a task name (16 with the terminator).
pub const TASK_COMM_LEN: usize = 15;

/// Scheduler pid of the per-CPU idle task.
pub const IDLE_PID: i32 = 0;

/// Truncate a name the way the kernel does so names from different sources
/// compare equal.
pub fn comm_key(name: &str) -> &str {
    if name.len() <= TASK_COMM_LEN {
        return name;
    }
    let mut end = TASK_COMM_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// How a thread identity was established, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Evidence {
    /// A lifecycle record named the task the same way the scheduler did.
    Lifecycle,
    /// A /proc snapshot entry matched by pid or by name.
    Snapshot,
    /// A pid pairing from a switch record, without a name confirming it.
    Pairing,
}

impl fmt::Display for Evidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Evidence::Lifecycle => "lifecycle",
            Evidence::Snapshot => "snapshot",
            Evidence::Pairing => "pairing",
        };
        f.write_str(s)
    }
}

/// Where a scheduler pid ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Link {
    Resolved { pid: i32, tid: i32, evidence: Evidence },
    /// Placeholder scoped to the scheduler pid alone.
    Unresolved,
}

/// One canonical thread per scheduler pid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadIdentity {
    pub sched_pid: i32,
    pub name: String,
    pub kernel: bool,
    /// `RR`/`FIFO` when the snapshot shows a real-time policy
    pub realtime: Option<&'static str>,
    pub link: Link,
}

impl ThreadIdentity {
    pub fn is_unresolved(&self) -> bool {
        self.link == Link::Unresolved
    }

    pub fn tid(&self) -> i32 {
        match self.link {
            Link::Resolved { tid, .. } => tid,
            Link::Unresolved => self.sched_pid,
        }
    }

    pub fn process_key(&self) -> ProcessKey {
        match self.link {
            Link::Resolved {
                pid,
                evidence: Evidence::Snapshot,
                ..
            } => ProcessKey::Host(pid),
            Link::Resolved { pid, .. } => ProcessKey::Resolved(pid),
            Link::Unresolved => ProcessKey::Unresolved(self.sched_pid),
        }
    }

    /// Name shown in the viewer, e.g. `nginx #4242 [RR]`.
    pub fn display_name(&self) -> String {
        let mut name = format!("{} #{}", self.name, self.sched_pid);
        if let Some(tag) = self.realtime {
            name.push_str(&format!(" [{tag}]"));
        }
        name
    }
}

/// Grouping key for processes. The two resolved variants come from
/// different pid numberings and never merge, even when the numbers match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProcessKey {
    /// Pid in perf's (namespace) numbering
    Resolved(i32),
    /// Pid in the host numbering of the /proc snapshots
    Host(i32),
    /// Singleton grouping for an unresolved scheduler pid
    Unresolved(i32),
}

/// A real (non-kernel) process and the threads it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub key: ProcessKey,
    /// Pid used in the output document
    pub pid: i32,
    pub name: String,
    /// Scheduler pids of the owned threads, ordered by thread id
    pub threads: Vec<i32>,
}

impl ProcessIdentity {
    pub fn is_unresolved(&self) -> bool {
        matches!(self.key, ProcessKey::Unresolved(_))
    }
}

/// Result of resolution: threads by scheduler pid, processes by key.
#[derive(Debug, Clone, Default)]
pub struct Identities {
    pub threads: BTreeMap<i32, ThreadIdentity>,
    pub processes: BTreeMap<ProcessKey, ProcessIdentity>,
    /// Namespace (pid, tid) -> scheduler pid for resolved threads
    pub by_namespace: BTreeMap<(i32, i32), i32>,
}

impl Identities {
    pub fn thread(&self, sched_pid: i32) -> Option<&ThreadIdentity> {
        self.threads.get(&sched_pid)
    }

    /// Process owning a thread, `None` for kernel threads.
    pub fn process_of(&self, sched_pid: i32) -> Option<&ProcessIdentity> {
        let thread = self.threads.get(&sched_pid)?;
        if thread.kernel {
            return None;
        }
        self.processes.get(&thread.process_key())
    }

    pub fn kernel_threads(&self) -> impl Iterator<Item = &ThreadIdentity> {
        self.threads.values().filter(|t| t.kernel)
    }
}

/// Counters from resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolveStats {
    pub threads: usize,
    pub via_lifecycle: usize,
    pub via_snapshot: usize,
    pub via_pairing: usize,
    pub unresolved: usize,
    pub ambiguous: usize,
    pub kernel: usize,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LifecycleEntry {
    ts: u64,
    pid: i32,
    name: Option<String>,
}

/// Namespace-side index: per tid, what lifecycle records said over time.
#[derive(Debug, Default)]
pub struct LifecycleIndex {
    tids: BTreeMap<i32, Vec<LifecycleEntry>>,
}

impl LifecycleIndex {
    /// Build from the records in event order; later records supersede
    /// earlier ones from their timestamp on.
    pub fn build(events: &[RawEvent]) -> Self {
        let mut index = LifecycleIndex::default();
        for event in events {
            let RawEvent::Lifecycle(ev) = event else {
                continue;
            };
            let ts = ev.header.ts;
            match &ev.kind {
                LifecycleKind::Comm { comm, .. } => {
                    index.push(ev.tid, ts, ev.pid, Some(comm.clone()));
                }
                LifecycleKind::Fork { ptid, .. } => {
                    // A new task starts out with its parent's name.
                    let inherited = index.name_at(*ptid, ts).map(str::to_string);
                    index.push(ev.tid, ts, ev.pid, inherited);
                }
                LifecycleKind::Exit { .. } => {}
            }
        }
        index
    }

    fn push(&mut self, tid: i32, ts: u64, pid: i32, name: Option<String>) {
        self.tids
            .entry(tid)
            .or_default()
            .push(LifecycleEntry { ts, pid, name });
    }

    fn entry_at(&self, tid: i32, ts: u64) -> Option<&LifecycleEntry> {
        self.tids.get(&tid)?.iter().rev().find(|e| e.ts <= ts)
    }

    /// Pid owning `tid` as of `ts`.
    pub fn pid_at(&self, tid: i32, ts: u64) -> Option<i32> {
        self.entry_at(tid, ts).map(|e| e.pid)
    }

    /// Name of `tid` as of `ts`.
    pub fn name_at(&self, tid: i32, ts: u64) -> Option<&str> {
        self.tids
            .get(&tid)?
            .iter()
            .rev()
            .filter(|e| e.ts <= ts)
            .find_map(|e| e.name.as_deref())
    }

    /// Most recent name recorded for `tid`.
    pub fn latest_name(&self, tid: i32) -> Option<&str> {
        self.name_at(tid, u64::MAX)
    }
}

/// Host-side index over the /proc snapshots.
#[derive(Debug, Default)]
pub struct SnapshotIndex {
    by_pid: BTreeMap<i32, ProcStat>,
    before_by_comm: BTreeMap<String, BTreeSet<i32>>,
    after_by_comm: BTreeMap<String, BTreeSet<i32>>,
}

impl SnapshotIndex {
    pub fn build(metadata: &CaptureMetadata) -> Self {
        let mut index = SnapshotIndex::default();
        // `after` goes second so it wins for pids present in both.
        for stat in &metadata.before {
            index
                .before_by_comm
                .entry(comm_key(&stat.comm).to_string())
                .or_default()
                .insert(stat.pid);
            index.by_pid.insert(stat.pid, stat.clone());
        }
        for stat in &metadata.after {
            index
                .after_by_comm
                .entry(comm_key(&stat.comm).to_string())
                .or_default()
                .insert(stat.pid);
            index.by_pid.insert(stat.pid, stat.clone());
        }
        index
    }

    pub fn get(&self, pid: i32) -> Option<&ProcStat> {
        self.by_pid.get(&pid)
    }

    fn by_comm(&self, comm: &str, after: bool) -> Option<&BTreeSet<i32>> {
        if after {
            self.after_by_comm.get(comm)
        } else {
            self.before_by_comm.get(comm)
        }
    }

    /// Distinct pids in either snapshot carrying `comm`.
    fn candidates(&self, comm: &str) -> BTreeSet<i32> {
        let mut all = BTreeSet::new();
        for after in [false, true] {
            if let Some(pids) = self.by_comm(comm, after) {
                all.extend(pids.iter().copied());
            }
        }
        all
    }
}

/// What the switch records say about one scheduler pid.
#[derive(Debug, Default)]
struct Sighting {
    first_ts: u64,
    /// Name from the most recent switch record
    comm: String,
    /// Distinct (pid, tid, comm) prefixes seen when switched out, in order
    pairings: Vec<Pairing>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pairing {
    ts: u64,
    pid: i32,
    tid: i32,
    comm: String,
}

fn collect_sightings(events: &[RawEvent]) -> BTreeMap<i32, Sighting> {
    let mut seen: BTreeMap<i32, Sighting> = BTreeMap::new();
    let mut note = |pid: i32, comm: &str, ts: u64| {
        let sighting = seen.entry(pid).or_insert_with(|| Sighting {
            first_ts: ts,
            ..Sighting::default()
        });
        sighting.comm = comm.to_string();
        pid
    };

    let mut pairings: Vec<(i32, Pairing)> = Vec::new();
    for event in events {
        let (header, prev, next) = match event {
            RawEvent::Switch(SwitchEvent {
                header, prev, next, ..
            }) => (header, prev, next),
            // Runtime accounting is for the task on the core, which is the
            // one the prefix describes.
            RawEvent::Runtime(ev) => {
                if ev.pid != IDLE_PID && ev.header.pid > 0 && ev.header.tid > 0 {
                    pairings.push((
                        ev.pid,
                        Pairing {
                            ts: ev.header.ts,
                            pid: ev.header.pid,
                            tid: ev.header.tid,
                            comm: ev.comm.clone(),
                        },
                    ));
                }
                continue;
            }
            _ => continue,
        };
        if prev.pid != IDLE_PID {
            let pid = note(prev.pid, &prev.comm, header.ts);
            if header.pid > 0 && header.tid > 0 {
                pairings.push((
                    pid,
                    Pairing {
                        ts: header.ts,
                        pid: header.pid,
                        tid: header.tid,
                        comm: prev.comm.clone(),
                    },
                ));
            }
        }
        if next.pid != IDLE_PID {
            note(next.pid, &next.comm, header.ts);
        }
    }

    for (pid, pairing) in pairings {
        if let Some(sighting) = seen.get_mut(&pid) {
            let duplicate = sighting.pairings.iter().any(|p| {
                p.pid == pairing.pid && p.tid == pairing.tid && p.comm == pairing.comm
            });
            if !duplicate {
                sighting.pairings.push(pairing);
            }
        }
    }
    seen
}

fn claim_in(claims: &mut BTreeMap<(i32, i32), i32>, sched_pid: i32, pid: i32, tid: i32) -> bool {
    match claims.get(&(pid, tid)) {
        Some(owner) if *owner != sched_pid => {
            debug!("pid {sched_pid}: {pid}/{tid} already taken by pid {owner}, not merging");
            false
        }
        _ => {
            claims.insert((pid, tid), sched_pid);
            true
        }
    }
}

/// Resolver state for one pass.
struct Resolver<'a> {
    lifecycle: &'a LifecycleIndex,
    snapshot: &'a SnapshotIndex,
    policy: ResolvePolicy,
    /// Midpoint of the capture; earlier sightings prefer the `before` snapshot
    midpoint: u64,
    /// Namespace (pid, tid) pairs taken so far
    claimed: BTreeMap<(i32, i32), i32>,
    /// Host (pid, tid) pairs taken by snapshot matches
    host_claimed: BTreeMap<(i32, i32), i32>,
    stats: ResolveStats,
}

impl Resolver<'_> {
    fn claim(&mut self, sched_pid: i32, pid: i32, tid: i32) -> bool {
        claim_in(&mut self.claimed, sched_pid, pid, tid)
    }

    fn claim_host(&mut self, sched_pid: i32, pid: i32, tid: i32) -> bool {
        claim_in(&mut self.host_claimed, sched_pid, pid, tid)
    }

    fn by_lifecycle(&mut self, sched_pid: i32, sighting: &Sighting) -> Option<(i32, i32)> {
        let lifecycle = self.lifecycle;
        // Pairings the lifecycle records confirm by name.
        for pairing in &sighting.pairings {
            let confirmed = lifecycle
                .name_at(pairing.tid, pairing.ts)
                .is_some_and(|name| comm_key(name) == comm_key(&pairing.comm));
            if confirmed {
                let pid = lifecycle
                    .pid_at(pairing.tid, pairing.ts)
                    .unwrap_or(pairing.pid);
                if self.claim(sched_pid, pid, pairing.tid) {
                    return Some((pid, pairing.tid));
                }
            }
        }
        // Same number on both sides, as when perf runs outside any namespace.
        let ts = sighting.first_ts;
        let same_name = lifecycle
            .name_at(sched_pid, ts)
            .or_else(|| lifecycle.latest_name(sched_pid))
            .is_some_and(|name| comm_key(name) == comm_key(&sighting.comm));
        if same_name {
            let pid = lifecycle
                .pid_at(sched_pid, ts)
                .or_else(|| lifecycle.pid_at(sched_pid, u64::MAX))?;
            if self.claim(sched_pid, pid, sched_pid) {
                return Some((pid, sched_pid));
            }
        }
        None
    }

    fn by_snapshot(&mut self, sched_pid: i32, sighting: &Sighting) -> Option<(i32, i32)> {
        let comm = comm_key(&sighting.comm);
        if let Some(stat) = self.snapshot.get(sched_pid) {
            if comm_key(&stat.comm) == comm && self.claim_host(sched_pid, sched_pid, sched_pid) {
                return Some((sched_pid, sched_pid));
            }
        }
        if !self.policy.name_fallback {
            return None;
        }

        let candidates = self.snapshot.candidates(comm);
        let chosen = match candidates.len() {
            0 => return None,
            1 => candidates.iter().next().copied(),
            _ => {
                let after = sighting.first_ts > self.midpoint;
                self.snapshot
                    .by_comm(comm, after)
                    .filter(|pids| pids.len() == 1)
                    .and_then(|pids| pids.iter().next().copied())
            }
        };
        match chosen {
            Some(pid) if self.claim_host(sched_pid, pid, sched_pid) => Some((pid, sched_pid)),
            Some(_) => None,
            None => {
                self.stats.ambiguous += 1;
                self.stats.diagnostics.push(Diagnostic::AmbiguousName {
                    sched_pid,
                    comm: sighting.comm.clone(),
                    candidates: candidates.into_iter().collect(),
                });
                None
            }
        }
    }

    fn by_pairing(&mut self, sched_pid: i32, sighting: &Sighting) -> Option<(i32, i32)> {
        if !self.policy.trust_pairings {
            return None;
        }
        for pairing in &sighting.pairings {
            if self.claim(sched_pid, pairing.pid, pairing.tid) {
                return Some((pairing.pid, pairing.tid));
            }
        }
        None
    }

    fn resolve(&mut self, sched_pid: i32, sighting: &Sighting) -> ThreadIdentity {
        let link = if let Some((pid, tid)) = self.by_lifecycle(sched_pid, sighting) {
            self.stats.via_lifecycle += 1;
            Link::Resolved {
                pid,
                tid,
                evidence: Evidence::Lifecycle,
            }
        } else if let Some((pid, tid)) = self.by_snapshot(sched_pid, sighting) {
            self.stats.via_snapshot += 1;
            Link::Resolved {
                pid,
                tid,
                evidence: Evidence::Snapshot,
            }
        } else if let Some((pid, tid)) = self.by_pairing(sched_pid, sighting) {
            self.stats.via_pairing += 1;
            Link::Resolved {
                pid,
                tid,
                evidence: Evidence::Pairing,
            }
        } else {
            Link::Unresolved
        };

        let name = match &link {
            Link::Resolved {
                tid,
                evidence: Evidence::Lifecycle,
                ..
            } => self
                .lifecycle
                .latest_name(*tid)
                .unwrap_or(&sighting.comm)
                .to_string(),
            _ => sighting.comm.clone(),
        };
        let stat = self.snapshot.get(sched_pid);
        let kernel = stat.is_some_and(ProcStat::is_kernel_thread);
        let realtime = stat.and_then(|s| s.sched_policy().realtime_tag());

        if kernel {
            self.stats.kernel += 1;
        }
        // Kernel threads are grouped under the kernel pseudo-process anyway,
        // so only user threads count against resolution.
        if link == Link::Unresolved && !kernel {
            self.stats.unresolved += 1;
            self.stats.diagnostics.push(Diagnostic::Unresolved {
                sched_pid,
                comm: sighting.comm.clone(),
            });
        }

        ThreadIdentity {
            sched_pid,
            name,
            kernel,
            realtime,
            link,
        }
    }
}

/// Build the process table from resolved threads.
///
/// Output pids come from the numbering each key was resolved in. Namespace
/// pids are taken first, then host pids, then the scheduler pids of
/// unresolved singletons; anything that would reuse a taken pid gets a
/// fresh one above every pid in play.
fn group_processes(
    threads: &BTreeMap<i32, ThreadIdentity>,
    lifecycle: &LifecycleIndex,
    snapshot: &SnapshotIndex,
) -> BTreeMap<ProcessKey, ProcessIdentity> {
    let mut members: BTreeMap<ProcessKey, Vec<&ThreadIdentity>> = BTreeMap::new();
    for thread in threads.values().filter(|t| !t.kernel) {
        members.entry(thread.process_key()).or_default().push(thread);
    }

    let wanted = |key: &ProcessKey| match *key {
        ProcessKey::Resolved(pid) | ProcessKey::Host(pid) | ProcessKey::Unresolved(pid) => pid,
    };
    let mut next_free = members
        .keys()
        .map(wanted)
        .chain(threads.keys().copied())
        .max()
        .map_or(1, |max| max + 1);
    let mut used = BTreeSet::new();

    // BTreeMap order is Resolved, Host, Unresolved: the precedence above.
    let mut processes = BTreeMap::new();
    for (key, mut owned) in members {
        owned.sort_by_key(|t| (t.tid(), t.sched_pid));
        let name = match key {
            ProcessKey::Resolved(pid) => lifecycle.latest_name(pid).map(str::to_string),
            ProcessKey::Host(pid) => snapshot.get(pid).map(|s| s.comm.clone()),
            ProcessKey::Unresolved(_) => None,
        }
        .unwrap_or_else(|| owned[0].name.clone());

        let mut pid = wanted(&key);
        if !used.insert(pid) {
            debug!("process {key:?}: pid {pid} already in use, shown as {next_free}");
            pid = next_free;
            next_free += 1;
            used.insert(pid);
        }
        processes.insert(
            key,
            ProcessIdentity {
                key,
                pid,
                name,
                threads: owned.iter().map(|t| t.sched_pid).collect(),
            },
        );
    }
    processes
}

/// Resolve every scheduler pid seen in a switch record.
pub fn resolve(
    events: &[RawEvent],
    metadata: &CaptureMetadata,
    policy: ResolvePolicy,
) -> (Identities, ResolveStats) {
    let lifecycle = LifecycleIndex::build(events);
    let snapshot = SnapshotIndex::build(metadata);
    let sightings = collect_sightings(events);

    let trace_start = sightings.values().map(|s| s.first_ts).min().unwrap_or(0);
    let midpoint = trace_start.saturating_add(duration_ns(metadata.duration / 2));

    let mut resolver = Resolver {
        lifecycle: &lifecycle,
        snapshot: &snapshot,
        policy,
        midpoint,
        claimed: BTreeMap::new(),
        host_claimed: BTreeMap::new(),
        stats: ResolveStats::default(),
    };

    let mut threads = BTreeMap::new();
    for (sched_pid, sighting) in &sightings {
        let identity = resolver.resolve(*sched_pid, sighting);
        threads.insert(*sched_pid, identity);
    }

    let mut stats = resolver.stats;
    stats.threads = threads.len();
    let by_namespace = resolver.claimed;
    let processes = group_processes(&threads, &lifecycle, &snapshot);
    debug!(
        "Resolved {} threads ({} lifecycle, {} snapshot, {} pairing, {} unresolved) into {} processes",
        stats.threads,
        stats.via_lifecycle,
        stats.via_snapshot,
        stats.via_pairing,
        stats.unresolved,
        processes.len()
    );

    (
        Identities {
            threads,
            processes,
            by_namespace,
        },
        stats,
    )
}
