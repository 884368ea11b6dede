//! Synthetic processes shown above the real ones: per-core activity and a
//! catch-all for kernel threads and idle time.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::config::duration_ns;
use crate::identity::{Identities, IDLE_PID};
use crate::timeline::{ThreadState, Timeline};

pub const CPU_PROCESS_NAME: &str = "CPUs";
pub const CPU_PROCESS_LABEL: &str = "(Virtual process representing CPU usage)";
pub const KERNEL_PROCESS_NAME: &str = "kernel";
pub const KERNEL_PROCESS_LABEL: &str = "(Virtual process for kernel threads and idle time)";
pub const IDLE_NAME: &str = "idle";

/// Track id of the long-blocked highlight track inside the CPU process.
/// Core tracks use the core number, so any negative id is free.
pub const BLOCKED_TRACK_TID: i32 = -1;

/// Track id of the idle track for `cpu` inside the kernel process. Kernel
/// threads use their scheduler pid, which is never negative.
pub fn idle_track_tid(cpu: u32) -> i32 {
    -1 - i32::try_from(cpu).unwrap_or(i32::MAX - 1)
}

/// One labelled span on a synthetic track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice {
    pub start: u64,
    pub end: u64,
    pub name: String,
    /// Task the slice is about (0 for idle)
    pub sched_pid: i32,
    /// Expanded state the slice started or ended in
    pub state: Option<String>,
    pub wakeup_latency: Option<u64>,
}

/// A synthetic track, emitted as one thread of a pseudo-process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub tid: i32,
    pub name: String,
    pub slices: Vec<Slice>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PseudoProcess {
    pub pid: i32,
    pub name: &'static str,
    pub label: &'static str,
    /// Synthetic tracks, in display order
    pub tracks: Vec<Track>,
    /// Real threads shown under this process, by scheduler pid
    pub threads: Vec<i32>,
}

/// Both pseudo-processes, in display order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PseudoProcesses {
    pub cpu: PseudoProcess,
    pub kernel: PseudoProcess,
}

impl PseudoProcesses {
    pub fn iter(&self) -> impl Iterator<Item = &PseudoProcess> {
        [&self.cpu, &self.kernel].into_iter()
    }
}

/// Lowest non-negative ids not used by a real process, in order.
fn free_pids(used: &BTreeSet<i32>) -> impl Iterator<Item = i32> + '_ {
    (0..).filter(move |pid| !used.contains(pid))
}

fn label_of(identities: &Identities, sched_pid: i32) -> String {
    identities
        .thread(sched_pid)
        .map_or_else(|| format!("#{sched_pid}"), |t| t.display_name())
}

fn cpu_tracks(timeline: &Timeline, identities: &Identities) -> Vec<Track> {
    timeline
        .cores
        .iter()
        .map(|(cpu, intervals)| Track {
            tid: i32::try_from(*cpu).unwrap_or(i32::MAX),
            name: format!("CPU {cpu}"),
            slices: intervals
                .iter()
                .map(|interval| Slice {
                    start: interval.start,
                    end: interval.end,
                    name: label_of(identities, interval.sched_pid),
                    sched_pid: interval.sched_pid,
                    state: None,
                    wakeup_latency: None,
                })
                .collect(),
        })
        .collect()
}

fn blocked_track(timeline: &Timeline, identities: &Identities, threshold: Duration) -> Track {
    let threshold_ns = duration_ns(threshold);
    let mut slices: Vec<Slice> = timeline
        .threads
        .iter()
        .flat_map(|(sched_pid, intervals)| {
            intervals
                .iter()
                .filter(move |i| {
                    i.state == ThreadState::Blocked
                        && !i.closed_at_end
                        && i.duration() > threshold_ns
                })
                .map(move |i| (*sched_pid, i))
        })
        .map(|(sched_pid, interval)| Slice {
            start: interval.start,
            end: interval.end,
            name: label_of(identities, sched_pid),
            sched_pid,
            state: interval.label.clone(),
            wakeup_latency: interval.wakeup_latency,
        })
        .collect();
    slices.sort_by_key(|s| (s.start, s.sched_pid));

    Track {
        tid: BLOCKED_TRACK_TID,
        name: format!("Blocked > {} ms", threshold_ns as f64 / 1_000_000.0),
        slices,
    }
}

/// Gaps between running intervals on each core within the trace bounds.
fn idle_tracks(timeline: &Timeline) -> Vec<Track> {
    timeline
        .cores
        .iter()
        .map(|(cpu, intervals)| {
            let mut slices = Vec::new();
            let mut cursor = timeline.start;
            for interval in intervals {
                if interval.start > cursor {
                    slices.push(idle_slice(cursor, interval.start));
                }
                cursor = cursor.max(interval.end);
            }
            if timeline.end > cursor {
                slices.push(idle_slice(cursor, timeline.end));
            }
            Track {
                tid: idle_track_tid(*cpu),
                name: format!("{IDLE_NAME} (CPU {cpu})"),
                slices,
            }
        })
        .collect()
}

fn idle_slice(start: u64, end: u64) -> Slice {
    Slice {
        start,
        end,
        name: IDLE_NAME.to_string(),
        sched_pid: IDLE_PID,
        state: None,
        wakeup_latency: None,
    }
}

/// Build the CPU and kernel pseudo-processes.
pub fn synthesize(
    timeline: &Timeline,
    identities: &Identities,
    blocked_threshold: Duration,
) -> PseudoProcesses {
    let used: BTreeSet<i32> = identities.processes.values().map(|p| p.pid).collect();
    let mut pids = free_pids(&used);
    let cpu_pid = pids.next().unwrap_or(0);
    let kernel_pid = pids.next().unwrap_or(1);

    let mut tracks = cpu_tracks(timeline, identities);
    tracks.push(blocked_track(timeline, identities, blocked_threshold));
    let cpu = PseudoProcess {
        pid: cpu_pid,
        name: CPU_PROCESS_NAME,
        label: CPU_PROCESS_LABEL,
        tracks,
        threads: Vec::new(),
    };

    let kernel = PseudoProcess {
        pid: kernel_pid,
        name: KERNEL_PROCESS_NAME,
        label: KERNEL_PROCESS_LABEL,
        tracks: idle_tracks(timeline),
        threads: identities
            .kernel_threads()
            .map(|t| t.sched_pid)
            .filter(|pid| timeline.threads.contains_key(pid))
            .collect(),
    };

    PseudoProcesses { cpu, kernel }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::identity::{Link, ProcessIdentity, ProcessKey, ThreadIdentity};
    use crate::timeline::{CoreInterval, Interval};

    const MS: u64 = 1_000_000;

    fn blocked(start: u64, end: u64, closed_at_end: bool) -> Interval {
        Interval {
            start,
            end,
            state: ThreadState::Blocked,
            cpu: None,
            prio: None,
            label: Some("S [Sleeping]".to_string()),
            wakeup_latency: None,
            runtime: None,
            closed_at_end,
        }
    }

    fn running(start: u64, end: u64) -> Interval {
        Interval {
            start,
            end,
            state: ThreadState::Running,
            cpu: Some(0),
            prio: Some(120),
            label: None,
            wakeup_latency: None,
            runtime: None,
            closed_at_end: false,
        }
    }

    fn thread(sched_pid: i32, name: &str, kernel: bool) -> ThreadIdentity {
        ThreadIdentity {
            sched_pid,
            name: name.to_string(),
            kernel,
            realtime: None,
            link: Link::Unresolved,
        }
    }

    fn identities(threads: Vec<ThreadIdentity>, process_pids: &[i32]) -> Identities {
        let processes = process_pids
            .iter()
            .map(|pid| {
                let key = ProcessKey::Resolved(*pid);
                let process = ProcessIdentity {
                    key,
                    pid: *pid,
                    name: format!("p{pid}"),
                    threads: Vec::new(),
                };
                (key, process)
            })
            .collect();
        Identities {
            threads: threads.into_iter().map(|t| (t.sched_pid, t)).collect(),
            processes,
            by_namespace: BTreeMap::new(),
        }
    }

    #[test]
    fn test_blocked_threshold_is_strict_and_skips_open_intervals() {
        let mut timeline = Timeline {
            start: 0,
            end: 100 * MS,
            ..Timeline::default()
        };
        timeline
            .threads
            .insert(10, vec![running(0, MS), blocked(MS, 5 * MS, false)]);
        timeline
            .threads
            .insert(11, vec![running(0, MS), blocked(MS, 3 * MS, false)]);
        timeline
            .threads
            .insert(12, vec![running(0, MS), blocked(MS, 100 * MS, true)]);
        let ids = identities(
            vec![
                thread(10, "four", false),
                thread(11, "two", false),
                thread(12, "open", false),
            ],
            &[],
        );

        let pseudo = synthesize(&timeline, &ids, Duration::from_millis(3));
        let track = pseudo.cpu.tracks.last().unwrap();
        assert_eq!(track.tid, BLOCKED_TRACK_TID);
        assert_eq!(track.name, "Blocked > 3 ms");
        let names: Vec<_> = track.slices.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["four #10"]);
        assert_eq!(track.slices[0].state.as_deref(), Some("S [Sleeping]"));
    }

    #[test]
    fn test_core_tracks_and_idle_complement() {
        let mut timeline = Timeline {
            start: 0,
            end: 100,
            ..Timeline::default()
        };
        timeline.cores.insert(
            2,
            vec![
                CoreInterval {
                    start: 10,
                    end: 40,
                    sched_pid: 5,
                    closed_at_end: false,
                },
                CoreInterval {
                    start: 60,
                    end: 90,
                    sched_pid: 6,
                    closed_at_end: false,
                },
            ],
        );
        let ids = identities(vec![thread(5, "a", false), thread(6, "b", false)], &[]);
        let pseudo = synthesize(&timeline, &ids, Duration::from_millis(3));

        let core = &pseudo.cpu.tracks[0];
        assert_eq!(core.tid, 2);
        assert_eq!(core.name, "CPU 2");
        assert_eq!(core.slices[0].name, "a #5");

        let idle = &pseudo.kernel.tracks[0];
        assert_eq!(idle.tid, idle_track_tid(2));
        let gaps: Vec<_> = idle.slices.iter().map(|s| (s.start, s.end)).collect();
        assert_eq!(gaps, vec![(0, 10), (40, 60), (90, 100)]);
    }

    #[test]
    fn test_pseudo_pids_avoid_real_processes() {
        let timeline = Timeline::default();
        let ids = identities(Vec::new(), &[0, 2]);
        let pseudo = synthesize(&timeline, &ids, Duration::from_millis(3));
        assert_eq!(pseudo.cpu.pid, 1);
        assert_eq!(pseudo.kernel.pid, 3);
        let names: Vec<_> = pseudo.iter().map(|p| p.name).collect();
        assert_eq!(names, vec![CPU_PROCESS_NAME, KERNEL_PROCESS_NAME]);
    }

    #[test]
    fn test_kernel_threads_grouped() {
        let mut timeline = Timeline {
            start: 0,
            end: 10,
            ..Timeline::default()
        };
        timeline.threads.insert(57, vec![running(0, 10)]);
        let ids = identities(
            vec![thread(57, "kworker/0:1", true), thread(58, "ksoftirqd/0", true)],
            &[],
        );
        let pseudo = synthesize(&timeline, &ids, Duration::from_millis(3));
        assert_eq!(pseudo.kernel.threads, vec![57]);
    }
}
