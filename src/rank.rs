//! Orders real processes by how much they ran.

use crate::identity::{Identities, ProcessKey};
use crate::timeline::Timeline;

/// Sort indexes below this are taken by the pseudo-processes.
pub const FIRST_PROCESS_SORT_INDEX: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedProcess {
    pub key: ProcessKey,
    pub pid: i32,
    /// Running time summed over the process's threads
    pub running_ns: u64,
    pub sort_index: i64,
}

/// Rank the processes that have at least one thread on the timeline, busiest
/// first; ties go to the lower pid.
pub fn rank(identities: &Identities, timeline: &Timeline) -> Vec<RankedProcess> {
    let mut ranked: Vec<RankedProcess> = identities
        .processes
        .values()
        .filter(|process| {
            process
                .threads
                .iter()
                .any(|pid| timeline.threads.contains_key(pid))
        })
        .map(|process| RankedProcess {
            key: process.key,
            pid: process.pid,
            running_ns: process
                .threads
                .iter()
                .map(|pid| timeline.running_ns(*pid))
                .sum(),
            sort_index: 0,
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.running_ns
            .cmp(&a.running_ns)
            .then(a.pid.cmp(&b.pid))
            .then(a.key.cmp(&b.key))
    });
    for (idx, process) in ranked.iter_mut().enumerate() {
        process.sort_index = FIRST_PROCESS_SORT_INDEX + idx as i64;
    }
    ranked
}
