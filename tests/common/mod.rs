//! Shared fixtures for the integration tests: a small recording of a
//! containerised server, packed the way the capture script packs it.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use bzip2::write::BzEncoder;
use flate2::write::GzEncoder;
use serde_json::Value as JsonValue;
use xz2::write::XzEncoder;

pub const METADATA: &str = "\
## System performance data
# date: Tue Jul 18 16:10:18 UTC 2023
# system: Linux host 6.1.0 #1 SMP x86_64 GNU/Linux
# duration: 2 seconds
# perf-version: perf version 6.1
# perf-sched-cmd: perf sched record --mmap-pages 8M sleep 2
# perf-script-cmd: perf script --show-task-events --fields pid,tid,cpu,time,event,trace --ns
# collector: v2
## before
1 (init) S 0 1 1 0 -1 4194560 0 0 0 0 12 30 0 0 20 0 1 0 10
2 (kthreadd) S 0 0 0 0 -1 2129984 0 0 0 0 0 0 0 0 20 0 1 0 10
57 (kworker/0:1) I 2 0 0 0 -1 69238880 0 0 0 0 0 0 0 0 20 0 1 0 300
this line is cut sh
## after
1 (init) S 0 1 1 0 -1 4194560 0 0 0 0 12 31 0 0 20 0 1 0 10
57 (kworker/0:1) I 2 0 0 0 -1 69238880 0 0 0 0 0 0 0 0 20 0 1 0 300
";

/// Container pid 1 is `server` (scheduler pid 4242) with a `worker` thread
/// (4243). 9999 never shows up in any lifecycle record or snapshot.
pub const EVENTS: &str = "\
    0/0     [000]     0.000000000: PERF_RECORD_COMM: server:1/1
    0/0     [000]     0.000000000: PERF_RECORD_COMM: worker:1/2
    0/0     [000]  1000.000000000:       sched:sched_switch: prev_comm=swapper/0 prev_pid=0 prev_prio=120 prev_state=R ==> next_comm=server next_pid=4242 next_prio=120
    0/0     [001]  1000.001000000:       sched:sched_switch: prev_comm=swapper/1 prev_pid=0 prev_prio=120 prev_state=R ==> next_comm=kworker/0:1 next_pid=57 next_prio=120
    0/0     [001]  1000.002000000:       sched:sched_switch: prev_comm=kworker/0:1 prev_pid=57 prev_prio=120 prev_state=I ==> next_comm=worker next_pid=4243 next_prio=120
    1/1     [000]  1000.010000000:       sched:sched_switch: prev_comm=server prev_pid=4242 prev_prio=120 prev_state=S ==> next_comm=swapper/0 next_pid=0 next_prio=120
    1/2     [001]  1000.015000000:       sched:sched_wakeup: comm=server pid=4242 prio=120 target_cpu=000
    1/2     [001]  1000.016000000:       sched:sched_stat_runtime: comm=worker pid=4243 runtime=14000000 [ns] vruntime=100 [ns]
    0/0     [000]  1000.020000000:       sched:sched_switch: prev_comm=swapper/0 prev_pid=0 prev_prio=120 prev_state=R ==> next_comm=server next_pid=4242 next_prio=120
    1/2     [001]  1000.025000000: PERF_RECORD_FORK(1:3):(1:2)
    1/2     [001]  1000.030000000:       sched:sched_switch: prev_comm=worker prev_pid=4243 prev_prio=120 prev_state=S ==> next_comm=swapper/1 next_pid=0 next_prio=120
    0/0     [001]  1000.031000000:       sched:sched_switch: prev_comm=swapper/1 prev_pid=0 prev_prio=120 prev_state=R ==> next_comm=mystery next_pid=9999 next_prio=120
garbage that perf never prints
";

pub const METADATA_MEMBER: &str = "perf-mdata.txt";
pub const EVENTS_MEMBER: &str = "perf.data.txt";

#[derive(Debug, Clone, Copy)]
pub enum Packing {
    Plain,
    Gzip,
    Xz,
    Bzip2,
}

pub fn tar_bytes(members: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, content.as_bytes())
            .expect("append tar member");
    }
    builder.into_inner().expect("finish tar")
}

pub fn pack(members: &[(&str, &str)], packing: Packing) -> Vec<u8> {
    let tar = tar_bytes(members);
    match packing {
        Packing::Plain => tar,
        Packing::Gzip => {
            let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(&tar).unwrap();
            enc.finish().unwrap()
        }
        Packing::Xz => {
            let mut enc = XzEncoder::new(Vec::new(), 6);
            enc.write_all(&tar).unwrap();
            enc.finish().unwrap()
        }
        Packing::Bzip2 => {
            let mut enc = BzEncoder::new(Vec::new(), bzip2::Compression::default());
            enc.write_all(&tar).unwrap();
            enc.finish().unwrap()
        }
    }
}

/// Write the standard recording into `dir` under `name`.
pub fn write_recording(dir: &Path, name: &str, packing: Packing) -> PathBuf {
    let path = dir.join(name);
    let bytes = pack(
        &[(METADATA_MEMBER, METADATA), (EVENTS_MEMBER, EVENTS)],
        packing,
    );
    fs::write(&path, bytes).unwrap();
    path
}

pub fn read_json(path: &Path) -> Vec<JsonValue> {
    let text = fs::read_to_string(path).unwrap();
    let value: JsonValue = serde_json::from_str(&text).unwrap();
    value.as_array().expect("top-level array").clone()
}

/// Value of the metadata record `name` for `pid` (and `tid`, if given).
#[allow(dead_code)]
pub fn metadata_arg<'a>(
    events: &'a [JsonValue],
    name: &str,
    pid: i64,
    tid: Option<i64>,
) -> Option<&'a JsonValue> {
    events
        .iter()
        .filter(|e| e["ph"] == "M" && e["name"] == name && e["pid"] == pid)
        .find(|e| tid.map_or(true, |tid| e["tid"] == tid))
        .map(|e| {
            let args = &e["args"];
            if args.get("name").is_some() {
                &args["name"]
            } else if args.get("labels").is_some() {
                &args["labels"]
            } else {
                &args["sort_index"]
            }
        })
}

/// Pid of the process named `name`.
#[allow(dead_code)]
pub fn pid_of(events: &[JsonValue], name: &str) -> Option<i64> {
    events
        .iter()
        .find(|e| e["ph"] == "M" && e["name"] == "process_name" && e["args"]["name"] == name)
        .and_then(|e| e["pid"].as_i64())
}
