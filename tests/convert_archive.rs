//! End-to-end conversions of packed recordings through the library API.

mod common;

use std::fs;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tempfile::TempDir;

use common::{metadata_arg, pid_of, read_json, write_recording, Packing};
use sched2trace::perf_script::parse_events;
use sched2trace::timeline::{build_timeline, ThreadState};
use sched2trace::{convert_archive, ConvertConfig, ResolvePolicy, TimeWindow};

fn config_for(dir: &TempDir, output: &str) -> ConvertConfig {
    ConvertConfig {
        output: dir.path().join(output),
        ..ConvertConfig::default()
    }
}

fn complete_events<'a>(events: &'a [JsonValue], pid: i64, tid: i64) -> Vec<&'a JsonValue> {
    events
        .iter()
        .filter(|e| e["ph"] == "X" && e["pid"] == pid && e["tid"] == tid)
        .collect()
}

#[test]
fn test_process_layout() {
    let dir = TempDir::new().unwrap();
    let input = write_recording(dir.path(), "capture.tar.gz", Packing::Gzip);
    let config = config_for(&dir, "trace.json");
    let report = convert_archive(&input, &config).unwrap();
    let events = read_json(&config.output);

    // Pseudo-processes on top, then busiest first.
    let order: Vec<&str> = events
        .iter()
        .filter(|e| e["ph"] == "M" && e["name"] == "process_name")
        .map(|e| e["args"]["name"].as_str().unwrap())
        .collect();
    assert_eq!(order, vec!["CPUs", "kernel", "server", "mystery"]);

    let cpus = pid_of(&events, "CPUs").unwrap();
    let kernel = pid_of(&events, "kernel").unwrap();
    let server = pid_of(&events, "server").unwrap();
    let mystery = pid_of(&events, "mystery").unwrap();
    assert_eq!((cpus, kernel, server, mystery), (0, 2, 1, 9999));

    let sort = |pid| metadata_arg(&events, "process_sort_index", pid, None).cloned();
    assert_eq!(sort(cpus), Some(JsonValue::from(0)));
    assert_eq!(sort(kernel), Some(JsonValue::from(1)));
    assert_eq!(sort(server), Some(JsonValue::from(2)));
    assert_eq!(sort(mystery), Some(JsonValue::from(3)));

    // Container threads keep their namespace ids, named with the scheduler pid.
    assert_eq!(
        metadata_arg(&events, "thread_name", server, Some(1)).unwrap(),
        "server #4242"
    );
    assert_eq!(
        metadata_arg(&events, "thread_name", server, Some(2)).unwrap(),
        "worker #4243"
    );
    assert_eq!(
        metadata_arg(&events, "thread_name", kernel, Some(57)).unwrap(),
        "kworker/0:1 #57"
    );
    let label = metadata_arg(&events, "process_labels", mystery, None).unwrap();
    assert!(label.as_str().unwrap().contains("unresolved"));

    assert_eq!(report.resolve.unresolved, 1);
    assert_eq!(report.resolve.kernel, 1);
    assert_eq!(report.metadata.diagnostics.total, 1);
    assert_eq!(report.parse.diagnostics.total, 1);
    assert_eq!(report.parse.runtime_stats, 1);
    assert_eq!(report.timeline.runtime_samples, 1);
    assert!(report.parse.skipped.is_empty());
    assert!(report.has_warnings());
}

#[test]
fn test_intervals_and_highlights() {
    let dir = TempDir::new().unwrap();
    let input = write_recording(dir.path(), "capture.tar.gz", Packing::Gzip);
    let config = config_for(&dir, "trace.json");
    convert_archive(&input, &config).unwrap();
    let events = read_json(&config.output);

    let server = complete_events(&events, 1, 1);
    let names: Vec<&str> = server.iter().map(|e| e["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["Running", "Blocked", "Running"]);
    assert_eq!(server[0]["ts"], 1_000_000_000.0);
    assert_eq!(server[0]["dur"], 10_000.0);
    assert_eq!(server[0]["args"]["end state"], "S [Sleeping]");
    assert_eq!(server[1]["args"]["wakeup latency (ns)"], 5_000_000);
    assert_eq!(server[2]["args"]["open at trace end"], true);
    // No accounting on core 0, so the run length stands in.
    assert_eq!(server[0]["args"]["Non-CFS runtime (ns)"], 10_000_000);
    assert!(server[2]["args"].get("Non-CFS runtime (ns)").is_none());

    let worker = complete_events(&events, 1, 2);
    assert_eq!(worker[0]["name"], "Running");
    assert_eq!(worker[0]["args"]["CFS runtime (ns)"], 14_000_000);
    assert_eq!(worker[0]["args"]["CFS vruntime (ns)"], 100);

    // Only the 10 ms block qualifies; blocks cut off by the end don't.
    let highlighted = complete_events(&events, 0, -1);
    assert_eq!(highlighted.len(), 1);
    assert_eq!(highlighted[0]["name"], "server #4242");

    let cpu1: Vec<&str> = complete_events(&events, 0, 1)
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert_eq!(cpu1, vec!["kworker/0:1 #57", "worker #4243", "mystery #9999"]);

    let spawn: Vec<_> = events
        .iter()
        .filter(|e| e["ph"] == "i" && e["name"] == "thread_spawn")
        .collect();
    assert_eq!(spawn.len(), 1);
    assert_eq!((&spawn[0]["pid"], &spawn[0]["tid"]), (&JsonValue::from(1), &JsonValue::from(2)));
    assert_eq!(spawn[0]["args"]["tid"], 3);
}

#[test]
fn test_idempotent_and_compression_independent() {
    let dir = TempDir::new().unwrap();
    let mut outputs = Vec::new();
    for (idx, packing) in [Packing::Gzip, Packing::Gzip, Packing::Xz, Packing::Bzip2, Packing::Plain]
        .into_iter()
        .enumerate()
    {
        // Misleading extension on purpose: the format is sniffed.
        let input = write_recording(dir.path(), &format!("capture{idx}.tar.gz"), packing);
        let config = config_for(&dir, &format!("trace{idx}.json"));
        convert_archive(&input, &config).unwrap();
        outputs.push(fs::read(&config.output).unwrap());
    }
    for output in &outputs[1..] {
        assert_eq!(output, &outputs[0]);
    }
}

#[test]
fn test_window_and_policy_options() {
    let dir = TempDir::new().unwrap();
    let input = write_recording(dir.path(), "capture.tar.xz", Packing::Xz);
    let config = ConvertConfig {
        window: TimeWindow {
            skip: Duration::from_millis(25),
            duration: Some(Duration::from_millis(100)),
        },
        resolve: ResolvePolicy {
            name_fallback: false,
            trust_pairings: false,
        },
        ..config_for(&dir, "trace.json")
    };
    let report = convert_archive(&input, &config).unwrap();
    let events = read_json(&config.output);

    assert!(report.timeline.outside_window > 0);
    // Lifecycle-confirmed pairings don't depend on the fallbacks.
    assert_eq!(report.resolve.via_lifecycle, 2);
    let last_end = events
        .iter()
        .filter(|e| e["ph"] == "X")
        .map(|e| e["ts"].as_f64().unwrap() + e["dur"].as_f64().unwrap())
        .fold(0.0, f64::max);
    assert!(last_end <= 1_000_125_000.0 + 0.001);
}

#[test]
fn test_timeline_properties_on_fixture() {
    let (events, _) = parse_events(common::EVENTS);
    let (timeline, _) = build_timeline(&events, Duration::from_secs(2), TimeWindow::default());

    for intervals in timeline.threads.values() {
        for pair in intervals.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
            assert_ne!(pair[0].state, pair[1].state);
        }
        let total: u64 = intervals.iter().map(|i| i.duration()).sum();
        let span = intervals.last().unwrap().end - intervals.first().unwrap().start;
        assert_eq!(total, span);
    }
    for intervals in timeline.cores.values() {
        for pair in intervals.windows(2) {
            assert!(pair[0].end <= pair[1].start);
        }
    }
    assert_eq!(
        timeline.threads[&4242]
            .iter()
            .filter(|i| i.state == ThreadState::Running)
            .count(),
        2
    );
}

#[test]
fn test_broken_archives_are_fatal() {
    let dir = TempDir::new().unwrap();
    let config = config_for(&dir, "trace.json");

    let one_member = dir.path().join("one.tar");
    fs::write(
        &one_member,
        common::pack(&[(common::METADATA_MEMBER, common::METADATA)], Packing::Plain),
    )
    .unwrap();
    let err = convert_archive(&one_member, &config).unwrap_err();
    assert!(format!("{err:#}").contains("Expected 2 archive members"));

    let no_date = dir.path().join("nodate.tar");
    fs::write(
        &no_date,
        common::pack(
            &[
                (common::METADATA_MEMBER, "# duration: 1 seconds\n"),
                (common::EVENTS_MEMBER, common::EVENTS),
            ],
            Packing::Plain,
        ),
    )
    .unwrap();
    let err = convert_archive(&no_date, &config).unwrap_err();
    assert!(format!("{err:#}").contains("'date'"));
    assert!(!config.output.exists());
}
