//! Runs the stages end to end.

use std::path::Path;

use anyhow::Result;
use tracing::{debug, info};

use crate::archive;
use crate::config::ConvertConfig;
use crate::diagnostics::ConversionReport;
use crate::identity::resolve;
use crate::metadata::parse_metadata;
use crate::perf_script::parse_events;
use crate::pseudo::synthesize;
use crate::rank::rank;
use crate::timeline::build_timeline;
use crate::trace_event::{build_trace, write_trace, TraceEvent, TraceInput};

/// A converted recording, not yet written anywhere.
#[derive(Debug, Clone)]
pub struct Conversion {
    pub events: Vec<TraceEvent>,
    pub report: ConversionReport,
}

/// Convert the two text members of a recording.
///
/// Only missing or unusable metadata is fatal; everything else degrades and
/// is counted in the report.
pub fn convert(metadata_text: &str, events_text: &str, config: &ConvertConfig) -> Result<Conversion> {
    let (metadata, metadata_stats) = parse_metadata(metadata_text)?;
    info!(
        "Capture from {} lasting {:?}, {} + {} snapshot entries",
        metadata.date,
        metadata.duration,
        metadata.before.len(),
        metadata.after.len()
    );

    let (events, parse_stats) = parse_events(events_text);
    info!(
        "Parsed {} records from {} lines ({} switches, {} wakeups, {} lifecycle, {} runtime)",
        parse_stats.events(),
        parse_stats.lines,
        parse_stats.switches,
        parse_stats.wakeups,
        parse_stats.lifecycle,
        parse_stats.runtime_stats
    );
    // Timestamps are passed through at whatever resolution perf printed.
    let resolution = parse_stats.source_resolution_ns();
    if parse_stats.events() > 0 {
        if resolution > 1 {
            info!("Source timestamps have {resolution} ns resolution, output is not refined");
        } else {
            debug!("Source timestamps have nanosecond resolution");
        }
    }

    let (identities, resolve_stats) = resolve(&events, &metadata, config.resolve);
    let (timeline, timeline_stats) = build_timeline(&events, metadata.duration, config.window);
    let pseudo = synthesize(&timeline, &identities, config.blocked_threshold);
    let ranked = rank(&identities, &timeline);

    let trace = build_trace(&TraceInput {
        events: &events,
        identities: &identities,
        timeline: &timeline,
        pseudo: &pseudo,
        ranked: &ranked,
    });
    info!(
        "{} processes, {} threads, {} trace events",
        ranked.len(),
        timeline.threads.len(),
        trace.len()
    );

    let report = ConversionReport {
        metadata: metadata_stats,
        parse: parse_stats,
        resolve: resolve_stats,
        timeline: timeline_stats,
        emitted_events: trace.len(),
    };
    Ok(Conversion {
        events: trace,
        report,
    })
}

/// Convert the archive at `input` and write the result to `config.output`.
pub fn convert_archive(input: &Path, config: &ConvertConfig) -> Result<ConversionReport> {
    let members = archive::read_archive(input)?;
    let conversion = convert(&members.metadata, &members.events, config)?;
    write_trace(&config.output, &conversion.events)?;
    info!("Wrote {}", config.output.display());
    Ok(conversion.report)
}
