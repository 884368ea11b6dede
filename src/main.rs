use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use sched2trace::config::DEFAULT_BLOCKED_THRESHOLD;
use sched2trace::{convert_archive, ConvertConfig, ResolvePolicy, TimeWindow};

/// Convert a `perf sched` recording archive into Chrome Trace Event JSON
/// (viewable in Perfetto UI or chrome://tracing).
#[derive(Debug, Parser)]
#[command(name = "sched2trace", version)]
struct Command {
    /// Recording archive (tar, optionally gzip/xz/bzip2 compressed)
    input: PathBuf,

    /// Where to write the JSON trace
    output: PathBuf,

    /// Seconds to skip from the start of the recording
    #[arg(short, long, default_value_t = 0.0)]
    skip: f64,

    /// Seconds to convert after the skipped part (default: everything)
    #[arg(short, long)]
    duration: Option<f64>,

    /// Blocked intervals longer than this many milliseconds are highlighted
    #[arg(short, long = "wait-ms", default_value_t = DEFAULT_BLOCKED_THRESHOLD.as_millis() as f64)]
    wait_ms: f64,

    /// Don't match threads to snapshot processes by name alone
    #[arg(long)]
    no_name_fallback: bool,

    /// Leave threads unresolved unless a task name confirms their pid pairing
    #[arg(long)]
    no_trust_pairings: bool,

    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn seconds(value: f64, what: &str) -> Result<Duration> {
    if !value.is_finite() || value < 0.0 {
        bail!("{what} must be a non-negative number, got {value}");
    }
    Duration::try_from_secs_f64(value).with_context(|| format!("{what} is out of range: {value}"))
}

impl Command {
    fn config(&self) -> Result<ConvertConfig> {
        Ok(ConvertConfig {
            blocked_threshold: seconds(self.wait_ms / 1000.0, "--wait-ms")?,
            output: self.output.clone(),
            window: TimeWindow {
                skip: seconds(self.skip, "--skip")?,
                duration: self.duration.map(|d| seconds(d, "--duration")).transpose()?,
            },
            resolve: ResolvePolicy {
                name_fallback: !self.no_name_fallback,
                trust_pairings: !self.no_trust_pairings,
            },
        })
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cmd = Command::parse();
    init_logging(cmd.verbose);

    let config = cmd.config()?;
    debug!("{config:?}");
    let report = convert_archive(&cmd.input, &config)?;
    report.log_warnings();
    Ok(())
}
