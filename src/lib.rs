//! sched2trace library - conversion of `perf sched` recordings into trace events.
//!
//! A recording is a compressed tar archive holding two text members: the
//! capture metadata (`perf-mdata.txt`) and the `perf script` output
//! (`perf.data.txt`). The conversion runs as a chain of stages, each taking
//! the previous stage's output by reference and returning a new value:
//!
//! - [`metadata`] - capture metadata and `/proc/<pid>/stat` snapshots
//! - [`perf_script`] - line parser for `perf script` output
//! - [`identity`] - reconciliation of scheduler pids with namespace pids
//! - [`timeline`] - running/blocked intervals per thread and per CPU
//! - [`pseudo`] - the synthetic CPU and kernel processes
//! - [`rank`] - busiest-first process ordering
//! - [`trace_event`] - Chrome Trace Event JSON output
//!
//! # Example
//!
//! ```no_run
//! use sched2trace::{convert_archive, ConvertConfig};
//! use std::path::Path;
//!
//! let config = ConvertConfig::default();
//! let report = convert_archive(Path::new("perf.tar.xz"), &config)
//!     .expect("conversion failed");
//! report.log_warnings();
//! ```

pub mod archive;
pub mod config;
pub mod convert;
pub mod diagnostics;
pub mod identity;
pub mod metadata;
pub mod perf_script;
pub mod pseudo;
pub mod rank;
pub mod timeline;
pub mod trace_event;

pub use config::{ConvertConfig, ResolvePolicy, TimeWindow};
pub use convert::{convert, convert_archive, Conversion};
pub use diagnostics::ConversionReport;
