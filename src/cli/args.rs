use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use sigperf::profiler::ProfilerConfig;

use crate::validators::call_chain_depth_in_range;
use crate::validators::interval_is_not_negative;
use crate::validators::parse_duration;
use crate::validators::value_is_power_of_two;

#[derive(clap::ValueEnum, Debug, Clone, Default)]
pub(crate) enum LoggingLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Print the predefined event names
    ListEvents,
    /// Print what this host supports for per-thread sampling
    SystemInfo,
}

/// Samples a busy workload in this process with per-thread perf events
#[derive(Parser, Debug)]
#[command(name = "sigperf")]
pub(crate) struct CliArgs {
    /// Event to sample: a predefined event, mem:<breakpoint>, trace:<id>,
    /// <subsystem>:<tracepoint> or a function name
    #[arg(short, long, default_value_t = ProfilerConfig::default().event)]
    pub(crate) event: String,
    /// Events between samples, 0 uses the event's default
    #[arg(short, long, default_value_t = ProfilerConfig::default().interval,
        value_parser = interval_is_not_negative)]
    pub(crate) interval: i64,
    /// How long to sample for, in seconds
    #[arg(short = 'D', long, default_value = "5", value_parser = parse_duration)]
    pub(crate) duration: Duration,
    /// Number of worker threads to run and sample
    #[arg(long, default_value_t = 4)]
    pub(crate) threads: usize,
    /// Set sigperf's logging level
    #[arg(long, default_value_t, value_enum)]
    pub(crate) logging: LoggingLevel,
    #[arg(long, default_value_t = ProfilerConfig::default().data_pages, value_name = "DATA_PAGES",
          help = "Ring buffer data pages per thread (must be a power of 2)",
          value_parser = value_is_power_of_two)]
    pub(crate) data_pages: usize,
    /// Capture native call chains up to this depth
    #[arg(long, value_parser = call_chain_depth_in_range)]
    pub(crate) call_chain_depth: Option<usize>,
    /// Sample kernel code too
    #[arg(long)]
    pub(crate) include_kernel: bool,
    /// Tracefs mount point checked before the default ones
    #[arg(long)]
    pub(crate) tracefs_root: Option<PathBuf>,
    /// Number of hottest addresses to print
    #[arg(long, default_value_t = 10)]
    pub(crate) top: usize,
    #[command(subcommand)]
    pub(crate) command: Option<Commands>,
}
