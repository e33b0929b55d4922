use std::error::Error;
use std::io::IsTerminal;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use crossbeam_channel::bounded;
use tracing::{debug, error, info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::FmtSubscriber;

use sigperf::available_events;
use sigperf::collector::AggregatorCollector;
use sigperf::profiler::{CallChainConfig, ProfilerConfig, Session};
use sigperf::util::architecture;
use sigperf_capabilities::system_info::SystemInfo;

mod args;
mod validators;
mod workload;

use crate::args::CliArgs;
use crate::args::Commands;
use crate::args::LoggingLevel;
use crate::workload::{spawn_workers, WorkerRegistry};

/// Exit the main thread if any thread panics. A worker that dies mid-session
/// would leave its counter open.
fn panic_thread_hook() {
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        std::process::exit(1);
    }));
}

fn print_report(collector: &AggregatorCollector, top: usize) {
    println!("samples: {}", collector.samples());
    println!("weight:  {}", collector.weight());
    if collector.dropped_leaves() > 0 {
        println!("leaves not tracked: {}", collector.dropped_leaves());
    }

    let leaves = collector.top(top);
    if leaves.is_empty() {
        return;
    }
    println!();
    println!("{:>10} {:>14}  address", "samples", "weight");
    for leaf in leaves {
        println!(
            "{:>10} {:>14}  0x{:016x}",
            leaf.samples, leaf.weight, leaf.address
        );
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    panic_thread_hook();

    let args = CliArgs::parse();

    let level_filter = match args.logging {
        LoggingLevel::Trace => Level::TRACE,
        LoggingLevel::Debug => Level::DEBUG,
        LoggingLevel::Info => Level::INFO,
        LoggingLevel::Warn => Level::WARN,
        LoggingLevel::Error => Level::ERROR,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level_filter)
        .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
        .with_ansi(std::io::stdout().is_terminal())
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    match args.command {
        None => {} // sample the workload by default
        Some(Commands::ListEvents) => {
            for name in available_events() {
                println!("{}", name);
            }
            return Ok(());
        }
        Some(Commands::SystemInfo) => {
            println!("- system info: {:#?}", SystemInfo::new()?);
            println!("- architecture: {}", architecture());
            return Ok(());
        }
    }

    let Ok(system_info) = SystemInfo::new() else {
        error!("Failed to detect system info!");
        std::process::exit(1)
    };

    if !system_info.has_minimal_requirements() {
        error!("Some start up requirements could not be met!");
        error!("system_info = {:?}", system_info);
        std::process::exit(1);
    }

    let profiler_config = ProfilerConfig {
        event: args.event,
        interval: args.interval,
        data_pages: args.data_pages,
        include_kernel: args.include_kernel,
        call_chain: args.call_chain_depth.map(|max_depth| CallChainConfig {
            max_depth,
            ..Default::default()
        }),
        tracefs_root: args.tracefs_root,
        ..Default::default()
    };

    let collector = Arc::new(AggregatorCollector::new());
    let registry = Arc::new(WorkerRegistry::default());
    let session = Session::start(profiler_config, collector.clone(), registry.clone())?;

    let (stop_signal_sender, stop_signal_receive) = bounded(1);
    ctrlc::set_handler(move || {
        info!("received Ctrl+C, stopping...");
        let _ = stop_signal_sender.send(());
    })
    .expect("Error setting Ctrl-C handler");

    let stop = Arc::new(AtomicBool::new(false));
    let workers = spawn_workers(args.threads, registry, stop.clone())?;

    match stop_signal_receive.recv_timeout(args.duration) {
        Ok(()) => debug!("received ctrl+c"),
        Err(_) => debug!("done profiling"),
    }

    stop.store(true, Ordering::Relaxed);
    let rounds: u64 = workers
        .into_iter()
        .filter_map(|worker| worker.join().ok())
        .sum();
    debug!("workers ran {} rounds", rounds);

    println!("event:   {}", session.descriptor());
    session.stop();

    print_report(&collector, args.top);
    Ok(())
}
