use std::ops::Range;
use std::os::raw::c_int;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use nix::sys::signal::Signal;
use procfs::process::Process;
use spin::RwLock;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use sigperf_capabilities::system_info::pid_max;

use crate::collector::ThreadSafeSink;
use crate::event::{EventCatalog, EventDescriptor, EventError};
use crate::perf_events::{arm, build_attr, map_ring, open_counter, route_signal};
use crate::perf_events::{CounterError, SAMPLE_SIGNAL};
use crate::ring_buffer::RingMapping;
use crate::signal::{install_handler, take_rearm_failures};
use crate::slots::SlotTable;
use crate::util::page_size;

pub use crate::event::available_events;

/// Capacity used when `pid_max` can't be read.
pub const DEFAULT_PID_MAX: usize = 65536;

/// Deepest call chain that can be captured from the signal handler.
pub const MAX_CALL_CHAIN_DEPTH: usize = 128;

/// Native call chain capture from the signal handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallChainConfig {
    pub max_depth: usize,
    /// Decoding stops at the first address in this range, e.g. code owned by
    /// a managed runtime.
    pub excluded: Range<u64>,
}

impl Default for CallChainConfig {
    fn default() -> Self {
        Self {
            max_depth: 64,
            excluded: 0..0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    pub event: String,
    /// Events between samples. 0 picks the event's default, negative values
    /// are rejected.
    pub interval: i64,
    /// Ring buffer data pages per thread, a power of two.
    pub data_pages: usize,
    /// Overflows allowed per arming of a counter.
    pub refresh_count: i32,
    pub include_kernel: bool,
    pub call_chain: Option<CallChainConfig>,
    /// Tracefs mount checked before the well-known ones.
    pub tracefs_root: Option<PathBuf>,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            event: "cpu".to_string(),
            interval: 0,
            data_pages: 1,
            refresh_count: 1,
            include_kernel: false,
            call_chain: None,
            tracefs_root: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProfilerError {
    #[error("Unsupported event type {0}: {1}")]
    UnsupportedEvent(String, #[source] EventError),

    #[error("Invalid sampling interval {0}")]
    InvalidInterval(i64),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("A sampling session is already running")]
    AlreadyRunning,

    #[error("Failed to install the {0} handler: {1}")]
    SignalHandler(Signal, nix::Error),

    #[error("No counter could be opened for any thread of this process")]
    Unavailable,
}

/// Hooks into the host's thread start and exit notifications. While
/// subscribed, the host calls [`create_for_thread`] for new threads and
/// [`destroy_for_thread`] for exiting ones.
pub trait ThreadLifecycle: Send + Sync {
    fn subscribe(&self);
    fn unsubscribe(&self);
}

/// For hosts that don't report thread lifecycle events, only threads alive at
/// session start are sampled.
#[derive(Debug, Default)]
pub struct NoLifecycle;

impl ThreadLifecycle for NoLifecycle {
    fn subscribe(&self) {}
    fn unsubscribe(&self) {}
}

/// What the signal handler and the per-thread entry points need to know about
/// the running session.
pub(crate) struct ActiveSession {
    pub(crate) generation: u64,
    pub(crate) descriptor: EventDescriptor,
    pub(crate) interval: u64,
    pub(crate) include_kernel: bool,
    pub(crate) data_pages: usize,
    pub(crate) refresh_count: c_int,
    pub(crate) call_chain: Option<CallChainConfig>,
    pub(crate) sink: ThreadSafeSink,
}

// The signal handler can't be handed arguments, it finds the session here.
// It only ever tries these locks.
pub(crate) static CAPTURE: RwLock<Option<ActiveSession>> = RwLock::new(None);
pub(crate) static SLOTS: RwLock<Option<SlotTable>> = RwLock::new(None);

static RUNNING: AtomicBool = AtomicBool::new(false);
static GENERATION: AtomicU64 = AtomicU64::new(0);

fn snapshot_pid_max() -> usize {
    match pid_max() {
        Ok(value) => value as usize,
        Err(err) => {
            warn!("{}, assuming pid_max={}", err, DEFAULT_PID_MAX);
            DEFAULT_PID_MAX
        }
    }
}

fn validate(config: &ProfilerConfig) -> Result<(), ProfilerError> {
    if !config.data_pages.is_power_of_two() {
        return Err(ProfilerError::InvalidConfig(format!(
            "ring buffer data pages must be a power of two, got {}",
            config.data_pages
        )));
    }
    if config.refresh_count <= 0 {
        return Err(ProfilerError::InvalidConfig(format!(
            "refresh count must be positive, got {}",
            config.refresh_count
        )));
    }
    if let Some(call_chain) = &config.call_chain {
        if call_chain.max_depth == 0 || call_chain.max_depth > MAX_CALL_CHAIN_DEPTH {
            return Err(ProfilerError::InvalidConfig(format!(
                "call chain depth must be between 1 and {}, got {}",
                MAX_CALL_CHAIN_DEPTH, call_chain.max_depth
            )));
        }
    }
    Ok(())
}

/// A running sampling session. There is at most one per process; dropping it
/// stops it.
pub struct Session {
    generation: u64,
    descriptor: EventDescriptor,
    interval: u64,
    lifecycle: Arc<dyn ThreadLifecycle>,
    running: bool,
}

impl Session {
    /// Resolves the event, installs the overflow handler and opens a counter
    /// for every live thread. Nothing is left running on failure.
    pub fn start(
        config: ProfilerConfig,
        sink: ThreadSafeSink,
        lifecycle: Arc<dyn ThreadLifecycle>,
    ) -> Result<Session, ProfilerError> {
        let mut catalog = EventCatalog::new();
        if let Some(root) = &config.tracefs_root {
            catalog = catalog.with_tracefs_root(root.clone());
        }
        let descriptor = catalog
            .resolve(&config.event)
            .map_err(|err| ProfilerError::UnsupportedEvent(config.event.clone(), err))?;

        let interval = match config.interval {
            interval if interval < 0 => return Err(ProfilerError::InvalidInterval(interval)),
            0 => descriptor.default_interval,
            interval => interval as u64,
        };
        validate(&config)?;

        if RUNNING
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ProfilerError::AlreadyRunning);
        }
        let generation = GENERATION.fetch_add(1, Ordering::AcqRel) + 1;
        // Left over from an earlier session.
        take_rearm_failures();

        let capacity = snapshot_pid_max();
        {
            let mut slots = SLOTS.write();
            match slots.as_ref() {
                Some(table) if table.capacity() == capacity => {}
                _ => {
                    debug!("allocating slot table for {} thread ids", capacity);
                    *slots = Some(SlotTable::new(capacity));
                }
            }
        }

        // Before any counter is armed, so no early overflow is lost.
        if let Err(err) = install_handler(SAMPLE_SIGNAL) {
            error!("failed to install the {} handler: {}", SAMPLE_SIGNAL, err);
            RUNNING.store(false, Ordering::Release);
            return Err(ProfilerError::SignalHandler(SAMPLE_SIGNAL, err));
        }

        *CAPTURE.write() = Some(ActiveSession {
            generation,
            descriptor: descriptor.clone(),
            interval,
            include_kernel: config.include_kernel,
            data_pages: config.data_pages,
            refresh_count: config.refresh_count,
            call_chain: config.call_chain.clone(),
            sink,
        });

        lifecycle.subscribe();
        let mut session = Session {
            generation,
            descriptor,
            interval,
            lifecycle,
            running: true,
        };

        if !create_for_all_threads() {
            error!("could not open a counter for {}", session.descriptor);
            session.shutdown();
            return Err(ProfilerError::Unavailable);
        }

        info!(
            "sampling {} every {} events (session {})",
            session.descriptor, interval, generation
        );
        Ok(session)
    }

    pub fn descriptor(&self) -> &EventDescriptor {
        &self.descriptor
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        self.lifecycle.unsubscribe();
        {
            // Retired first so no counter is created behind our back, late
            // overflows are then ignored and not re-armed.
            let mut capture = CAPTURE.write();
            if capture.as_ref().map(|session| session.generation) == Some(self.generation) {
                *capture = None;
            }
        }
        destroy_for_all_threads();
        let rearm_failures = take_rearm_failures();
        if rearm_failures > 0 {
            warn!(
                "{} counters could not be re-armed, their threads stopped being sampled",
                rearm_failures
            );
        }
        RUNNING.store(false, Ordering::Release);

        info!("stopped sampling session {}", self.generation);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Capacity of the slot table, once a session has been started.
pub fn capacity() -> Option<usize> {
    SLOTS.read().as_ref().map(SlotTable::capacity)
}

/// Opens, maps and arms a counter for thread `tid` of this process.
pub fn create_for_thread(tid: i32) -> Result<(), CounterError> {
    let capture = CAPTURE.read();
    let Some(session) = capture.as_ref() else {
        return Err(CounterError::NoSession);
    };
    let slots = SLOTS.read();
    let Some(table) = slots.as_ref() else {
        return Err(CounterError::NoSession);
    };
    let Some(slot) = table.get_or_commit(tid) else {
        warn!(
            "thread id {} does not fit in pid_max {}, restart sampling to include it",
            tid,
            table.capacity()
        );
        return Err(CounterError::TidOutOfRange(tid, table.capacity()));
    };

    let mut attrs = build_attr(&session.descriptor, session.interval, session.include_kernel);
    let fd = open_counter(&mut attrs, tid).inspect_err(|err| error!("{}", err))?;

    let ring = match map_ring(fd, session.data_pages) {
        Ok(mmap) => Some(RingMapping::new(mmap, page_size())),
        Err(err) => {
            warn!("ring buffer of thread {} could not be mapped: {}", tid, err);
            None
        }
    };
    slot.install(fd, ring);

    if let Err(err) =
        route_signal(fd, tid, SAMPLE_SIGNAL).and_then(|_| arm(fd, session.refresh_count))
    {
        warn!("could not arm counter of thread {}: {}", tid, err);
        slot.destroy();
        return Err(err);
    }

    debug!("counter fd={} armed for thread {}", fd, tid);
    Ok(())
}

/// Closes the counter of `tid` and unmaps its ring buffer. Does nothing for
/// threads without a counter.
pub fn destroy_for_thread(tid: i32) {
    let slots = SLOTS.read();
    let Some(table) = slots.as_ref() else {
        return;
    };
    if tid < 0 || tid as usize >= table.capacity() {
        warn!(
            "thread id {} does not fit in pid_max {}, nothing to destroy",
            tid,
            table.capacity()
        );
        return;
    }
    if let Some(slot) = table.get(tid) {
        slot.destroy();
    }
}

/// Opens a counter for every live thread of the process. True if at least
/// one succeeded.
pub fn create_for_all_threads() -> bool {
    let tasks = match Process::myself().and_then(|process| process.tasks()) {
        Ok(tasks) => tasks,
        Err(err) => {
            error!("failed to list the threads of this process: {}", err);
            return false;
        }
    };

    let mut created = 0;
    let mut failed = 0;
    for task in tasks.flatten() {
        match create_for_thread(task.tid) {
            Ok(()) => created += 1,
            Err(err) => {
                debug!("skipping thread {}: {}", task.tid, err);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        warn!(
            "opened counters for {} threads, {} failed",
            created, failed
        );
    }
    created > 0
}

pub fn destroy_for_all_threads() {
    if let Some(table) = SLOTS.read().as_ref() {
        table.destroy_all();
    }
}

/// Decodes the most recent call chain of `tid` into `out` and returns how many
/// addresses were written. Never blocks: when the slot is being torn down the
/// result is empty.
pub fn call_chain(tid: i32, max_depth: usize, excluded: Range<u64>, out: &mut [u64]) -> usize {
    let Some(slots) = SLOTS.try_read() else {
        return 0;
    };
    slots
        .as_ref()
        .and_then(|table| table.get(tid))
        .map(|slot| slot.try_call_chain(max_depth, &excluded, out))
        .unwrap_or(0)
}

/// Like [`call_chain`], at most [`MAX_CALL_CHAIN_DEPTH`] addresses deep.
pub fn call_chain_vec(tid: i32, max_depth: usize, excluded: Range<u64>) -> Vec<u64> {
    let mut out = vec![0; max_depth.min(MAX_CALL_CHAIN_DEPTH)];
    let depth = call_chain(tid, max_depth, excluded, &mut out);
    out.truncate(depth);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    use crate::collector::NullCollector;
    use crate::util::current_tid;

    fn start(config: ProfilerConfig) -> Result<Session, ProfilerError> {
        Session::start(config, Arc::new(NullCollector::new()), Arc::new(NoLifecycle))
    }

    #[test]
    fn test_default_config() {
        let config = ProfilerConfig::default();
        assert_eq!(config.event, "cpu");
        assert_eq!(config.interval, 0);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_negative_interval_is_rejected() {
        let config = ProfilerConfig {
            interval: -1,
            ..Default::default()
        };
        assert!(matches!(
            start(config),
            Err(ProfilerError::InvalidInterval(-1))
        ));
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let config = ProfilerConfig {
            event: "definitely_not_a_symbol_in_this_process".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            start(config),
            Err(ProfilerError::UnsupportedEvent(name, EventError::UnresolvedSymbol(_)))
                if name == "definitely_not_a_symbol_in_this_process"
        ));
    }

    #[rstest]
    #[case(ProfilerConfig { data_pages: 3, ..Default::default() })]
    #[case(ProfilerConfig { data_pages: 0, ..Default::default() })]
    #[case(ProfilerConfig { refresh_count: 0, ..Default::default() })]
    #[case(ProfilerConfig {
        call_chain: Some(CallChainConfig { max_depth: MAX_CALL_CHAIN_DEPTH + 1, excluded: 0..0 }),
        ..Default::default()
    })]
    fn test_invalid_configs(#[case] config: ProfilerConfig) {
        assert!(matches!(validate(&config), Err(ProfilerError::InvalidConfig(_))));
        assert!(matches!(start(config), Err(ProfilerError::InvalidConfig(_))));
    }

    #[test]
    fn test_call_chain_without_session() {
        let mut out = [0u64; 4];
        assert_eq!(call_chain(-1, 4, 0..0, &mut out), 0);
        assert!(call_chain_vec(i32::MAX, 4, 0..0).is_empty());
    }

    #[test]
    fn test_call_chain_vec_with_unbounded_depth() {
        assert!(call_chain_vec(1, usize::MAX, 0..0).is_empty());
        assert!(call_chain_vec(current_tid(), usize::MAX, 0..u64::MAX).is_empty());
    }

    #[test]
    fn test_available_events_on_control_surface() {
        assert_eq!(available_events()[0], "cpu");
    }
}
