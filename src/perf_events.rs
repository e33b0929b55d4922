use std::os::raw::c_int;

use errno::{errno, Errno};
use memmap2::{MmapOptions, MmapRaw};
use nix::sys::signal::Signal;
use thiserror::Error;

use perf_event_open_sys as sys;
use perf_event_open_sys::bindings::perf_event_attr;

use crate::event::{EventDescriptor, EventKind};
use crate::util::ring_mapping_len;

/// Signal the kernel raises on the sampled thread when its counter overflows.
pub const SAMPLE_SIGNAL: Signal = Signal::SIGPROF;

// Not available in the libc crate.
const F_SETSIG: c_int = 10;
const F_SETOWN_EX: c_int = 15;
const F_OWNER_TID: c_int = 0;

#[repr(C)]
struct f_owner_ex {
    type_: c_int,
    pid: libc::pid_t,
}

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("no sampling session is running")]
    NoSession,

    #[error("thread id {0} is beyond the slot table capacity {1}")]
    TidOutOfRange(i32, usize),

    #[error("perf_event_open failed for thread {0} with errno {1}")]
    Open(i32, Errno),

    #[error("could not route overflow signals of thread {0}, errno {1}")]
    SignalRouting(i32, Errno),

    #[error("{0} ioctl failed with errno {1}")]
    Ioctl(&'static str, Errno),
}

/// Builds the counter configuration for `descriptor`. Counters start disabled
/// and wake up after every sample so each overflow raises a signal.
pub fn build_attr(
    descriptor: &EventDescriptor,
    interval: u64,
    include_kernel: bool,
) -> perf_event_attr {
    let mut attrs: perf_event_attr = perf_event_open_sys::bindings::perf_event_attr {
        size: std::mem::size_of::<sys::bindings::perf_event_attr>() as u32,
        type_: descriptor.perf_type(),
        sample_type: sys::bindings::PERF_SAMPLE_CALLCHAIN as u64,
        ..Default::default()
    };

    match descriptor.kind {
        EventKind::Breakpoint { access, len } => {
            attrs.bp_type = access.bp_type();
            attrs.__bindgen_anon_3.bp_addr = descriptor.config;
            attrs.__bindgen_anon_4.bp_len = len;
        }
        _ => attrs.config = descriptor.config,
    }

    attrs.__bindgen_anon_1.sample_period = interval;
    attrs.__bindgen_anon_2.wakeup_events = 1;
    attrs.set_precise_ip(descriptor.precise_ip.into());
    attrs.set_disabled(1);
    attrs.set_exclude_idle(1);
    if !include_kernel {
        attrs.set_exclude_kernel(1);
        attrs.set_exclude_hv(1);
    }

    attrs
}

/// Opens a counter for a single thread, on any CPU.
pub fn open_counter(attrs: &mut perf_event_attr, tid: i32) -> Result<c_int, CounterError> {
    let fd = unsafe {
        sys::perf_event_open(
            attrs, tid, -1, /* cpu */
            -1, /* group_fd */
            sys::bindings::PERF_FLAG_FD_CLOEXEC as _,
        )
    } as c_int;

    if fd < 0 {
        return Err(CounterError::Open(tid, errno()));
    }
    Ok(fd)
}

/// Delivers overflow notifications of `fd` as `signal` to thread `tid` only,
/// rather than to any thread of the process.
pub fn route_signal(fd: c_int, tid: i32, signal: Signal) -> Result<(), CounterError> {
    let owner = f_owner_ex {
        type_: F_OWNER_TID,
        pid: tid,
    };

    let failed = unsafe {
        libc::fcntl(fd, libc::F_SETFL, libc::O_ASYNC) < 0
            || libc::fcntl(fd, F_SETSIG, signal as c_int) < 0
            || libc::fcntl(fd, F_SETOWN_EX, &owner as *const f_owner_ex) < 0
    };

    if failed {
        return Err(CounterError::SignalRouting(tid, errno()));
    }
    Ok(())
}

/// Clears the count and enables the counter for `refresh` more overflows.
/// Async-signal-safe.
pub fn arm(fd: c_int, refresh: c_int) -> Result<(), CounterError> {
    if unsafe { sys::ioctls::RESET(fd, 0) } < 0 {
        return Err(CounterError::Ioctl("reset", errno()));
    }
    if unsafe { sys::ioctls::REFRESH(fd, refresh) } < 0 {
        return Err(CounterError::Ioctl("refresh", errno()));
    }
    Ok(())
}

pub fn disable(fd: c_int) -> Result<(), CounterError> {
    if unsafe { sys::ioctls::DISABLE(fd, 0) } < 0 {
        return Err(CounterError::Ioctl("disable", errno()));
    }
    Ok(())
}

pub fn close_counter(fd: c_int) -> Result<(), Errno> {
    if unsafe { libc::close(fd) } != 0 {
        return Err(errno());
    }
    Ok(())
}

/// Reads the current counter value. Async-signal-safe.
pub fn read_count(fd: c_int) -> Option<u64> {
    let mut count = 0u64;
    let read = unsafe {
        libc::read(
            fd,
            &mut count as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };

    if read == std::mem::size_of::<u64>() as isize {
        Some(count)
    } else {
        None
    }
}

/// Maps the control page plus `data_pages` data pages of a counter.
pub fn map_ring(fd: c_int, data_pages: usize) -> std::io::Result<MmapRaw> {
    MmapOptions::new().len(ring_mapping_len(data_pages)).map_raw(fd)
}
