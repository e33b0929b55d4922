use std::os::raw::{c_int, c_long, c_void};
use std::sync::atomic::{AtomicU64, Ordering};

use errno::{errno, set_errno};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::collector::Sample;
use crate::perf_events::{arm, read_count};
use crate::profiler::{CAPTURE, MAX_CALL_CHAIN_DEPTH, SLOTS};
use crate::util::{current_tid, StackFrame};

/// Leading fields of a `SIGPOLL`-style `siginfo_t`, which the libc crate
/// does not expose.
#[allow(dead_code)]
#[repr(C)]
struct PollSigInfo {
    si_signo: c_int,
    si_errno: c_int,
    si_code: c_int,
    #[cfg(target_pointer_width = "64")]
    _pad: c_int,
    si_band: c_long,
    si_fd: c_int,
}

/// Counters that could not be re-armed after an overflow; their threads stay
/// silent until the next session.
static REARM_FAILURES: AtomicU64 = AtomicU64::new(0);

/// Returns and clears the number of failed re-arms.
pub(crate) fn take_rearm_failures() -> u64 {
    REARM_FAILURES.swap(0, Ordering::Relaxed)
}

fn rearm(fd: c_int, refresh_count: c_int) {
    if arm(fd, refresh_count).is_err() {
        REARM_FAILURES.fetch_add(1, Ordering::Relaxed);
    }
}

/// Installs the overflow handler for `signal`. Safe to call repeatedly.
pub fn install_handler(signal: Signal) -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::SigAction(on_overflow),
        SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(signal, &action) }?;
    Ok(())
}

extern "C" fn on_overflow(_signal: c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    let saved_errno = errno();
    unsafe { capture(info as *const PollSigInfo, ucontext) };
    set_errno(saved_errno);
}

/// Nothing in here may allocate or block: locks are only tried, and the
/// call chain is decoded into a stack buffer.
unsafe fn capture(info: *const PollSigInfo, ucontext: *mut c_void) {
    let Some(info) = info.as_ref() else {
        return;
    };
    // Sent by a process (kill, tgkill, sigqueue), not by the kernel.
    if info.si_code <= 0 {
        return;
    }

    let Some(capture) = CAPTURE.try_read() else {
        return;
    };
    let Some(session) = capture.as_ref() else {
        return;
    };
    let Some(slots) = SLOTS.try_read() else {
        return;
    };
    let Some(table) = slots.as_ref() else {
        return;
    };

    let tid = current_tid();
    let fd = info.si_fd;
    let Some(slot) = table.get(tid) else {
        return;
    };
    // Left over from a counter that was closed, possibly by an older session.
    if fd <= 0 || slot.fd() != fd {
        return;
    }

    let frame = StackFrame::from_ucontext(ucontext);
    let weight = match session.descriptor.counter_arg.and_then(|arg| frame.arg(arg)) {
        Some(weight) => weight,
        None => read_count(fd).unwrap_or(1),
    };

    let mut chain = [0u64; MAX_CALL_CHAIN_DEPTH];
    let depth = match &session.call_chain {
        Some(config) => slot.try_call_chain(config.max_depth, &config.excluded, &mut chain),
        None => 0,
    };

    session.sink.record_sample(&Sample {
        tid,
        weight,
        frame,
        call_chain: &chain[..depth],
    });

    rearm(fd, session.refresh_count);
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::mem::{offset_of, size_of};

    #[test]
    fn test_poll_siginfo_layout() {
        assert_eq!(offset_of!(PollSigInfo, si_code), 8);
        #[cfg(target_pointer_width = "64")]
        {
            assert_eq!(offset_of!(PollSigInfo, si_band), 16);
            assert_eq!(offset_of!(PollSigInfo, si_fd), 24);
        }
        assert!(size_of::<PollSigInfo>() <= size_of::<libc::siginfo_t>());
    }

    #[test]
    fn test_user_sent_signals_are_ignored() {
        let info = PollSigInfo {
            si_signo: libc::SIGPROF,
            si_errno: 0,
            si_code: libc::SI_USER,
            #[cfg(target_pointer_width = "64")]
            _pad: 0,
            si_band: 0,
            si_fd: 3,
        };
        // Returns before touching any session state.
        unsafe { capture(&info, std::ptr::null_mut()) };
    }

    #[test]
    fn test_failed_rearm_is_counted() {
        rearm(-1, 1);
        rearm(-1, 1);
        assert!(take_rearm_failures() >= 2);
    }

    #[test]
    fn test_handler_installs() {
        install_handler(Signal::SIGPROF).unwrap();
        install_handler(Signal::SIGPROF).unwrap();
    }
}
