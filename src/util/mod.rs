mod arch;
mod page;

pub use arch::architecture;
pub use arch::Architecture;
pub use arch::StackFrame;
pub use page::page_size;
pub use page::ring_mapping_len;

/// Kernel thread id of the calling thread. Async-signal-safe.
pub fn current_tid() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}
