pub mod collector;
pub mod event;
pub mod perf_events;
pub mod profiler;
pub mod ring_buffer;
pub mod signal;
pub mod slots;
pub mod util;

pub use profiler::{
    available_events, call_chain, call_chain_vec, create_for_all_threads, create_for_thread,
    destroy_for_all_threads, destroy_for_thread,
};
