use std::fs::read_to_string;
use std::os::raw::c_int;
use std::path::Path;
use thiserror::Error;
use tracing::{error, warn};

use anyhow::Result;
use errno::errno;
use libc::close;
use nix::sys::utsname;
use perf_event_open_sys as sys;
use perf_event_open_sys::bindings::perf_event_attr;

const PROCFS_PATH: &str = "/proc";
const PID_MAX_PATH: &str = "/proc/sys/kernel/pid_max";
const PERF_EVENT_PARANOID_PATH: &str = "/proc/sys/kernel/perf_event_paranoid";
pub const TRACEFS_PATHS: [&str; 2] = ["/sys/kernel/debug/tracing", "/sys/kernel/tracing"];

#[derive(Debug)]
pub struct SystemInfo {
    pub os_release: String,
    pub procfs_mount_detected: bool,
    pub tracefs_mount_detected: bool,
    pub software_perfevents_support_detected: bool,
    pub pid_max: Option<u32>,
    pub perf_event_paranoid: Option<i32>,
}

#[derive(Debug, Error)]
pub enum SystemInfoError {
    #[error("File could not be read {0}, err={1}")]
    ErrorReadingFile(String, String),

    #[error("Value in {0} could not be parsed, err={1}")]
    ErrorParsingValue(String, String),
}

struct DroppableFiledescriptor {
    fd: i32,
}

impl Drop for DroppableFiledescriptor {
    fn drop(&mut self) {
        if self.fd >= 0 && unsafe { close(self.fd) } != 0 {
            warn!("Failed to close file descriptor={}", self.fd);
        }
    }
}

fn tracefs_mount_detected() -> bool {
    TRACEFS_PATHS.iter().any(|path| Path::new(path).join("events").exists())
}

fn read_kernel_value<T: std::str::FromStr>(path: &str) -> Result<T, SystemInfoError>
where
    T::Err: std::fmt::Display,
{
    read_to_string(path)
        .map_err(|err| SystemInfoError::ErrorReadingFile(path.to_string(), err.to_string()))?
        .trim()
        .parse::<T>()
        .map_err(|err| SystemInfoError::ErrorParsingValue(path.to_string(), err.to_string()))
}

/// Reads the highest thread id the kernel may hand out plus one.
pub fn pid_max() -> Result<u32, SystemInfoError> {
    read_kernel_value(PID_MAX_PATH)
}

pub fn perf_event_paranoid() -> Result<i32, SystemInfoError> {
    read_kernel_value(PERF_EVENT_PARANOID_PATH)
}

/// Opens (and immediately closes) a user-space only task clock counter on
/// the calling thread, the least privileged configuration a per-thread
/// sampler can use.
fn software_perfevents_detected() -> bool {
    let mut attrs: perf_event_attr = perf_event_open_sys::bindings::perf_event_attr {
        size: std::mem::size_of::<sys::bindings::perf_event_attr>() as u32,
        type_: sys::bindings::PERF_TYPE_SOFTWARE,
        config: sys::bindings::PERF_COUNT_SW_TASK_CLOCK as u64,
        ..Default::default()
    };
    attrs.set_disabled(1);
    attrs.set_exclude_kernel(1);
    attrs.set_exclude_hv(1);

    let fd = DroppableFiledescriptor {
        fd: unsafe {
            sys::perf_event_open(
                &mut attrs, 0,  /* pid */
                -1, /* cpu */
                -1, /* group_fd */
                sys::bindings::PERF_FLAG_FD_CLOEXEC as _,
            )
        } as c_int,
    };

    if fd.fd < 0 {
        error!("perf_event_open probe failed with errno {}", errno());
        return false;
    }
    true
}

impl SystemInfo {
    pub fn new() -> Result<SystemInfo> {
        let pid_max = match pid_max() {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("{}", err);
                None
            }
        };
        let perf_event_paranoid = match perf_event_paranoid() {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("{}", err);
                None
            }
        };

        Ok(SystemInfo {
            os_release: utsname::uname()?.release().to_string_lossy().to_string(),
            procfs_mount_detected: Path::new(PROCFS_PATH).exists(),
            tracefs_mount_detected: tracefs_mount_detected(),
            software_perfevents_support_detected: software_perfevents_detected(),
            pid_max,
            perf_event_paranoid,
        })
    }

    /// Per-thread sampling needs procfs to enumerate threads and size the
    /// slot table, and must be allowed to open at least software events.
    pub fn has_minimal_requirements(&self) -> bool {
        self.procfs_mount_detected && self.software_perfevents_support_detected
    }
}
