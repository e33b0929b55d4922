use std::fs::read_to_string;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::event::{EventDescriptor, EventError, EventKind};

/// Well-known tracefs mount points, in lookup order.
pub use sigperf_capabilities::system_info::TRACEFS_PATHS as DEFAULT_TRACEFS_ROOTS;

/// `trace:<id>` takes the id verbatim, it has to be a positive integer.
pub(crate) fn parse_raw_id(id: &str) -> Result<u64, EventError> {
    match id.parse::<u64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(EventError::InvalidTracepointId(id.to_string())),
    }
}

fn read_id(path: &Path) -> Option<u64> {
    let id = read_to_string(path).ok()?;
    match id.trim().parse::<u64>() {
        Ok(id) if id > 0 => Some(id),
        _ => {
            debug!("invalid tracepoint id in {}", path.display());
            None
        }
    }
}

/// Looks `subsystem:event` up under `<root>/events/subsystem/event/id` for
/// each of the tracefs roots, in order.
pub(crate) fn find_id(roots: &[PathBuf], name: &str) -> Option<u64> {
    let relative = name.replacen(':', "/", 1);
    roots
        .iter()
        .map(|root| root.join("events").join(&relative).join("id"))
        .find_map(|path| read_id(&path))
}

pub(crate) fn descriptor(name: &str, id: u64) -> EventDescriptor {
    EventDescriptor {
        name: name.to_string(),
        default_interval: 1,
        precise_ip: 0,
        kind: EventKind::Tracepoint,
        config: id,
        counter_arg: None,
    }
}
