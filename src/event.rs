mod breakpoint;
mod tracepoint;

use std::ffi::CString;
use std::fmt;
use std::path::PathBuf;

use perf_event_open_sys::bindings as sys;
use thiserror::Error;
use tracing::debug;

pub use breakpoint::parse_c_integer;
pub use breakpoint::BreakpointAccess;
pub use tracepoint::DEFAULT_TRACEFS_ROOTS;

/// Interval used by the `cpu` event, in nanoseconds of CPU clock.
pub const DEFAULT_INTERVAL: u64 = 10_000_000;

/// Length used for execution breakpoints, the kernel only accepts the size of a long.
pub const POINTER_WIDTH: u64 = std::mem::size_of::<libc::c_long>() as u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("Symbol {0} could not be resolved")]
    UnresolvedSymbol(String),

    #[error("Invalid number `{0}' in breakpoint definition")]
    InvalidNumber(String),

    #[error("Empty breakpoint target in {0}")]
    EmptyBreakpointTarget(String),

    #[error("Tracepoint id must be a positive integer, got `{0}'")]
    InvalidTracepointId(String),
}

/// What kind of kernel counter an event maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Software,
    Hardware,
    HardwareCache,
    /// Hardware breakpoint; the address lives in [`EventDescriptor::config`].
    Breakpoint {
        access: BreakpointAccess,
        len: u64,
    },
    Tracepoint,
}

impl EventKind {
    /// `perf_event_attr.type` for this kind of event.
    pub fn perf_type(&self) -> u32 {
        match self {
            EventKind::Software => sys::PERF_TYPE_SOFTWARE,
            EventKind::Hardware => sys::PERF_TYPE_HARDWARE,
            EventKind::HardwareCache => sys::PERF_TYPE_HW_CACHE,
            EventKind::Breakpoint { .. } => sys::PERF_TYPE_BREAKPOINT,
            EventKind::Tracepoint => sys::PERF_TYPE_TRACEPOINT,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EventKind::Software => write!(f, "software"),
            EventKind::Hardware => write!(f, "hardware"),
            EventKind::HardwareCache => write!(f, "hardware cache"),
            EventKind::Breakpoint { access, len } => {
                write!(f, "breakpoint access={} len={}", access, len)
            }
            EventKind::Tracepoint => write!(f, "tracepoint"),
        }
    }
}

/// A resolved event, ready to be turned into a `perf_event_attr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDescriptor {
    pub name: String,
    pub default_interval: u64,
    /// Skid hint, `perf_event_attr.precise_ip` (0-3).
    pub precise_ip: u8,
    pub kind: EventKind,
    /// Counter config, breakpoint address or tracepoint id depending on `kind`.
    pub config: u64,
    /// 1-based index of the call argument that carries the sample weight.
    pub counter_arg: Option<u8>,
}

impl EventDescriptor {
    pub fn perf_type(&self) -> u32 {
        self.kind.perf_type()
    }
}

impl fmt::Display for EventDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} ({}, config=0x{:x}, default interval={}",
            self.name, self.kind, self.config, self.default_interval
        )?;
        if let Some(arg) = self.counter_arg {
            write!(f, ", weight from argument {}", arg)?;
        }
        write!(f, ")")
    }
}

struct PredefinedEvent {
    name: &'static str,
    default_interval: u64,
    precise_ip: u8,
    kind: EventKind,
    config: u64,
}

// See perf_event_open(2), PERF_TYPE_HW_CACHE.
const fn load_miss(cache_id: u32) -> u64 {
    cache_id as u64
        | (sys::PERF_COUNT_HW_CACHE_OP_READ as u64) << 8
        | (sys::PERF_COUNT_HW_CACHE_RESULT_MISS as u64) << 16
}

const AVAILABLE_EVENTS: &[PredefinedEvent] = &[
    PredefinedEvent {
        name: "cpu",
        default_interval: DEFAULT_INTERVAL,
        precise_ip: 2,
        kind: EventKind::Software,
        config: sys::PERF_COUNT_SW_CPU_CLOCK as u64,
    },
    PredefinedEvent {
        name: "page-faults",
        default_interval: 1,
        precise_ip: 2,
        kind: EventKind::Software,
        config: sys::PERF_COUNT_SW_PAGE_FAULTS as u64,
    },
    PredefinedEvent {
        name: "context-switches",
        default_interval: 1,
        precise_ip: 2,
        kind: EventKind::Software,
        config: sys::PERF_COUNT_SW_CONTEXT_SWITCHES as u64,
    },
    PredefinedEvent {
        name: "cycles",
        default_interval: 1_000_000,
        precise_ip: 2,
        kind: EventKind::Hardware,
        config: sys::PERF_COUNT_HW_CPU_CYCLES as u64,
    },
    PredefinedEvent {
        name: "instructions",
        default_interval: 1_000_000,
        precise_ip: 2,
        kind: EventKind::Hardware,
        config: sys::PERF_COUNT_HW_INSTRUCTIONS as u64,
    },
    PredefinedEvent {
        name: "cache-references",
        default_interval: 1_000_000,
        precise_ip: 0,
        kind: EventKind::Hardware,
        config: sys::PERF_COUNT_HW_CACHE_REFERENCES as u64,
    },
    PredefinedEvent {
        name: "cache-misses",
        default_interval: 1000,
        precise_ip: 0,
        kind: EventKind::Hardware,
        config: sys::PERF_COUNT_HW_CACHE_MISSES as u64,
    },
    PredefinedEvent {
        name: "branches",
        default_interval: 1_000_000,
        precise_ip: 2,
        kind: EventKind::Hardware,
        config: sys::PERF_COUNT_HW_BRANCH_INSTRUCTIONS as u64,
    },
    PredefinedEvent {
        name: "branch-misses",
        default_interval: 1000,
        precise_ip: 2,
        kind: EventKind::Hardware,
        config: sys::PERF_COUNT_HW_BRANCH_MISSES as u64,
    },
    PredefinedEvent {
        name: "bus-cycles",
        default_interval: 1_000_000,
        precise_ip: 0,
        kind: EventKind::Hardware,
        config: sys::PERF_COUNT_HW_BUS_CYCLES as u64,
    },
    PredefinedEvent {
        name: "L1-dcache-load-misses",
        default_interval: 1_000_000,
        precise_ip: 0,
        kind: EventKind::HardwareCache,
        config: load_miss(sys::PERF_COUNT_HW_CACHE_L1D),
    },
    PredefinedEvent {
        name: "LLC-load-misses",
        default_interval: 1000,
        precise_ip: 0,
        kind: EventKind::HardwareCache,
        config: load_miss(sys::PERF_COUNT_HW_CACHE_LL),
    },
    PredefinedEvent {
        name: "dTLB-load-misses",
        default_interval: 1000,
        precise_ip: 0,
        kind: EventKind::HardwareCache,
        config: load_miss(sys::PERF_COUNT_HW_CACHE_DTLB),
    },
];

/// Functions whose arguments make a better sample weight than a plain count,
/// e.g. the size passed to `malloc`.
const KNOWN_FUNCTIONS: &[(&str, u8)] = &[
    ("malloc", 1),
    ("mmap", 2),
    ("read", 3),
    ("write", 3),
    ("send", 3),
    ("recv", 3),
    ("sendto", 3),
    ("recvfrom", 3),
];

pub fn known_function_counter_arg(function: &str) -> Option<u8> {
    KNOWN_FUNCTIONS
        .iter()
        .find(|(name, _)| *name == function)
        .map(|(_, arg)| *arg)
}

/// Names of the predefined events, in catalog order.
pub fn available_events() -> Vec<&'static str> {
    AVAILABLE_EVENTS.iter().map(|event| event.name).collect()
}

/// Looks a symbol up in the global scope of the current process.
pub fn dynamic_symbol_address(name: &str) -> Option<u64> {
    let name = CString::new(name).ok()?;
    let address = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
    if address.is_null() {
        None
    } else {
        Some(address as u64)
    }
}

pub type SymbolLookup = fn(&str) -> Option<u64>;

/// Turns event names into [`EventDescriptor`]s.
///
/// Resolution order:
/// 1. `mem:<spec>`, a hardware breakpoint, see [`BreakpointAccess`] for the grammar.
/// 2. `trace:<id>`, a raw tracepoint id.
/// 3. One of the predefined events, see [`available_events`].
/// 4. `<subsystem>:<event>`, a tracepoint whose id is read from tracefs.
/// 5. Anything else is a function name and becomes an execution breakpoint.
#[derive(Clone)]
pub struct EventCatalog {
    tracefs_roots: Vec<PathBuf>,
    symbol_lookup: SymbolLookup,
}

impl Default for EventCatalog {
    fn default() -> Self {
        Self {
            tracefs_roots: DEFAULT_TRACEFS_ROOTS.iter().map(PathBuf::from).collect(),
            symbol_lookup: dynamic_symbol_address,
        }
    }
}

impl EventCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check `root` before the well-known tracefs mount points.
    pub fn with_tracefs_root(mut self, root: PathBuf) -> Self {
        self.tracefs_roots.insert(0, root);
        self
    }

    pub fn with_symbol_lookup(mut self, symbol_lookup: SymbolLookup) -> Self {
        self.symbol_lookup = symbol_lookup;
        self
    }

    pub fn resolve(&self, name: &str) -> Result<EventDescriptor, EventError> {
        if let Some(spec) = name.strip_prefix("mem:") {
            return self.breakpoint(
                name,
                spec,
                BreakpointAccess::ReadWrite,
                /* default len */ 1,
            );
        }

        if let Some(id) = name.strip_prefix("trace:") {
            let id = tracepoint::parse_raw_id(id)?;
            return Ok(tracepoint::descriptor(name, id));
        }

        if let Some(event) = AVAILABLE_EVENTS.iter().find(|event| event.name == name) {
            return Ok(EventDescriptor {
                name: event.name.to_string(),
                default_interval: event.default_interval,
                precise_ip: event.precise_ip,
                kind: event.kind,
                config: event.config,
                counter_arg: None,
            });
        }

        if name.contains(':') {
            match tracepoint::find_id(&self.tracefs_roots, name) {
                Some(id) => return Ok(tracepoint::descriptor(name, id)),
                None => debug!("{} is not a known tracepoint, trying it as a symbol", name),
            }
        }

        self.breakpoint(name, name, BreakpointAccess::Execute, POINTER_WIDTH)
    }

    fn breakpoint(
        &self,
        name: &str,
        spec: &str,
        default_access: BreakpointAccess,
        default_len: u64,
    ) -> Result<EventDescriptor, EventError> {
        let parsed = breakpoint::parse(spec, default_access, default_len)?;

        let address = if parsed.target.starts_with("0x") || parsed.target.starts_with("0X") {
            parse_c_integer(parsed.target)?
        } else {
            (self.symbol_lookup)(parsed.target)
                .ok_or_else(|| EventError::UnresolvedSymbol(parsed.target.to_string()))?
        };

        let counter_arg = if parsed.access == BreakpointAccess::Execute {
            known_function_counter_arg(parsed.target)
        } else {
            None
        };

        Ok(EventDescriptor {
            name: name.to_string(),
            default_interval: 1,
            precise_ip: 0,
            kind: EventKind::Breakpoint {
                access: parsed.access,
                len: parsed.len,
            },
            config: address.wrapping_add(parsed.offset),
            counter_arg,
        })
    }
}

/// Resolves `name` with the default tracefs mounts and `dlsym` lookups.
pub fn resolve(name: &str) -> Result<EventDescriptor, EventError> {
    EventCatalog::default().resolve(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;
    use std::fs;

    fn fake_symbols(name: &str) -> Option<u64> {
        match name {
            "foo" => Some(0x1000),
            "malloc" => Some(0x2000),
            "recvfrom" => Some(0x3000),
            _ => None,
        }
    }

    fn catalog() -> EventCatalog {
        EventCatalog::new()
            .with_symbol_lookup(fake_symbols)
            .with_tracefs_root(PathBuf::from("/nonexistent/tracefs"))
    }

    #[test]
    fn every_listed_event_resolves() {
        let names = available_events();
        assert_eq!(names.len(), AVAILABLE_EVENTS.len());
        assert_eq!(names[0], "cpu");

        for name in names {
            let descriptor = resolve(name).unwrap();
            assert_eq!(descriptor.name, name);
            assert!(descriptor.default_interval > 0);
            assert!(!matches!(
                descriptor.kind,
                EventKind::Breakpoint { .. } | EventKind::Tracepoint
            ));
        }
    }

    #[test]
    fn resolution_is_deterministic() {
        for name in ["cpu", "mem:foo:w", "trace:12", "foo", "nope:nope"] {
            assert_eq!(catalog().resolve(name), catalog().resolve(name));
        }
    }

    #[test]
    fn predefined_event_configs() {
        let cpu = resolve("cpu").unwrap();
        assert_eq!(cpu.kind, EventKind::Software);
        assert_eq!(cpu.perf_type(), sys::PERF_TYPE_SOFTWARE);
        assert_eq!(cpu.default_interval, DEFAULT_INTERVAL);
        assert_eq!(cpu.precise_ip, 2);

        let llc = resolve("LLC-load-misses").unwrap();
        assert_eq!(llc.kind, EventKind::HardwareCache);
        assert_eq!(llc.config, sys::PERF_COUNT_HW_CACHE_LL as u64 | 1 << 16);
        assert_eq!(llc.default_interval, 1000);
    }

    #[test]
    fn breakpoint_with_offset_length_and_access() {
        let descriptor = catalog().resolve("mem:foo+0x10/4:w").unwrap();
        assert_eq!(descriptor.name, "mem:foo+0x10/4:w");
        assert_eq!(descriptor.config, 0x1010);
        assert_eq!(
            descriptor.kind,
            EventKind::Breakpoint {
                access: BreakpointAccess::Write,
                len: 4
            }
        );
        assert_eq!(descriptor.kind.perf_type(), sys::PERF_TYPE_BREAKPOINT);
        assert_eq!(descriptor.counter_arg, None);
        assert_eq!(descriptor.default_interval, 1);
    }

    #[test]
    fn function_name_becomes_execution_breakpoint() {
        let descriptor = catalog().resolve("foo").unwrap();
        assert_eq!(descriptor.config, 0x1000);
        assert_eq!(
            descriptor.kind,
            EventKind::Breakpoint {
                access: BreakpointAccess::Execute,
                len: POINTER_WIDTH
            }
        );
        assert_eq!(descriptor.counter_arg, None);
    }

    #[rstest]
    #[case("malloc", Some(1))]
    #[case("recvfrom", Some(3))]
    #[case("mem:malloc:x", Some(1))]
    #[case("mem:malloc", None)]
    #[case("mem:malloc:r", None)]
    #[case("foo", None)]
    fn counter_argument_for_known_functions(#[case] name: &str, #[case] expected: Option<u8>) {
        assert_eq!(catalog().resolve(name).unwrap().counter_arg, expected);
    }

    #[test]
    fn memory_breakpoint_defaults() {
        let descriptor = catalog().resolve("mem:0x7f00").unwrap();
        assert_eq!(descriptor.config, 0x7f00);
        assert_eq!(
            descriptor.kind,
            EventKind::Breakpoint {
                access: BreakpointAccess::ReadWrite,
                len: 1
            }
        );
    }

    #[rstest]
    #[case("mem:missing", EventError::UnresolvedSymbol("missing".into()))]
    #[case("missing_function", EventError::UnresolvedSymbol("missing_function".into()))]
    #[case("mem:foo/zz", EventError::InvalidNumber("zz".into()))]
    #[case("mem:+8", EventError::EmptyBreakpointTarget("+8".into()))]
    #[case("trace:0", EventError::InvalidTracepointId("0".into()))]
    #[case("trace:-3", EventError::InvalidTracepointId("-3".into()))]
    #[case("trace:abc", EventError::InvalidTracepointId("abc".into()))]
    fn resolution_failures(#[case] name: &str, #[case] expected: EventError) {
        assert_eq!(catalog().resolve(name), Err(expected));
    }

    #[test]
    fn raw_tracepoint() {
        let descriptor = catalog().resolve("trace:42").unwrap();
        assert_eq!(descriptor.kind, EventKind::Tracepoint);
        assert_eq!(descriptor.config, 42);
        assert_eq!(descriptor.default_interval, 1);
    }

    #[test]
    fn named_tracepoint_from_tracefs() {
        let root = tempfile::tempdir().unwrap();
        let event_dir = root.path().join("events/sched/sched_switch");
        fs::create_dir_all(&event_dir).unwrap();
        fs::write(event_dir.join("id"), "317\n").unwrap();

        let catalog = catalog().with_tracefs_root(root.path().to_path_buf());
        let descriptor = catalog.resolve("sched:sched_switch").unwrap();
        assert_eq!(descriptor.kind, EventKind::Tracepoint);
        assert_eq!(descriptor.config, 317);
        assert_eq!(descriptor.name, "sched:sched_switch");

        // Not in tracefs, so it is tried as a symbol and fails.
        assert!(catalog.resolve("sched:sched_wakeup").is_err());
    }

    #[test]
    fn real_symbols_resolve_through_dlsym() {
        let descriptor = resolve("malloc").unwrap();
        assert_eq!(Some(descriptor.config), dynamic_symbol_address("malloc"));
        assert_eq!(descriptor.counter_arg, Some(1));
        assert!(dynamic_symbol_address("definitely_not_a_symbol_in_this_process").is_none());
    }
}
