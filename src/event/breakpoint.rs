use std::fmt;

use crate::event::{EventError, POINTER_WIDTH};

// linux/hw_breakpoint.h
const HW_BREAKPOINT_R: u32 = 1;
const HW_BREAKPOINT_W: u32 = 2;
const HW_BREAKPOINT_RW: u32 = HW_BREAKPOINT_R | HW_BREAKPOINT_W;
const HW_BREAKPOINT_X: u32 = 4;

/// Access that triggers a hardware breakpoint.
///
/// Breakpoints are written as `symbol-or-0xaddress[+offset][/length][:access]`
/// where `access` is one of `r`, `w` or `x`. Any other suffix means read-write.
/// Execution breakpoints always use pointer-width length unless a length is
/// given explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointAccess {
    Read,
    Write,
    ReadWrite,
    Execute,
}

impl BreakpointAccess {
    fn from_suffix(suffix: &str) -> Self {
        match suffix {
            "r" => BreakpointAccess::Read,
            "w" => BreakpointAccess::Write,
            "x" => BreakpointAccess::Execute,
            _ => BreakpointAccess::ReadWrite,
        }
    }

    /// `perf_event_attr.bp_type` value.
    pub fn bp_type(&self) -> u32 {
        match self {
            BreakpointAccess::Read => HW_BREAKPOINT_R,
            BreakpointAccess::Write => HW_BREAKPOINT_W,
            BreakpointAccess::ReadWrite => HW_BREAKPOINT_RW,
            BreakpointAccess::Execute => HW_BREAKPOINT_X,
        }
    }
}

impl fmt::Display for BreakpointAccess {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let access = match self {
            BreakpointAccess::Read => "r",
            BreakpointAccess::Write => "w",
            BreakpointAccess::ReadWrite => "rw",
            BreakpointAccess::Execute => "x",
        };
        write!(f, "{}", access)
    }
}

#[derive(Debug, PartialEq)]
pub(crate) struct BreakpointSpec<'a> {
    /// Symbol name or `0x` prefixed address.
    pub(crate) target: &'a str,
    pub(crate) offset: u64,
    pub(crate) len: u64,
    pub(crate) access: BreakpointAccess,
}

/// Splits a breakpoint definition into its parts. Suffixes are peeled off
/// right to left: access, then length, then offset.
pub(crate) fn parse(
    spec: &str,
    default_access: BreakpointAccess,
    default_len: u64,
) -> Result<BreakpointSpec<'_>, EventError> {
    let (rest, access, len) = match spec.rsplit_once(':') {
        Some((rest, suffix)) => {
            let access = BreakpointAccess::from_suffix(suffix);
            let len = if access == BreakpointAccess::Execute {
                POINTER_WIDTH
            } else {
                default_len
            };
            (rest, access, len)
        }
        None => (spec, default_access, default_len),
    };

    let (rest, len) = match rest.rsplit_once('/') {
        Some((rest, len)) => (rest, parse_c_integer(len)?),
        None => (rest, len),
    };

    let (target, offset) = match rest.rsplit_once('+') {
        Some((target, offset)) => (target, parse_c_integer(offset)?),
        None => (rest, 0),
    };

    if target.is_empty() {
        return Err(EventError::EmptyBreakpointTarget(spec.to_string()));
    }

    Ok(BreakpointSpec {
        target,
        offset,
        len,
        access,
    })
}

/// Parses an unsigned integer the way C's `strtoull(.., 0)` picks its base:
/// `0x` for hex, a leading `0` for octal, decimal otherwise.
pub fn parse_c_integer(value: &str) -> Result<u64, EventError> {
    let trimmed = value.trim();
    let parsed = if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16)
    } else if trimmed.len() > 1 && trimmed.starts_with('0') {
        u64::from_str_radix(&trimmed[1..], 8)
    } else {
        trimmed.parse::<u64>()
    };

    parsed.map_err(|_| EventError::InvalidNumber(value.to_string()))
}
