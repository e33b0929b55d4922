use std::fmt;

#[derive(Debug, PartialEq)]
pub enum Architecture {
    Arm64,
    X86,
    Other,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Architecture::Arm64 => write!(f, "aarch64"),
            Architecture::X86 => write!(f, "x86_64"),
            Architecture::Other => write!(f, "unsupported"),
        }
    }
}

#[cfg(target_arch = "aarch64")]
pub fn architecture() -> Architecture {
    Architecture::Arm64
}

#[cfg(target_arch = "x86_64")]
pub fn architecture() -> Architecture {
    Architecture::X86
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn architecture() -> Architecture {
    Architecture::Other
}

/// Registers of the interrupted thread at the time a sample was taken.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StackFrame {
    pub pc: u64,
    pub sp: u64,
    /// First four integer call arguments, as passed in registers.
    pub args: [u64; 4],
}

impl StackFrame {
    /// Value of the 1-based call argument `index`, if it is passed in a register.
    pub fn arg(&self, index: u8) -> Option<u64> {
        match index {
            1..=4 => Some(self.args[index as usize - 1]),
            _ => None,
        }
    }

    /// # Safety
    ///
    /// `ucontext` must be the context pointer handed to a `SA_SIGINFO` signal
    /// handler, or null.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn from_ucontext(ucontext: *const libc::c_void) -> Self {
        let Some(ucontext) = (ucontext as *const libc::ucontext_t).as_ref() else {
            return StackFrame::default();
        };
        let gregs = &ucontext.uc_mcontext.gregs;
        let reg = |index: libc::c_int| gregs[index as usize] as u64;

        StackFrame {
            pc: reg(libc::REG_RIP),
            sp: reg(libc::REG_RSP),
            args: [
                reg(libc::REG_RDI),
                reg(libc::REG_RSI),
                reg(libc::REG_RDX),
                reg(libc::REG_RCX),
            ],
        }
    }

    /// # Safety
    ///
    /// `ucontext` must be the context pointer handed to a `SA_SIGINFO` signal
    /// handler, or null.
    #[cfg(target_arch = "aarch64")]
    pub unsafe fn from_ucontext(ucontext: *const libc::c_void) -> Self {
        let Some(ucontext) = (ucontext as *const libc::ucontext_t).as_ref() else {
            return StackFrame::default();
        };
        let mcontext = &ucontext.uc_mcontext;

        StackFrame {
            pc: mcontext.pc,
            sp: mcontext.sp,
            args: [
                mcontext.regs[0],
                mcontext.regs[1],
                mcontext.regs[2],
                mcontext.regs[3],
            ],
        }
    }

    /// # Safety
    ///
    /// Always safe, registers are not decoded on this architecture.
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    pub unsafe fn from_ucontext(_ucontext: *const libc::c_void) -> Self {
        StackFrame::default()
    }
}
