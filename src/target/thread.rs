use crate::arch::riscv::CpuState;
use crate::breakpoint::Mode;
use crate::error::Result;
use crate::host::ptrace::Ptrace;
use libc::pid_t;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadState {
    Running,
    Stopped,
    Terminated,
}

/// Why a thread last stopped, as reported to the debugger.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StopReason {
    None,
    /// A signal that is neither a trap of ours nor an interrupt.
    Signal(i32),
    /// Trap at an installed breakpoint site.
    Breakpoint,
    /// Trap completing a single step.
    Trace,
    /// Hardware watchpoint, with the watched address.
    Watchpoint(Mode, u64),
    /// The debugger's asynchronous interrupt.
    Interrupted,
}

impl StopReason {
    /// The signal number carried by the stop reply.
    pub fn signal(&self) -> i32 {
        match self {
            StopReason::None => 0,
            StopReason::Signal(sig) => *sig,
            StopReason::Breakpoint | StopReason::Trace | StopReason::Watchpoint(..) => {
                libc::SIGTRAP
            }
            StopReason::Interrupted => libc::SIGINT,
        }
    }

    pub fn reason_str(&self) -> Option<&'static str> {
        match self {
            StopReason::None => None,
            StopReason::Signal(_) | StopReason::Interrupted => Some("signal"),
            StopReason::Breakpoint => Some("breakpoint"),
            StopReason::Trace => Some("trace"),
            StopReason::Watchpoint(..) => Some("watchpoint"),
        }
    }
}

/// One inferior thread. Register state is cached lazily while the thread is
/// stopped and dropped on resume; native mutation is only legal in the
/// Stopped state.
pub struct Thread {
    pub tid: pid_t,
    pub pid: pid_t,
    pub state: ThreadState,
    pub stop_reason: StopReason,
    /// Set while a software single step is in flight for this thread.
    pub stepping: bool,
    regs: Option<CpuState>,
}

impl Thread {
    pub fn new(pid: pid_t, tid: pid_t, state: ThreadState) -> Thread {
        Thread {
            tid,
            pid,
            state,
            stop_reason: StopReason::None,
            stepping: false,
            regs: None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state == ThreadState::Stopped
    }

    /// The cached CPU state, read from the kernel on first use.
    pub fn cpu_state(&mut self) -> Result<CpuState> {
        debug_assert!(self.state == ThreadState::Stopped);
        if let Some(state) = self.regs {
            return Ok(state);
        }
        let state = Ptrace::read_cpu_state(self.tid)?;
        self.regs = Some(state);
        Ok(state)
    }

    /// Write registers through to the kernel and refresh the cache.
    pub fn set_cpu_state(&mut self, state: &CpuState) -> Result<()> {
        debug_assert!(self.state == ThreadState::Stopped);
        Ptrace::write_cpu_state(self.tid, state)?;
        self.regs = Some(*state);
        Ok(())
    }

    /// Transition to Running, invalidating the register cache.
    pub fn mark_running(&mut self) {
        self.state = ThreadState::Running;
        self.stop_reason = StopReason::None;
        self.regs = None;
    }

    pub fn mark_stopped(&mut self, reason: StopReason) {
        self.state = ThreadState::Stopped;
        self.stop_reason = reason;
        self.regs = None;
    }

    pub fn mark_terminated(&mut self) {
        self.state = ThreadState::Terminated;
        self.regs = None;
    }
}
