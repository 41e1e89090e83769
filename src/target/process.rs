use crate::arch::riscv::single_step::prepare_software_single_step;
use crate::arch::riscv::{syscalls, CpuState};
use crate::breakpoint::{
    HardwareBreakpointManager, Lifetime, Mode, SoftwareBreakpointManager,
};
use crate::error::{ErrorCode, Result};
use crate::host::ptrace::{Ptrace, ThreadMemory};
use crate::host::spawner::ProcessSpawner;
use crate::host::wait_interrupter::WaitInterrupter;
use crate::log::LogLevel::{LogDebug, LogWarn};
use crate::target::thread::{StopReason, Thread, ThreadState};
use crate::wait_status::WaitResult;
use bitflags::bitflags;
use libc::pid_t;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

bitflags! {
    pub struct ProcessFlags: u32 {
        const ATTACHED = 1 << 0;
        const SPAWNED = 1 << 1;
    }
}

/// RISC-V Linux exposes no debug-register bank through ptrace.
const MAX_WATCHPOINTS: usize = 0;

/// What `Process::wait` hands back to the session.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StopEvent {
    Stopped { tid: pid_t, reason: StopReason },
    Exited { code: i32 },
    Killed { signal: i32 },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResumeKind {
    Continue,
    Step,
    Stop,
}

/// One element of a vCont action list. `tid` of None is the default action.
#[derive(Copy, Clone, Debug)]
pub struct ResumeAction {
    pub kind: ResumeKind,
    pub tid: Option<pid_t>,
    pub signal: Option<i32>,
}

/// The shared half of the interrupt path. The queue-channel reader thread
/// triggers it while the session thread may be blocked in waitpid, so it
/// carries only atomics and the latch (which has its own mutex).
pub struct InterruptSink {
    pid: AtomicI32,
    pending: AtomicBool,
    interrupter: WaitInterrupter,
}

impl InterruptSink {
    pub fn new() -> InterruptSink {
        InterruptSink {
            pid: AtomicI32::new(0),
            pending: AtomicBool::new(false),
            interrupter: WaitInterrupter::new(),
        }
    }

    fn bind(&self, pid: pid_t) {
        self.pid.store(pid, Ordering::SeqCst);
    }

    /// SIGSTOP the inferior and arm the wait interrupter. Safe to call from
    /// any thread.
    pub fn trigger(&self) {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid <= 0 {
            return;
        }
        self.pending.store(true, Ordering::SeqCst);
        let _ = Ptrace::kill(pid, libc::SIGSTOP);
        let _ = self.interrupter.send_interrupt();
    }

    fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }

    fn interrupter(&self) -> &WaitInterrupter {
        &self.interrupter
    }
}

/// The inferior: thread table, stop bookkeeping, signal passthrough, the
/// breakpoint managers, and the resume/wait state machine over ptrace.
pub struct Process {
    pid: pid_t,
    flags: ProcessFlags,
    threads: BTreeMap<pid_t, Thread>,
    current_tid: pid_t,
    passthrough_signals: HashSet<i32>,
    software_breakpoints: SoftwareBreakpointManager,
    hardware_breakpoints: HardwareBreakpointManager,
    sink: Arc<InterruptSink>,
}

impl Process {
    /// Take ownership of an already-running process.
    pub fn attach(pid: pid_t) -> Result<Process> {
        if pid <= 0 {
            return Err(ErrorCode::InvalidArgument);
        }
        Ptrace::attach(pid)?;
        Ptrace::wait_pid(pid)?;
        Ptrace::trace_that(pid)?;

        let mut process = Process::new(pid, ProcessFlags::ATTACHED);
        process
            .threads
            .insert(pid, Thread::new(pid, pid, ThreadState::Stopped));

        // Pick up the other threads of an already-threaded target.
        for tid in enumerate_tasks(pid) {
            if tid == pid {
                continue;
            }
            if Ptrace::attach(tid).is_ok() && Ptrace::wait_pid(tid).is_ok() {
                let _ = Ptrace::trace_that(tid);
                process
                    .threads
                    .insert(tid, Thread::new(pid, tid, ThreadState::Stopped));
            }
        }
        log!(
            LogDebug,
            "attached to process {} with {} thread(s)",
            pid,
            process.threads.len()
        );
        Ok(process)
    }

    /// Fork and exec a new inferior through `spawner`. The child moves to
    /// its own process group, drops any setgid privilege, optionally turns
    /// off address randomization, and requests tracing before exec.
    pub fn spawn(spawner: &mut ProcessSpawner, disable_aslr: bool) -> Result<Process> {
        spawner.set_pre_exec(Box::new(move || {
            if unsafe { libc::setpgid(0, 0) } != 0 {
                return false;
            }
            if unsafe { libc::setgid(libc::getgid()) } != 0 {
                return false;
            }
            if disable_aslr {
                const ADDR_NO_RANDOMIZE: libc::c_ulong = 0x0040000;
                unsafe { libc::personality(ADDR_NO_RANDOMIZE) };
            }
            Ptrace::trace_me().is_ok()
        }));
        let pid = spawner.run()?;
        // The exec under PTRACE_TRACEME delivers the initial trap. A child
        // that died before exec shows up as an exit here.
        let status = Ptrace::wait_pid(pid)?;
        if !status.stopped() {
            return Err(ErrorCode::ProcessNotFound);
        }
        Ptrace::trace_that(pid)?;

        let mut process = Process::new(pid, ProcessFlags::SPAWNED);
        process
            .threads
            .insert(pid, Thread::new(pid, pid, ThreadState::Stopped));
        log!(LogDebug, "created process {}", pid);
        Ok(process)
    }

    fn new(pid: pid_t, flags: ProcessFlags) -> Process {
        let sink = Arc::new(InterruptSink::new());
        sink.bind(pid);
        Process {
            pid,
            flags,
            threads: BTreeMap::new(),
            current_tid: pid,
            passthrough_signals: HashSet::new(),
            software_breakpoints: SoftwareBreakpointManager::new(),
            hardware_breakpoints: HardwareBreakpointManager::new(MAX_WATCHPOINTS),
            sink,
        }
    }

    pub fn pid(&self) -> pid_t {
        self.pid
    }

    pub fn is_attached(&self) -> bool {
        self.flags.contains(ProcessFlags::ATTACHED)
    }

    pub fn is_alive(&self) -> bool {
        self.pid > 0 && unsafe { libc::kill(self.pid, 0) } == 0
    }

    /// The sink to register with the queue channel's interrupt hook.
    pub fn interrupt_sink(&self) -> Arc<InterruptSink> {
        Arc::clone(&self.sink)
    }

    /// Asynchronous interrupt: stop the world even if it is already
    /// stopped.
    pub fn interrupt(&self) {
        self.sink.trigger();
    }

    pub fn thread_ids(&self) -> Vec<pid_t> {
        self.threads.keys().copied().collect()
    }

    pub fn has_thread(&self, tid: pid_t) -> bool {
        self.threads.contains_key(&tid)
    }

    pub fn has_running_threads(&self) -> bool {
        self.threads
            .values()
            .any(|t| t.state == ThreadState::Running)
    }

    pub fn current_thread(&self) -> pid_t {
        self.current_tid
    }

    /// Select the thread used for register and memory defaults (`Hg`).
    /// Zero and -1 mean "any thread".
    pub fn set_current_thread(&mut self, tid: pid_t) -> Result<()> {
        if tid <= 0 {
            self.current_tid = self.pid;
            return Ok(());
        }
        if !self.threads.contains_key(&tid) {
            return Err(ErrorCode::ProcessNotFound);
        }
        self.current_tid = tid;
        Ok(())
    }

    pub fn stop_reason_of(&self, tid: pid_t) -> StopReason {
        self.threads
            .get(&tid)
            .map(|t| t.stop_reason)
            .unwrap_or(StopReason::None)
    }

    pub fn max_watchpoints(&self) -> usize {
        self.hardware_breakpoints.max_watchpoints()
    }

    fn memory_tid(&self) -> pid_t {
        self.current_tid
    }

    // ---- signal passthrough -------------------------------------------

    pub fn set_signal_pass(&mut self, signal: i32, set: bool) {
        if set {
            self.passthrough_signals.insert(signal);
        } else {
            self.passthrough_signals.remove(&signal);
        }
    }

    pub fn reset_signal_pass(&mut self) {
        self.passthrough_signals.clear();
    }

    // ---- registers ----------------------------------------------------

    pub fn cpu_state(&mut self, tid: pid_t) -> Result<CpuState> {
        self.threads
            .get_mut(&tid)
            .ok_or(ErrorCode::ProcessNotFound)?
            .cpu_state()
    }

    pub fn set_cpu_state(&mut self, tid: pid_t, state: &CpuState) -> Result<()> {
        self.threads
            .get_mut(&tid)
            .ok_or(ErrorCode::ProcessNotFound)?
            .set_cpu_state(state)
    }

    // ---- memory -------------------------------------------------------

    /// Read through the breakpoint shadow: installed traps are invisible.
    pub fn read_memory(&mut self, address: u64, buf: &mut [u8]) -> Result<()> {
        Ptrace::read_memory(self.memory_tid(), address, buf)?;
        self.software_breakpoints.patch_read(address, buf);
        Ok(())
    }

    /// Write around installed traps: overlapping bytes go to the shadow,
    /// memory keeps the trap opcodes.
    pub fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let mut patched = data.to_vec();
        self.software_breakpoints.patch_write(address, &mut patched);
        Ptrace::write_memory(self.memory_tid(), address, &patched)
    }

    /// mmap in the inferior by running an injected syscall fragment on the
    /// current thread.
    pub fn allocate_memory(&mut self, size: u64, protection: i32) -> Result<u64> {
        if size == 0 {
            return Err(ErrorCode::InvalidArgument);
        }
        let mut code = Vec::new();
        syscalls::mmap(size, protection, &mut code);
        let result = Ptrace::execute(self.memory_tid(), &code)?;
        if (result as i64) < 0 {
            return Err(ErrorCode::Unknown);
        }
        // The injected wait consumed this thread's stop; its cached
        // registers are stale.
        if let Some(thread) = self.threads.get_mut(&self.current_tid) {
            let reason = thread.stop_reason;
            thread.mark_stopped(reason);
        }
        Ok(result)
    }

    pub fn deallocate_memory(&mut self, address: u64, size: u64) -> Result<()> {
        if size == 0 {
            return Err(ErrorCode::InvalidArgument);
        }
        let mut code = Vec::new();
        syscalls::munmap(address, size, &mut code);
        let result = Ptrace::execute(self.memory_tid(), &code)?;
        if (result as i64) < 0 {
            return Err(ErrorCode::Unknown);
        }
        if let Some(thread) = self.threads.get_mut(&self.current_tid) {
            let reason = thread.stop_reason;
            thread.mark_stopped(reason);
        }
        Ok(())
    }

    // ---- breakpoints --------------------------------------------------

    pub fn insert_breakpoint(
        &mut self,
        hardware: bool,
        address: u64,
        size: usize,
        mode: Mode,
    ) -> Result<()> {
        let mut mem = ThreadMemory {
            tid: self.memory_tid(),
        };
        if hardware {
            self.hardware_breakpoints
                .add(&mut mem, address, Lifetime::Permanent, size, mode)
        } else {
            self.software_breakpoints
                .add(&mut mem, address, Lifetime::Permanent, size, mode)
        }
    }

    pub fn remove_breakpoint(&mut self, hardware: bool, address: u64) -> Result<()> {
        let mut mem = ThreadMemory {
            tid: self.memory_tid(),
        };
        if hardware {
            self.hardware_breakpoints.remove(&mut mem, address)
        } else {
            self.software_breakpoints.remove(&mut mem, address)
        }
    }

    // ---- resume and wait ----------------------------------------------

    /// Discard a stale wait-interrupt arm whose event was already answered.
    pub fn drain_interrupt(&self) {
        self.sink.interrupter().drain();
    }

    /// Apply a vCont-style action list to every stopped thread.
    pub fn resume(&mut self, actions: &[ResumeAction]) -> Result<()> {
        self.sink.interrupter().drain();
        let tids: Vec<pid_t> = self
            .threads
            .iter()
            .filter(|(_, t)| t.is_stopped())
            .map(|(tid, _)| *tid)
            .collect();
        for tid in tids {
            let action = match select_action(actions, tid) {
                Some(action) => action,
                None => continue,
            };
            match action.kind {
                ResumeKind::Continue => self.resume_thread(tid, action.signal)?,
                ResumeKind::Step => self.step_thread(tid, action.signal)?,
                ResumeKind::Stop => {}
            }
        }
        Ok(())
    }

    fn deliverable_signal(&self, tid: pid_t, requested: Option<i32>) -> i32 {
        if let Some(signal) = requested {
            return signal;
        }
        // Pending signals are forwarded only when in the passthrough set;
        // otherwise they were reported to the debugger and are dropped.
        match self.threads.get(&tid).map(|t| t.stop_reason) {
            Some(StopReason::Signal(signal)) if self.passthrough_signals.contains(&signal) => {
                signal
            }
            _ => 0,
        }
    }

    fn resume_thread(&mut self, tid: pid_t, requested: Option<i32>) -> Result<()> {
        let signal = self.deliverable_signal(tid, requested);
        Ptrace::resume(tid, signal)?;
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.mark_running();
        }
        Ok(())
    }

    /// Single step: hardware where the port supports it, otherwise a
    /// planned one-shot breakpoint on the successor instruction.
    fn step_thread(&mut self, tid: pid_t, requested: Option<i32>) -> Result<()> {
        let signal = self.deliverable_signal(tid, requested);
        if Ptrace::hardware_single_step_supported() {
            Ptrace::single_step(tid, signal)?;
        } else {
            let state = self
                .threads
                .get_mut(&tid)
                .ok_or(ErrorCode::ProcessNotFound)?
                .cpu_state()?;
            let mut mem = ThreadMemory { tid };
            prepare_software_single_step(&mut mem, &mut self.software_breakpoints, &state, None)?;
            Ptrace::resume(tid, signal)?;
        }
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.mark_running();
            thread.stepping = true;
        }
        Ok(())
    }

    /// Block until the inferior produces a reportable event, then stop the
    /// world and hand the event back. Thread creation and exec reports are
    /// consumed internally.
    pub fn wait(&mut self) -> Result<StopEvent> {
        loop {
            let WaitResult { tid, status } = Ptrace::wait_any()?;

            if self.sink.interrupter().check_interrupt(tid, status) {
                // Every thread was already stopped; report the interrupt on
                // the current thread.
                self.sink.take_pending();
                let tid = self.current_tid;
                if let Some(thread) = self.threads.get_mut(&tid) {
                    thread.stop_reason = StopReason::Interrupted;
                }
                return Ok(StopEvent::Stopped {
                    tid,
                    reason: StopReason::Interrupted,
                });
            }

            if status.exited() || status.signaled() {
                if let Some(thread) = self.threads.get_mut(&tid) {
                    thread.mark_terminated();
                }
                self.threads.remove(&tid);
                if tid == self.pid {
                    return Ok(if status.exited() {
                        StopEvent::Exited {
                            code: status.exit_code(),
                        }
                    } else {
                        StopEvent::Killed {
                            signal: status.term_sig(),
                        }
                    });
                }
                continue;
            }

            if !status.stopped() {
                continue;
            }

            // New threads announce themselves with a SIGSTOP before we have
            // seen the parent's clone event; either order works.
            if !self.threads.contains_key(&tid) {
                self.threads
                    .insert(tid, Thread::new(self.pid, tid, ThreadState::Stopped));
                if status.stop_sig() == libc::SIGSTOP {
                    let _ = Ptrace::resume(tid, 0);
                    if let Some(thread) = self.threads.get_mut(&tid) {
                        thread.mark_running();
                    }
                    continue;
                }
            }

            match status.ptrace_event() {
                libc::PTRACE_EVENT_CLONE => {
                    if let Ok(new_tid) = Ptrace::event_message(tid) {
                        let new_tid = new_tid as pid_t;
                        let pid = self.pid;
                        log!(LogDebug, "thread {} cloned thread {}", tid, new_tid);
                        self.threads
                            .entry(new_tid)
                            .or_insert_with(|| Thread::new(pid, new_tid, ThreadState::Running));
                    }
                    let _ = Ptrace::resume(tid, 0);
                    continue;
                }
                libc::PTRACE_EVENT_EXEC => {
                    log!(LogDebug, "thread {} exec'd", tid);
                    let _ = Ptrace::resume(tid, 0);
                    continue;
                }
                _ => {}
            }

            let reason = self.classify_stop(tid, status.stop_sig())?;
            self.stop_all_threads(tid);
            if let Some(thread) = self.threads.get_mut(&tid) {
                thread.mark_stopped(reason);
            }
            self.current_tid = tid;
            return Ok(StopEvent::Stopped { tid, reason });
        }
    }

    fn classify_stop(&mut self, tid: pid_t, signal: i32) -> Result<StopReason> {
        let stepping = self
            .threads
            .get(&tid)
            .map(|t| t.stepping)
            .unwrap_or(false);
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.stepping = false;
        }

        if signal == libc::SIGTRAP {
            let state = Ptrace::read_cpu_state(tid)?;
            let mut mem = ThreadMemory { tid };
            return Ok(
                match self.software_breakpoints.hit(&mut mem, state.pc()) {
                    Some(Lifetime::TemporaryOneShot) if stepping => StopReason::Trace,
                    Some(_) => StopReason::Breakpoint,
                    None if stepping => StopReason::Trace,
                    None => StopReason::Signal(libc::SIGTRAP),
                },
            );
        }

        if signal == libc::SIGSTOP && self.sink.take_pending() {
            return Ok(StopReason::Interrupted);
        }

        Ok(StopReason::Signal(signal))
    }

    /// Stop every running thread and consume the resulting wait events.
    fn stop_all_threads(&mut self, except: pid_t) {
        loop {
            let running: Vec<pid_t> = self
                .threads
                .iter()
                .filter(|(tid, t)| **tid != except && t.state == ThreadState::Running)
                .map(|(tid, _)| *tid)
                .collect();
            if running.is_empty() {
                return;
            }
            for tid in &running {
                let _ = Ptrace::kill_thread(self.pid, *tid, libc::SIGSTOP);
            }
            for tid in running {
                match Ptrace::wait_pid(tid) {
                    Ok(status) if status.stopped() => {
                        let reason = match status.stop_sig() {
                            libc::SIGSTOP => StopReason::None,
                            signal => StopReason::Signal(signal),
                        };
                        if let Some(thread) = self.threads.get_mut(&tid) {
                            thread.mark_stopped(reason);
                        }
                    }
                    Ok(_) => {
                        self.threads.remove(&tid);
                    }
                    Err(_) => {
                        log!(LogWarn, "lost thread {} while stopping the world", tid);
                        self.threads.remove(&tid);
                    }
                }
            }
        }
    }

    // ---- teardown -----------------------------------------------------

    /// Restore all software breakpoints and release tracing.
    pub fn detach(&mut self) -> Result<()> {
        let mut mem = ThreadMemory {
            tid: self.memory_tid(),
        };
        self.software_breakpoints.clear(&mut mem);
        for tid in self.thread_ids() {
            let _ = Ptrace::detach(tid);
        }
        self.flags.remove(ProcessFlags::ATTACHED);
        log!(LogDebug, "detached from process {}", self.pid);
        Ok(())
    }

    /// Unconditional SIGKILL; returns once the exit event is harvested.
    pub fn terminate(&mut self) -> Result<StopEvent> {
        Ptrace::kill(self.pid, libc::SIGKILL)?;
        loop {
            match self.wait()? {
                event @ StopEvent::Exited { .. } | event @ StopEvent::Killed { .. } => {
                    return Ok(event)
                }
                StopEvent::Stopped { tid, .. } => {
                    // Keep draining stops until the kill lands.
                    let _ = Ptrace::resume(tid, 0);
                    if let Some(thread) = self.threads.get_mut(&tid) {
                        thread.mark_running();
                    }
                }
            }
        }
    }
}

fn select_action(actions: &[ResumeAction], tid: pid_t) -> Option<ResumeAction> {
    actions
        .iter()
        .find(|a| a.tid == Some(tid))
        .or_else(|| actions.iter().find(|a| a.tid.is_none()))
        .copied()
}

fn enumerate_tasks(pid: pid_t) -> Vec<pid_t> {
    let mut tids = Vec::new();
    if let Ok(entries) = fs::read_dir(format!("/proc/{}/task", pid)) {
        for entry in entries.flatten() {
            if let Some(tid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<pid_t>().ok())
            {
                tids.push(tid);
            }
        }
    }
    tids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_selection_prefers_exact_tid() {
        let actions = [
            ResumeAction {
                kind: ResumeKind::Step,
                tid: Some(7),
                signal: None,
            },
            ResumeAction {
                kind: ResumeKind::Continue,
                tid: None,
                signal: None,
            },
        ];
        assert_eq!(select_action(&actions, 7).unwrap().kind, ResumeKind::Step);
        assert_eq!(
            select_action(&actions, 8).unwrap().kind,
            ResumeKind::Continue
        );
    }

    #[test]
    fn no_default_action_leaves_threads_alone() {
        let actions = [ResumeAction {
            kind: ResumeKind::Continue,
            tid: Some(3),
            signal: None,
        }];
        assert!(select_action(&actions, 4).is_none());
    }
}
