use crate::arch::riscv::cpu_state::{CpuState, FpState, GpState};
use crate::breakpoint::InferiorMemory;
use crate::error::{ErrorCode, Result};
use crate::log::LogLevel::LogDebug;
use crate::wait_status::{WaitResult, WaitStatus};
use libc::pid_t;
use std::ffi::c_void;
use std::mem;

const NT_PRSTATUS: i32 = 1;
const NT_FPREGSET: i32 = 2;

/// The native control primitives: one function per ptrace request the stub
/// needs, with errno translated into the shared taxonomy at this boundary.
/// Threads may only be operated on while stopped; violating that surfaces
/// as ESRCH from the kernel.
pub struct Ptrace;

fn request(req: libc::c_uint, tid: pid_t, addr: *mut c_void, data: *mut c_void) -> Result<i64> {
    unsafe { *libc::__errno_location() = 0 };
    let result = unsafe { libc::ptrace(req, tid, addr, data) };
    if result == -1 && nix::errno::errno() != 0 {
        return Err(ErrorCode::last_error());
    }
    Ok(result)
}

impl Ptrace {
    /// PTRACE_TRACEME, called by the spawner between fork and exec.
    pub fn trace_me() -> Result<()> {
        request(libc::PTRACE_TRACEME, 0, std::ptr::null_mut(), std::ptr::null_mut())?;
        Ok(())
    }

    pub fn attach(pid: pid_t) -> Result<()> {
        request(
            libc::PTRACE_ATTACH,
            pid,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )?;
        Ok(())
    }

    pub fn detach(tid: pid_t) -> Result<()> {
        request(
            libc::PTRACE_DETACH,
            tid,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )?;
        Ok(())
    }

    /// Per-thread trace options applied once the initial stop is observed:
    /// follow thread creation and report exec.
    pub fn trace_that(tid: pid_t) -> Result<()> {
        let options = libc::PTRACE_O_TRACECLONE | libc::PTRACE_O_TRACEEXEC;
        request(
            libc::PTRACE_SETOPTIONS,
            tid,
            std::ptr::null_mut(),
            options as *mut c_void,
        )?;
        Ok(())
    }

    pub fn resume(tid: pid_t, signal: i32) -> Result<()> {
        request(
            libc::PTRACE_CONT,
            tid,
            std::ptr::null_mut(),
            signal as *mut c_void,
        )?;
        Ok(())
    }

    /// Hardware single-step. The riscv kernel port does not implement it;
    /// the process model plans software steps instead.
    pub fn hardware_single_step_supported() -> bool {
        false
    }

    pub fn single_step(tid: pid_t, signal: i32) -> Result<()> {
        request(
            libc::PTRACE_SINGLESTEP,
            tid,
            std::ptr::null_mut(),
            signal as *mut c_void,
        )?;
        Ok(())
    }

    pub fn kill(pid: pid_t, signal: i32) -> Result<()> {
        if unsafe { libc::kill(pid, signal) } != 0 {
            return Err(ErrorCode::last_error());
        }
        Ok(())
    }

    /// Signal one thread of a process.
    pub fn kill_thread(pid: pid_t, tid: pid_t, signal: i32) -> Result<()> {
        let rc = unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, signal) };
        if rc != 0 {
            return Err(ErrorCode::last_error());
        }
        Ok(())
    }

    /// The message attached to the last ptrace event, e.g. the new thread
    /// id at PTRACE_EVENT_CLONE.
    pub fn event_message(tid: pid_t) -> Result<u64> {
        let mut message: libc::c_ulong = 0;
        request(
            libc::PTRACE_GETEVENTMSG,
            tid,
            std::ptr::null_mut(),
            &mut message as *mut libc::c_ulong as *mut c_void,
        )?;
        Ok(message as u64)
    }

    /// Blocking wait for any child or tracee event.
    pub fn wait_any() -> Result<WaitResult> {
        loop {
            let mut status: i32 = 0;
            let tid = unsafe { libc::waitpid(-1, &mut status, libc::__WALL) };
            if tid > 0 {
                return Ok(WaitResult {
                    tid,
                    status: WaitStatus::new(status),
                });
            }
            if nix::errno::errno() == libc::EINTR {
                continue;
            }
            return Err(ErrorCode::last_error());
        }
    }

    pub fn wait_pid(tid: pid_t) -> Result<WaitStatus> {
        loop {
            let mut status: i32 = 0;
            let result = unsafe { libc::waitpid(tid, &mut status, libc::__WALL) };
            if result == tid {
                return Ok(WaitStatus::new(status));
            }
            if nix::errno::errno() == libc::EINTR {
                continue;
            }
            return Err(ErrorCode::last_error());
        }
    }

    pub fn read_cpu_state(tid: pid_t) -> Result<CpuState> {
        let mut state = CpuState::default();
        read_regset(tid, NT_PRSTATUS, &mut state.gp as *mut GpState as *mut c_void, mem::size_of::<GpState>())?;
        read_regset(tid, NT_FPREGSET, &mut state.fp as *mut FpState as *mut c_void, mem::size_of::<FpState>())?;
        Ok(state)
    }

    pub fn write_cpu_state(tid: pid_t, state: &CpuState) -> Result<()> {
        let mut gp = state.gp;
        write_regset(tid, NT_PRSTATUS, &mut gp as *mut GpState as *mut c_void, mem::size_of::<GpState>())?;
        let mut fp = state.fp;
        write_regset(tid, NT_FPREGSET, &mut fp as *mut FpState as *mut c_void, mem::size_of::<FpState>())?;
        Ok(())
    }

    /// Bulk memory read: /proc/<tid>/mem when available, word-at-a-time
    /// PTRACE_PEEKDATA as the fallback.
    pub fn read_memory(tid: pid_t, address: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if read_mem_file(tid, address, buf).is_ok() {
            return Ok(());
        }
        read_words(tid, address, buf)
    }

    pub fn write_memory(tid: pid_t, address: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if write_mem_file(tid, address, data).is_ok() {
            return Ok(());
        }
        write_words(tid, address, data)
    }

    /// Run an injected code fragment in the context of `tid`: save the CPU
    /// state and the bytes at pc, write the fragment there, continue to its
    /// trailing trap, read the return register, then put everything back.
    /// Any failure past the first write leaves the inferior inconsistent,
    /// so it is killed rather than resumed.
    pub fn execute(tid: pid_t, code: &[u8]) -> Result<u64> {
        if code.is_empty() {
            return Err(ErrorCode::InvalidArgument);
        }
        let saved_state = Ptrace::read_cpu_state(tid)?;
        let pc = saved_state.pc();
        let mut saved_code = vec![0u8; code.len()];
        Ptrace::read_memory(tid, pc, &mut saved_code)?;

        let result = Ptrace::execute_at(tid, pc, code)
            .and_then(|()| Ptrace::read_cpu_state(tid).map(|state| state.retval()));

        let restored = Ptrace::write_memory(tid, pc, &saved_code)
            .and_then(|()| Ptrace::write_cpu_state(tid, &saved_state));

        match (result, restored) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(error), _) | (_, Err(error)) => {
                log!(LogDebug, "code injection failed, killing inferior {}", tid);
                let _ = Ptrace::kill(tid, libc::SIGKILL);
                Err(error)
            }
        }
    }

    fn execute_at(tid: pid_t, pc: u64, code: &[u8]) -> Result<()> {
        Ptrace::write_memory(tid, pc, code)?;
        // Signals that land mid-injection are swallowed; the trap from the
        // trailing ebreak ends the fragment.
        for _ in 0..100 {
            Ptrace::resume(tid, 0)?;
            let status = Ptrace::wait_pid(tid)?;
            if !status.stopped() {
                return Err(ErrorCode::ProcessNotFound);
            }
            if status.stop_sig() == libc::SIGTRAP {
                return Ok(());
            }
            log!(
                LogDebug,
                "swallowing signal {} during code injection",
                status.stop_sig()
            );
        }
        Err(ErrorCode::Busy)
    }
}

fn read_regset(tid: pid_t, set: i32, base: *mut c_void, len: usize) -> Result<()> {
    let mut iov = libc::iovec {
        iov_base: base,
        iov_len: len,
    };
    request(
        libc::PTRACE_GETREGSET,
        tid,
        set as *mut c_void,
        &mut iov as *mut libc::iovec as *mut c_void,
    )?;
    Ok(())
}

fn write_regset(tid: pid_t, set: i32, base: *mut c_void, len: usize) -> Result<()> {
    let mut iov = libc::iovec {
        iov_base: base,
        iov_len: len,
    };
    request(
        libc::PTRACE_SETREGSET,
        tid,
        set as *mut c_void,
        &mut iov as *mut libc::iovec as *mut c_void,
    )?;
    Ok(())
}

fn read_mem_file(tid: pid_t, address: u64, buf: &mut [u8]) -> Result<()> {
    let fd = open_mem_file(tid, libc::O_RDONLY)?;
    let mut done = 0;
    while done < buf.len() {
        let n = unsafe {
            libc::pread64(
                fd,
                buf[done..].as_mut_ptr() as *mut c_void,
                buf.len() - done,
                (address + done as u64) as libc::off64_t,
            )
        };
        if n <= 0 {
            unsafe { libc::close(fd) };
            return Err(ErrorCode::InvalidAddress);
        }
        done += n as usize;
    }
    unsafe { libc::close(fd) };
    Ok(())
}

fn write_mem_file(tid: pid_t, address: u64, data: &[u8]) -> Result<()> {
    let fd = open_mem_file(tid, libc::O_WRONLY)?;
    let mut done = 0;
    while done < data.len() {
        let n = unsafe {
            libc::pwrite64(
                fd,
                data[done..].as_ptr() as *const c_void,
                data.len() - done,
                (address + done as u64) as libc::off64_t,
            )
        };
        if n <= 0 {
            unsafe { libc::close(fd) };
            return Err(ErrorCode::InvalidAddress);
        }
        done += n as usize;
    }
    unsafe { libc::close(fd) };
    Ok(())
}

fn open_mem_file(tid: pid_t, flags: i32) -> Result<i32> {
    let path = format!("/proc/{}/mem\0", tid);
    let fd = unsafe { libc::open(path.as_ptr() as *const libc::c_char, flags) };
    if fd < 0 {
        return Err(ErrorCode::last_error());
    }
    Ok(fd)
}

const WORD: usize = mem::size_of::<libc::c_long>();

fn read_words(tid: pid_t, address: u64, buf: &mut [u8]) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let at = address + done as u64;
        let aligned = at & !(WORD as u64 - 1);
        let word = request(
            libc::PTRACE_PEEKDATA,
            tid,
            aligned as *mut c_void,
            std::ptr::null_mut(),
        )?;
        let bytes = (word as libc::c_long).to_ne_bytes();
        let skip = (at - aligned) as usize;
        let take = (WORD - skip).min(buf.len() - done);
        buf[done..done + take].copy_from_slice(&bytes[skip..skip + take]);
        done += take;
    }
    Ok(())
}

fn write_words(tid: pid_t, address: u64, data: &[u8]) -> Result<()> {
    let mut done = 0;
    while done < data.len() {
        let at = address + done as u64;
        let aligned = at & !(WORD as u64 - 1);
        let skip = (at - aligned) as usize;
        let take = (WORD - skip).min(data.len() - done);
        // Partial words are read-modified-written.
        let mut bytes = if skip != 0 || take != WORD {
            let word = request(
                libc::PTRACE_PEEKDATA,
                tid,
                aligned as *mut c_void,
                std::ptr::null_mut(),
            )?;
            (word as libc::c_long).to_ne_bytes()
        } else {
            [0u8; WORD]
        };
        bytes[skip..skip + take].copy_from_slice(&data[done..done + take]);
        request(
            libc::PTRACE_POKEDATA,
            tid,
            aligned as *mut c_void,
            libc::c_long::from_ne_bytes(bytes) as *mut c_void,
        )?;
        done += take;
    }
    Ok(())
}

/// Raw (unspliced) memory access bound to one thread, for the breakpoint
/// managers and the planner.
pub struct ThreadMemory {
    pub tid: pid_t,
}

impl InferiorMemory for ThreadMemory {
    fn read_memory(&mut self, address: u64, buf: &mut [u8]) -> Result<()> {
        Ptrace::read_memory(self.tid, address, buf)
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()> {
        Ptrace::write_memory(self.tid, address, data)
    }
}
