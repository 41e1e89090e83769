use crate::arch::riscv::registers::{
    g_packet_bytes, read_register, set_from_g_packet, write_register, REGISTERS,
};
use crate::arch::riscv::cpu_state::GP_REG_COUNT;
use crate::breakpoint::Mode;
use crate::error::{ErrorCode, Result};
use crate::host::{elf, file, platform};
use crate::log::LogLevel::LogDebug;
use crate::session::delegate::{BreakpointType, SessionDelegate, StopOutcome};
use crate::session::file_ops::FileOperations;
use crate::session::launch::LaunchState;
use crate::session::queue_channel::QueueChannel;
use crate::session::stop_reply::StopReply;
use crate::target::{Process, ResumeAction, ResumeKind, StopEvent, StopReason};
use crate::util::to_hex;
use libc::pid_t;
use std::collections::HashMap;
use std::sync::Arc;

/// The gdbserver-mode delegate: one (optional) inferior process, driven by
/// the command semantics of the protocol.
pub struct DebugSession {
    channel: Arc<QueueChannel>,
    process: Option<Process>,
    launch: LaunchState,
    files: FileOperations,
    /// Sizes of live code-injected allocations, for `_m`.
    allocations: HashMap<u64, u64>,
    /// `Hc` selection; None means "all threads" / current.
    continue_tid: Option<pid_t>,
}

impl DebugSession {
    /// A session with no inferior yet; one arrives via the `A` packet.
    pub fn new(channel: Arc<QueueChannel>) -> DebugSession {
        DebugSession {
            channel,
            process: None,
            launch: LaunchState::new(),
            files: FileOperations::new(),
            allocations: HashMap::new(),
            continue_tid: None,
        }
    }

    /// Attach to a running process at startup (`--attach`).
    pub fn attach(channel: Arc<QueueChannel>, pid: pid_t) -> Result<DebugSession> {
        let mut session = DebugSession::new(channel);
        session.bind_process(Process::attach(pid)?);
        Ok(session)
    }

    /// Spawn the command line given on the stub's own command line.
    pub fn launch(
        channel: Arc<QueueChannel>,
        args: Vec<String>,
        env: Vec<(String, Option<String>)>,
    ) -> Result<DebugSession> {
        let mut session = DebugSession::new(channel);
        for (key, value) in &env {
            session.launch.set_environment(key, value.as_deref());
        }
        session.launch.set_arguments(args);
        let process = session.launch.spawn_traced()?;
        session.bind_process(process);
        Ok(session)
    }

    fn bind_process(&mut self, process: Process) {
        let sink = process.interrupt_sink();
        self.channel
            .set_interrupt_hook(Box::new(move || sink.trigger()));
        self.process = Some(process);
    }

    fn process(&mut self) -> Result<&mut Process> {
        self.process.as_mut().ok_or(ErrorCode::ProcessNotFound)
    }

    fn reg_tid(&mut self, tid: Option<pid_t>) -> Result<pid_t> {
        let process = self.process()?;
        Ok(tid.unwrap_or_else(|| process.current_thread()))
    }

    /// Expedite the general-purpose file plus pc, as the stop reply wants.
    fn build_stop_reply(&mut self, tid: pid_t, reason: StopReason) -> Result<StopReply> {
        let process = self.process()?;
        let state = process.cpu_state(tid)?;
        let mut registers = Vec::with_capacity(GP_REG_COUNT + 1);
        for regno in 0..GP_REG_COUNT {
            registers.push((regno, state.x(regno), 8));
        }
        registers.push((GP_REG_COUNT, state.pc(), 8));
        Ok(StopReply {
            signal: reason.signal(),
            tid,
            registers,
            reason: reason.reason_str(),
            description: None,
            watch: match reason {
                StopReason::Watchpoint(mode, address) => Some((mode, address)),
                _ => None,
            },
            threads: process.thread_ids(),
        })
    }

    fn wait_for_stop(&mut self) -> Result<StopOutcome> {
        match self.process()?.wait()? {
            StopEvent::Exited { code } => {
                self.process = None;
                self.channel.clear_interrupt_hook();
                Ok(StopOutcome::Exited(code))
            }
            StopEvent::Killed { signal } => {
                self.process = None;
                self.channel.clear_interrupt_hook();
                Ok(StopOutcome::Killed(signal))
            }
            StopEvent::Stopped { tid, reason } => {
                Ok(StopOutcome::Stopped(self.build_stop_reply(tid, reason)?))
            }
        }
    }
}

impl SessionDelegate for DebugSession {
    fn supported_features(&self) -> Vec<String> {
        vec!["qXfer:features:read-".to_owned()]
    }

    fn on_resume(&mut self, mut actions: Vec<ResumeAction>) -> Result<StopOutcome> {
        // Legacy `s`/`S` arrive without a thread id: they step the Hc
        // selection (or the current thread), not the world.
        let fallback = self.continue_tid;
        {
            let process = self.process()?;
            for action in &mut actions {
                if action.kind == ResumeKind::Step && action.tid.is_none() {
                    action.tid = Some(fallback.unwrap_or_else(|| process.current_thread()));
                }
            }
            process.resume(&actions)?;
        }
        self.wait_for_stop()
    }

    fn on_interrupt(&mut self) {
        // The stop reply came from the resume in flight; only the stale
        // latch arm needs discarding.
        if let Some(process) = &self.process {
            process.drain_interrupt();
        }
    }

    fn on_detach(&mut self) -> Result<()> {
        let mut process = self.process.take().ok_or(ErrorCode::ProcessNotFound)?;
        self.channel.clear_interrupt_hook();
        process.detach()
    }

    fn on_kill(&mut self) -> Result<StopOutcome> {
        let event = self.process()?.terminate()?;
        self.process = None;
        self.channel.clear_interrupt_hook();
        Ok(match event {
            StopEvent::Exited { code } => StopOutcome::Exited(code),
            StopEvent::Killed { signal } => StopOutcome::Killed(signal),
            StopEvent::Stopped { .. } => StopOutcome::Killed(libc::SIGKILL),
        })
    }

    fn on_stop_reason(&mut self) -> Result<StopOutcome> {
        let process = self.process()?;
        let tid = process.current_thread();
        let reason = match process.stop_reason_of(tid) {
            StopReason::None => StopReason::Signal(libc::SIGTRAP),
            reason => reason,
        };
        Ok(StopOutcome::Stopped(self.build_stop_reply(tid, reason)?))
    }

    fn on_thread_list(&mut self) -> Result<Vec<pid_t>> {
        Ok(self.process()?.thread_ids())
    }

    fn on_current_thread(&mut self) -> Result<pid_t> {
        Ok(self.process()?.current_thread())
    }

    fn on_select_thread(&mut self, for_continue: bool, tid: i64) -> Result<()> {
        if for_continue {
            self.continue_tid = if tid > 0 { Some(tid as pid_t) } else { None };
            return Ok(());
        }
        self.process()?.set_current_thread(tid as pid_t)
    }

    fn on_thread_alive(&mut self, tid: pid_t) -> Result<bool> {
        Ok(self.process()?.has_thread(tid))
    }

    fn on_thread_extra_info(&mut self, tid: pid_t) -> Result<String> {
        let pid = self.process()?.pid();
        platform::thread_name(pid, tid).ok_or(ErrorCode::ProcessNotFound)
    }

    fn on_read_registers(&mut self, tid: Option<pid_t>) -> Result<Vec<u8>> {
        let tid = self.reg_tid(tid)?;
        let state = self.process()?.cpu_state(tid)?;
        Ok(g_packet_bytes(&state))
    }

    fn on_write_registers(&mut self, tid: Option<pid_t>, data: &[u8]) -> Result<()> {
        let tid = self.reg_tid(tid)?;
        let process = self.process()?;
        let mut state = process.cpu_state(tid)?;
        set_from_g_packet(&mut state, data)?;
        process.set_cpu_state(tid, &state)
    }

    fn on_read_register(&mut self, tid: Option<pid_t>, regno: usize) -> Result<Vec<u8>> {
        let tid = self.reg_tid(tid)?;
        let state = self.process()?.cpu_state(tid)?;
        let (value, size) = read_register(&state, regno)?;
        Ok(value.to_le_bytes()[..size].to_vec())
    }

    fn on_write_register(&mut self, tid: Option<pid_t>, regno: usize, data: &[u8]) -> Result<()> {
        let tid = self.reg_tid(tid)?;
        if data.is_empty() || data.len() > 8 {
            return Err(ErrorCode::InvalidArgument);
        }
        let mut raw = [0u8; 8];
        raw[..data.len()].copy_from_slice(data);
        let value = u64::from_le_bytes(raw);
        let process = self.process()?;
        let mut state = process.cpu_state(tid)?;
        write_register(&mut state, regno, value)?;
        process.set_cpu_state(tid, &state)
    }

    fn on_register_info(&mut self, regno: usize) -> Result<String> {
        let info = REGISTERS.get(regno).ok_or(ErrorCode::InvalidArgument)?;
        let mut out = format!(
            "name:{};bitsize:{};offset:{};encoding:{};format:{};set:{};",
            info.name, info.bitsize, info.offset, info.encoding, info.format, info.set
        );
        if let Some(alt) = info.alt_name {
            out.push_str(&format!("alt-name:{};", alt));
        }
        if let Some(dwarf) = info.dwarf {
            out.push_str(&format!("gcc:{};dwarf:{};", dwarf, dwarf));
        }
        if let Some(generic) = info.generic {
            out.push_str(&format!("generic:{};", generic));
        }
        Ok(out)
    }

    fn on_read_memory(&mut self, address: u64, length: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length];
        self.process()?.read_memory(address, &mut buf)?;
        Ok(buf)
    }

    fn on_write_memory(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.process()?.write_memory(address, data)
    }

    fn on_allocate_memory(&mut self, size: u64, permissions: i32) -> Result<u64> {
        let address = self.process()?.allocate_memory(size, permissions)?;
        self.allocations.insert(address, size);
        log!(
            LogDebug,
            "allocated {:#x} byte(s) at {:#x} in the inferior",
            size,
            address
        );
        Ok(address)
    }

    fn on_deallocate_memory(&mut self, address: u64) -> Result<()> {
        let size = self
            .allocations
            .remove(&address)
            .ok_or(ErrorCode::InvalidArgument)?;
        self.process()?.deallocate_memory(address, size)
    }

    fn on_insert_breakpoint(
        &mut self,
        kind: BreakpointType,
        address: u64,
        size: usize,
    ) -> Result<()> {
        let (hardware, mode) = breakpoint_mode(kind);
        self.process()?.insert_breakpoint(hardware, address, size, mode)
    }

    fn on_remove_breakpoint(&mut self, kind: BreakpointType, address: u64) -> Result<()> {
        let (hardware, _) = breakpoint_mode(kind);
        self.process()?.remove_breakpoint(hardware, address)
    }

    fn on_host_info(&mut self) -> Result<String> {
        Ok(format!(
            "triple:{};ptrsize:{};endian:little;ostype:linux;hostname:{};",
            to_hex(platform::triple().as_bytes()),
            platform::pointer_size(),
            to_hex(platform::hostname().as_bytes()),
        ))
    }

    fn on_process_info(&mut self) -> Result<String> {
        let pid = self.process()?.pid();
        let info = platform::process_info(pid)?;
        Ok(format!(
            "pid:{:x};parent-pid:{:x};real-uid:{:x};real-gid:{:x};\
             effective-uid:{:x};effective-gid:{:x};triple:{};ostype:linux;\
             endian:little;ptrsize:{};",
            info.pid,
            info.parent_pid,
            info.real_uid,
            info.real_gid,
            info.effective_uid,
            info.effective_gid,
            to_hex(platform::triple().as_bytes()),
            platform::pointer_size(),
        ))
    }

    fn on_query_memory_region(&mut self, address: u64) -> Result<String> {
        let pid = self.process()?.pid();
        let region = platform::memory_region(pid, address)?;
        let mut permissions = String::new();
        if region.readable {
            permissions.push('r');
        }
        if region.writable {
            permissions.push('w');
        }
        if region.executable {
            permissions.push('x');
        }
        let mut out = format!(
            "start:{:x};size:{:x};permissions:{};",
            region.start,
            region.end - region.start,
            permissions,
        );
        if let Some(name) = region.name {
            out.push_str(&format!("name:{};", to_hex(name.as_bytes())));
        }
        Ok(out)
    }

    fn on_query_module_info(&mut self, path: &str, triple: &str) -> Result<String> {
        let build_id = elf::build_id(path)?;
        let uuid: String = build_id.iter().map(|b| format!("{:02X}", b)).collect();
        let size = file::file_size(path)?;
        Ok(format!(
            "uuid:{};triple:{};file_path:{};file_size:{:x};file_offset:0;",
            uuid,
            to_hex(triple.as_bytes()),
            to_hex(path.as_bytes()),
            size,
        ))
    }

    fn on_file_open(&mut self, path: &str, flags: u32, mode: u32) -> Result<i32> {
        self.files.open(path, flags, mode)
    }

    fn on_file_close(&mut self, fd: i32) -> Result<()> {
        self.files.close(fd)
    }

    fn on_file_pread(&mut self, fd: i32, count: usize, offset: u64) -> Result<Vec<u8>> {
        self.files.pread(fd, count, offset)
    }

    fn on_file_pwrite(&mut self, fd: i32, offset: u64, data: &[u8]) -> Result<usize> {
        self.files.pwrite(fd, offset, data)
    }

    fn on_file_fstat(&mut self, fd: i32) -> Result<Vec<u8>> {
        self.files.fstat(fd)
    }

    fn on_file_stat(&mut self, path: &str) -> Result<Vec<u8>> {
        self.files.stat(path)
    }

    fn on_file_unlink(&mut self, path: &str) -> Result<()> {
        file::unlink(path)
    }

    fn on_file_readlink(&mut self, path: &str) -> Result<String> {
        file::readlink(path)
    }

    fn on_file_mkdir(&mut self, path: &str, mode: u32) -> Result<()> {
        file::mkdir(path, mode)
    }

    fn on_file_chmod(&mut self, path: &str, mode: u32) -> Result<()> {
        file::chmod(path, mode)
    }

    fn on_disable_aslr(&mut self, disable: bool) -> Result<()> {
        self.launch.set_disable_aslr(disable);
        Ok(())
    }

    fn on_set_std_file(&mut self, fileno: i32, path: &str) -> Result<()> {
        self.launch.set_std_file(fileno, path)
    }

    fn on_set_working_dir(&mut self, path: &str) -> Result<()> {
        self.launch.set_working_directory(path);
        Ok(())
    }

    fn on_query_working_dir(&mut self) -> Result<String> {
        Ok(self.launch.working_directory().to_owned())
    }

    fn on_set_environment(&mut self, key: &str, value: Option<&str>) -> Result<()> {
        self.launch.set_environment(key, value);
        Ok(())
    }

    fn on_set_arguments(&mut self, args: Vec<String>) -> Result<()> {
        self.launch.set_arguments(args);
        let process = self.launch.spawn_traced()?;
        self.bind_process(process);
        Ok(())
    }

    fn on_query_launch_success(&mut self, _pid: Option<pid_t>) -> Result<()> {
        match self.launch.last_launch_error() {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }
}

fn breakpoint_mode(kind: BreakpointType) -> (bool, Mode) {
    match kind {
        BreakpointType::SoftExec => (false, Mode::EXEC),
        BreakpointType::HardExec => (true, Mode::EXEC),
        BreakpointType::HardWrite => (true, Mode::WRITE),
        BreakpointType::HardRead => (true, Mode::READ),
        BreakpointType::HardAccess => (true, Mode::access()),
    }
}
