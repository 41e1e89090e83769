use crate::error::{ErrorCode, Result};
use crate::host::platform::{ProcessInfo, ProcessInfoMatch};
use crate::session::stop_reply::StopReply;
use crate::target::ResumeAction;
use libc::pid_t;

/// What a resume-class command produced.
#[derive(Clone, Debug)]
pub enum StopOutcome {
    Stopped(StopReply),
    Exited(i32),
    Killed(i32),
}

/// Breakpoint kinds as they appear in Z/z packets.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BreakpointType {
    SoftExec,
    HardExec,
    HardWrite,
    HardRead,
    HardAccess,
}

impl BreakpointType {
    pub fn from_z(digit: u8) -> Option<BreakpointType> {
        match digit {
            b'0' => Some(BreakpointType::SoftExec),
            b'1' => Some(BreakpointType::HardExec),
            b'2' => Some(BreakpointType::HardWrite),
            b'3' => Some(BreakpointType::HardRead),
            b'4' => Some(BreakpointType::HardAccess),
            _ => None,
        }
    }
}

/// The command semantics behind the wire protocol. The session parses and
/// serializes; delegates implement the half of this surface they serve
/// (debug vs platform) and inherit Unsupported for the rest.
#[allow(unused_variables)]
pub trait SessionDelegate {
    // ---- handshake ----------------------------------------------------

    /// Extra feature tokens appended to the qSupported reply.
    fn supported_features(&self) -> Vec<String> {
        Vec::new()
    }

    // ---- execution ----------------------------------------------------

    fn on_resume(&mut self, actions: Vec<ResumeAction>) -> Result<StopOutcome> {
        Err(ErrorCode::Unsupported)
    }

    /// Bookkeeping for an asynchronous interrupt event. The stop reply
    /// itself is produced by the resume command that was in flight.
    fn on_interrupt(&mut self) {}

    fn on_detach(&mut self) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    /// `k`. Returns the termination outcome to report before closing.
    fn on_kill(&mut self) -> Result<StopOutcome> {
        Err(ErrorCode::Unsupported)
    }

    fn on_stop_reason(&mut self) -> Result<StopOutcome> {
        Err(ErrorCode::Unsupported)
    }

    // ---- threads ------------------------------------------------------

    fn on_thread_list(&mut self) -> Result<Vec<pid_t>> {
        Err(ErrorCode::Unsupported)
    }

    fn on_current_thread(&mut self) -> Result<pid_t> {
        Err(ErrorCode::Unsupported)
    }

    /// `Hg` (for_continue = false) and `Hc` (for_continue = true).
    fn on_select_thread(&mut self, for_continue: bool, tid: i64) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    fn on_thread_alive(&mut self, tid: pid_t) -> Result<bool> {
        Err(ErrorCode::Unsupported)
    }

    fn on_thread_extra_info(&mut self, tid: pid_t) -> Result<String> {
        Err(ErrorCode::Unsupported)
    }

    // ---- registers ----------------------------------------------------

    fn on_read_registers(&mut self, tid: Option<pid_t>) -> Result<Vec<u8>> {
        Err(ErrorCode::Unsupported)
    }

    fn on_write_registers(&mut self, tid: Option<pid_t>, data: &[u8]) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    fn on_read_register(&mut self, tid: Option<pid_t>, regno: usize) -> Result<Vec<u8>> {
        Err(ErrorCode::Unsupported)
    }

    fn on_write_register(&mut self, tid: Option<pid_t>, regno: usize, data: &[u8]) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    fn on_register_info(&mut self, regno: usize) -> Result<String> {
        Err(ErrorCode::Unsupported)
    }

    // ---- memory -------------------------------------------------------

    fn on_read_memory(&mut self, address: u64, length: usize) -> Result<Vec<u8>> {
        Err(ErrorCode::Unsupported)
    }

    fn on_write_memory(&mut self, address: u64, data: &[u8]) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    /// `_M`: permissions is a PROT_* bitmask.
    fn on_allocate_memory(&mut self, size: u64, permissions: i32) -> Result<u64> {
        Err(ErrorCode::Unsupported)
    }

    fn on_deallocate_memory(&mut self, address: u64) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    // ---- breakpoints --------------------------------------------------

    fn on_insert_breakpoint(
        &mut self,
        kind: BreakpointType,
        address: u64,
        size: usize,
    ) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    fn on_remove_breakpoint(&mut self, kind: BreakpointType, address: u64) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    // ---- queries ------------------------------------------------------

    fn on_host_info(&mut self) -> Result<String> {
        Err(ErrorCode::Unsupported)
    }

    fn on_process_info(&mut self) -> Result<String> {
        Err(ErrorCode::Unsupported)
    }

    fn on_query_module_info(&mut self, path: &str, triple: &str) -> Result<String> {
        Err(ErrorCode::Unsupported)
    }

    /// qMemoryRegionInfo: the mapping containing `address`, as key:value
    /// pairs.
    fn on_query_memory_region(&mut self, address: u64) -> Result<String> {
        Err(ErrorCode::Unsupported)
    }

    // ---- vFile --------------------------------------------------------

    fn on_file_open(&mut self, path: &str, flags: u32, mode: u32) -> Result<i32> {
        Err(ErrorCode::Unsupported)
    }

    fn on_file_close(&mut self, fd: i32) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    fn on_file_pread(&mut self, fd: i32, count: usize, offset: u64) -> Result<Vec<u8>> {
        Err(ErrorCode::Unsupported)
    }

    fn on_file_pwrite(&mut self, fd: i32, offset: u64, data: &[u8]) -> Result<usize> {
        Err(ErrorCode::Unsupported)
    }

    /// Returns the wire-encoded (big-endian fileio) stat structure.
    fn on_file_fstat(&mut self, fd: i32) -> Result<Vec<u8>> {
        Err(ErrorCode::Unsupported)
    }

    fn on_file_stat(&mut self, path: &str) -> Result<Vec<u8>> {
        Err(ErrorCode::Unsupported)
    }

    fn on_file_unlink(&mut self, path: &str) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    fn on_file_readlink(&mut self, path: &str) -> Result<String> {
        Err(ErrorCode::Unsupported)
    }

    fn on_file_mkdir(&mut self, path: &str, mode: u32) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    fn on_file_chmod(&mut self, path: &str, mode: u32) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    // ---- launch configuration -----------------------------------------

    fn on_disable_aslr(&mut self, disable: bool) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    fn on_set_std_file(&mut self, fileno: i32, path: &str) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    fn on_set_working_dir(&mut self, path: &str) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    fn on_query_working_dir(&mut self) -> Result<String> {
        Err(ErrorCode::Unsupported)
    }

    /// `value` of None unsets the variable.
    fn on_set_environment(&mut self, key: &str, value: Option<&str>) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    /// `A`: the program and argument vector; launches the inferior.
    fn on_set_arguments(&mut self, args: Vec<String>) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    fn on_query_launch_success(&mut self, pid: Option<pid_t>) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    // ---- platform -----------------------------------------------------

    fn on_launch_gdb_server(&mut self, host: &str) -> Result<(u16, pid_t)> {
        Err(ErrorCode::Unsupported)
    }

    fn on_kill_spawned_process(&mut self, pid: pid_t) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    /// qfProcessInfo / qsProcessInfo iteration.
    fn on_query_process_list(
        &mut self,
        filter: ProcessInfoMatch,
        first: bool,
    ) -> Result<ProcessInfo> {
        Err(ErrorCode::Unsupported)
    }

    /// qProcessInfoPID: direct lookup, no iteration state.
    fn on_query_process_info_pid(&mut self, pid: pid_t) -> Result<ProcessInfo> {
        Err(ErrorCode::Unsupported)
    }

    fn on_query_user_name(&mut self, uid: u32) -> Result<String> {
        Err(ErrorCode::NotFound)
    }

    fn on_query_group_name(&mut self, gid: u32) -> Result<String> {
        Err(ErrorCode::NotFound)
    }
}
