use crate::error::{ErrorCode, Result};
use crate::host::platform::{self, ProcessInfo, ProcessInfoMatch};
use crate::host::spawner::{ProcessSpawner, Redirect};
use crate::log::LogLevel::{LogDebug, LogPacket};
use crate::session::delegate::SessionDelegate;
use crate::session::file_ops::FileOperations;
use crate::session::launch::LaunchState;
use crate::util::to_hex;
use libc::pid_t;

/// The platform-mode delegate: no inferior of its own. It lists host
/// processes, launches debug-server instances on request, and runs
/// programs for the debugger without tracing them.
pub struct PlatformSession {
    launch: LaunchState,
    files: FileOperations,
    /// Remaining pids of the current qfProcessInfo iteration.
    iteration: Vec<pid_t>,
    iteration_filter: ProcessInfoMatch,
    /// Children started on behalf of the debugger, killable via
    /// qKillSpawnedProcess.
    spawned: Vec<pid_t>,
}

impl PlatformSession {
    pub fn new() -> PlatformSession {
        PlatformSession {
            launch: LaunchState::new(),
            files: FileOperations::new(),
            iteration: Vec::new(),
            iteration_filter: ProcessInfoMatch::default(),
            spawned: Vec::new(),
        }
    }
}

/// Wire encoding of one process-list entry.
pub fn format_process_info(info: &ProcessInfo) -> String {
    format!(
        "pid:{};parent-pid:{};real-uid:{};real-gid:{};effective-uid:{};\
         effective-gid:{};name:{};triple:{};ostype:linux;endian:little;ptrsize:{};",
        info.pid,
        info.parent_pid,
        info.real_uid,
        info.real_gid,
        info.effective_uid,
        info.effective_gid,
        to_hex(info.name.as_bytes()),
        to_hex(platform::triple().as_bytes()),
        platform::pointer_size(),
    )
}

impl SessionDelegate for PlatformSession {
    fn on_host_info(&mut self) -> Result<String> {
        Ok(format!(
            "triple:{};ptrsize:{};endian:little;ostype:linux;hostname:{};",
            to_hex(platform::triple().as_bytes()),
            platform::pointer_size(),
            to_hex(platform::hostname().as_bytes()),
        ))
    }

    /// Info about the most recently launched child (launch surface).
    fn on_process_info(&mut self) -> Result<String> {
        let pid = *self.spawned.last().ok_or(ErrorCode::ProcessNotFound)?;
        let info = platform::process_info(pid)?;
        Ok(format_process_info(&info))
    }

    fn on_launch_gdb_server(&mut self, host: &str) -> Result<(u16, pid_t)> {
        log!(LogDebug, "launching debug server for host '{}'", host);
        let mut spawner = ProcessSpawner::new(&platform::self_executable_path());
        let mut args = vec!["slave".to_owned()];
        if crate::log::log_level() >= crate::log::LogLevel::LogPacket {
            args.push("--remote-debug".to_owned());
        } else if crate::log::log_level() >= crate::log::LogLevel::LogDebug {
            args.push("--debug".to_owned());
        }
        args.push("--setsid".to_owned());
        spawner
            .set_arguments(&args)
            .redirect_stdin(Redirect::Null)
            .redirect_stdout(Redirect::Capture);
        spawner.run()?;
        let status = spawner.wait()?;
        if status.exited() && status.exit_code() != 0 {
            return Err(ErrorCode::InvalidArgument);
        }
        // The slave prints "<port> <pid>" once its listener is bound and
        // the serving child is forked off.
        let output = spawner.output();
        let mut fields = output.split_whitespace();
        let port: u16 = fields
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or(ErrorCode::Unknown)?;
        let pid: pid_t = fields
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or(ErrorCode::Unknown)?;
        self.spawned.push(pid);
        log!(LogPacket, "debug server listening on port {} as {}", port, pid);
        Ok((port, pid))
    }

    fn on_kill_spawned_process(&mut self, pid: pid_t) -> Result<()> {
        let index = self
            .spawned
            .iter()
            .position(|p| *p == pid)
            .ok_or(ErrorCode::NotFound)?;
        platform::terminate_process(pid)?;
        log!(LogDebug, "killed spawned process {}", pid);
        self.spawned.remove(index);
        Ok(())
    }

    fn on_query_process_list(
        &mut self,
        filter: ProcessInfoMatch,
        first: bool,
    ) -> Result<ProcessInfo> {
        if first {
            self.iteration_filter = filter;
            self.iteration = platform::enumerate_processes();
            self.iteration.reverse();
        }
        while let Some(pid) = self.iteration.pop() {
            if let Ok(info) = platform::process_info(pid) {
                if platform::process_matches(&self.iteration_filter, &info) {
                    return Ok(info);
                }
            }
        }
        Err(ErrorCode::ProcessNotFound)
    }

    fn on_query_process_info_pid(&mut self, pid: pid_t) -> Result<ProcessInfo> {
        platform::process_info(pid)
    }

    fn on_query_user_name(&mut self, uid: u32) -> Result<String> {
        platform::user_name(uid).ok_or(ErrorCode::NotFound)
    }

    fn on_query_group_name(&mut self, gid: u32) -> Result<String> {
        platform::group_name(gid).ok_or(ErrorCode::NotFound)
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
        crate::host::file::unlink(path)
    }

    fn on_file_readlink(&mut self, path: &str) -> Result<String> {
        crate::host::file::readlink(path)
    }

    fn on_file_mkdir(&mut self, path: &str, mode: u32) -> Result<()> {
        crate::host::file::mkdir(path, mode)
    }

    fn on_file_chmod(&mut self, path: &str, mode: u32) -> Result<()> {
        crate::host::file::chmod(path, mode)
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

    /// Platform `A`: run the program untraced and remember it.
    fn on_set_arguments(&mut self, args: Vec<String>) -> Result<()> {
        self.launch.set_arguments(args);
        let pid = self.launch.spawn_plain()?;
        self.spawned.push(pid);
        Ok(())
    }

    fn on_query_launch_success(&mut self, _pid: Option<pid_t>) -> Result<()> {
        match self.launch.last_launch_error() {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_list_iteration_finds_ourselves() {
        let mut session = PlatformSession::new();
        let our_pid = unsafe { libc::getpid() };
        let filter = ProcessInfoMatch {
            pid: our_pid,
            ..Default::default()
        };
        let info = session.on_query_process_list(filter, true).unwrap();
        assert_eq!(info.pid, our_pid);
        // Only one process matches an exact pid filter.
        assert_eq!(
            session
                .on_query_process_list(ProcessInfoMatch::default(), false)
                .unwrap_err(),
            ErrorCode::ProcessNotFound
        );
    }

    #[test]
    fn pid_query_needs_no_iteration() {
        let mut session = PlatformSession::new();
        let info = session
            .on_query_process_info_pid(unsafe { libc::getpid() })
            .unwrap();
        assert!(!info.name.is_empty());
    }

    #[test]
    fn spawned_processes_are_tracked_and_killable() {
        let mut session = PlatformSession::new();
        session
            .on_set_arguments(vec!["/bin/sleep".to_owned(), "30".to_owned()])
            .unwrap();
        assert!(session.on_query_launch_success(None).is_ok());
        let pid = *session.spawned.last().unwrap();
        session.on_kill_spawned_process(pid).unwrap();
        assert!(session.spawned.is_empty());
        // Reap the zombie.
        let mut status = 0;
        unsafe { libc::waitpid(pid, &mut status, 0) };
        assert_eq!(
            session.on_kill_spawned_process(pid).unwrap_err(),
            ErrorCode::NotFound
        );
    }
}
