use crate::error::{ErrorCode, Result};
use crate::host::spawner::{ProcessSpawner, Redirect};
use crate::log::LogLevel::LogDebug;
use crate::target::Process;
use libc::pid_t;
use std::collections::BTreeMap;

/// Launch configuration accumulated from QSetSTDIN/OUT/ERR,
/// QSetWorkingDir, QEnvironment*, QSetDisableASLR, and finally consumed by
/// the `A` packet. The environment starts as a copy of the stub's own.
pub struct LaunchState {
    disable_aslr: bool,
    arguments: Vec<String>,
    environment: BTreeMap<String, String>,
    working_directory: String,
    std_files: [Option<String>; 3],
    last_launch_error: Option<ErrorCode>,
}

impl LaunchState {
    pub fn new() -> LaunchState {
        LaunchState {
            disable_aslr: false,
            arguments: Vec::new(),
            environment: std::env::vars().collect(),
            working_directory: String::new(),
            std_files: [None, None, None],
            last_launch_error: None,
        }
    }

    pub fn set_disable_aslr(&mut self, disable: bool) {
        self.disable_aslr = disable;
    }

    pub fn set_working_directory(&mut self, path: &str) {
        self.working_directory = path.to_owned();
    }

    pub fn working_directory(&self) -> &str {
        &self.working_directory
    }

    pub fn set_environment(&mut self, key: &str, value: Option<&str>) {
        match value {
            Some(value) => {
                self.environment.insert(key.to_owned(), value.to_owned());
            }
            None => {
                self.environment.remove(key);
            }
        }
    }

    /// QSetSTDIN is the first packet of a launch sequence; receiving it
    /// resets any state accumulated for the previous launch.
    pub fn set_std_file(&mut self, fileno: i32, path: &str) -> Result<()> {
        log!(LogDebug, "stdfile[{}] = {}", fileno, path);
        if !(0..=2).contains(&fileno) {
            return Err(ErrorCode::InvalidArgument);
        }
        if fileno == 0 {
            self.disable_aslr = false;
            self.arguments.clear();
            self.environment = std::env::vars().collect();
            self.working_directory.clear();
            self.std_files = [None, None, None];
        }
        self.std_files[fileno as usize] = Some(path.to_owned());
        Ok(())
    }

    pub fn set_arguments(&mut self, args: Vec<String>) {
        self.arguments = args;
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn last_launch_error(&self) -> Option<ErrorCode> {
        self.last_launch_error
    }

    fn configure(&self, spawner: &mut ProcessSpawner) {
        spawner
            .set_arguments(&self.arguments[1..])
            .set_environment(self.environment.clone())
            .set_working_directory(&self.working_directory);
        let redirect = |path: &Option<String>| match path {
            Some(path) if !path.is_empty() => Redirect::File(path.clone()),
            _ => Redirect::Inherit,
        };
        spawner.redirect_stdin(redirect(&self.std_files[0]));
        spawner.redirect_stdout(redirect(&self.std_files[1]));
        spawner.redirect_stderr(redirect(&self.std_files[2]));
    }

    /// Launch the configured program as a traced inferior.
    pub fn spawn_traced(&mut self) -> Result<Process> {
        if self.arguments.is_empty() {
            return Err(ErrorCode::InvalidArgument);
        }
        let mut spawner = ProcessSpawner::new(&self.arguments[0]);
        self.configure(&mut spawner);
        let result = Process::spawn(&mut spawner, self.disable_aslr);
        self.last_launch_error = result.as_ref().err().copied();
        result
    }

    /// Launch the configured program as an ordinary child (platform mode).
    pub fn spawn_plain(&mut self) -> Result<pid_t> {
        if self.arguments.is_empty() {
            return Err(ErrorCode::InvalidArgument);
        }
        let mut spawner = ProcessSpawner::new(&self.arguments[0]);
        self.configure(&mut spawner);
        let result = spawner.run();
        self.last_launch_error = result.as_ref().err().copied();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdin_resets_the_launch_state() {
        let mut launch = LaunchState::new();
        launch.set_disable_aslr(true);
        launch.set_working_directory("/tmp");
        launch.set_arguments(vec!["/bin/true".to_owned()]);
        launch.set_std_file(1, "/tmp/out").unwrap();
        launch.set_std_file(0, "/dev/null").unwrap();
        assert!(launch.arguments().is_empty());
        assert!(launch.working_directory().is_empty());
        assert!(launch.std_files[1].is_none());
        assert_eq!(launch.std_files[0].as_deref(), Some("/dev/null"));
    }

    #[test]
    fn bad_fileno_is_rejected() {
        let mut launch = LaunchState::new();
        assert_eq!(
            launch.set_std_file(3, "/dev/null"),
            Err(ErrorCode::InvalidArgument)
        );
    }

    #[test]
    fn environment_deltas_apply() {
        let mut launch = LaunchState::new();
        launch.set_environment("RVDS_TEST_KEY", Some("1"));
        assert_eq!(
            launch.environment.get("RVDS_TEST_KEY").map(String::as_str),
            Some("1")
        );
        launch.set_environment("RVDS_TEST_KEY", None);
        assert!(!launch.environment.contains_key("RVDS_TEST_KEY"));
    }

    #[test]
    fn plain_spawn_runs_the_program() {
        let mut launch = LaunchState::new();
        launch.set_arguments(vec!["/bin/true".to_owned()]);
        let pid = launch.spawn_plain().unwrap();
        assert!(pid > 0);
        assert!(launch.last_launch_error().is_none());
        let mut status = 0;
        unsafe { libc::waitpid(pid, &mut status, 0) };
    }

    #[test]
    fn empty_argument_vector_cannot_launch() {
        let mut launch = LaunchState::new();
        assert_eq!(launch.spawn_plain(), Err(ErrorCode::InvalidArgument));
        assert!(launch.spawn_traced().is_err());
    }
}
