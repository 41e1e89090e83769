use structopt::StructOpt;

/// Options every subcommand accepts.
#[derive(Clone, Debug, StructOpt)]
pub struct SharedFlags {
    /// Output log messages to the file specified.
    #[structopt(long = "log-file", short = "o")]
    pub log_file: Option<String>,

    /// Enable debug log output.
    #[structopt(long = "debug", short = "d")]
    pub debug: bool,

    /// Enable log for remote protocol packets.
    #[structopt(long = "remote-debug", short = "D")]
    pub remote_debug: bool,

    /// Disable colored output.
    #[structopt(long = "no-colors", short = "n")]
    pub no_colors: bool,

    /// Detach and become a daemon.
    #[structopt(long = "daemonize", short = "f")]
    pub daemonize: bool,

    /// Run in our own session.
    #[structopt(long = "setsid", short = "S")]
    pub setsid: bool,
}

#[derive(Clone, Debug, StructOpt)]
#[structopt(name = "rvds gdbserver", about = "serve one inferior to a debugger")]
pub struct GdbserverFlags {
    #[structopt(flatten)]
    pub shared: SharedFlags,

    /// Add an element to the environment before launch (KEY=VALUE).
    #[structopt(long = "set-env", short = "e", number_of_values = 1)]
    pub set_env: Vec<String>,

    /// Remove an element from the environment before launch.
    #[structopt(long = "unset-env", short = "E", number_of_values = 1)]
    pub unset_env: Vec<String>,

    /// Attach to the name or PID specified.
    #[structopt(long = "attach", short = "a")]
    pub attach: Option<String>,

    /// Run in gdb compatibility mode.
    #[structopt(long = "gdb-compat", short = "g")]
    pub gdb_compat: bool,

    /// Determine a port dynamically and write it back to the FIFO.
    #[structopt(long = "named-pipe", short = "N")]
    pub named_pipe: Option<String>,

    /// Connect back to the debugger at [HOST]:PORT.
    #[structopt(long = "reverse-connect", short = "R")]
    pub reverse_connect: bool,

    /// Use a file descriptor to communicate.
    #[structopt(long = "fd", short = "F")]
    pub fd: Option<i32>,

    /// Exit after one execution of the inferior (default).
    #[structopt(long = "once", short = "O")]
    pub once: bool,

    /// The [host]:port to listen on, or a character device path.
    pub address: Option<String>,

    /// The program to debug and its arguments.
    pub program: Vec<String>,
}

#[derive(Clone, Debug, StructOpt)]
#[structopt(name = "rvds platform", about = "serve platform requests")]
pub struct PlatformFlags {
    #[structopt(flatten)]
    pub shared: SharedFlags,

    /// The [host]:port to listen on.
    #[structopt(long = "listen", short = "l")]
    pub listen: String,

    /// Create a new session for each client (default).
    #[structopt(long = "server", short = "s")]
    pub server: bool,
}

#[derive(Clone, Debug, StructOpt)]
#[structopt(name = "rvds slave", about = "spawned debug server instance")]
pub struct SlaveFlags {
    #[structopt(flatten)]
    pub shared: SharedFlags,
}

/// Apply the shared flags to the process-wide logging state and session
/// placement.
pub fn apply_shared_flags(flags: &SharedFlags) {
    use crate::log::LogLevel::{LogDebug, LogPacket};
    if let Some(path) = &flags.log_file {
        if crate::log::set_log_file(path).is_err() {
            eprintln!("cannot open log file {}", path);
        }
        crate::log::set_log_level(LogDebug);
    }
    if flags.remote_debug {
        crate::log::set_log_level(LogPacket);
    } else if flags.debug {
        crate::log::set_log_level(LogDebug);
    }
    if flags.no_colors {
        crate::log::set_log_colors(false);
    }
    if flags.setsid {
        crate::host::daemon::new_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gdbserver_flags_parse() {
        let flags = GdbserverFlags::from_iter(&[
            "rvds",
            "--attach",
            "1234",
            "-e",
            "A=1",
            "-e",
            "B=2",
            "-E",
            "HOME",
            "--gdb-compat",
            "localhost:5000",
        ]);
        assert_eq!(flags.attach.as_deref(), Some("1234"));
        assert_eq!(flags.set_env, vec!["A=1".to_owned(), "B=2".to_owned()]);
        assert_eq!(flags.unset_env, vec!["HOME".to_owned()]);
        assert!(flags.gdb_compat);
        assert_eq!(flags.address.as_deref(), Some("localhost:5000"));
        assert!(flags.program.is_empty());
    }

    #[test]
    fn positional_program_follows_the_address() {
        let flags = GdbserverFlags::from_iter(&["rvds", ":0", "/bin/cat", "/etc/hostname"]);
        assert_eq!(flags.address.as_deref(), Some(":0"));
        assert_eq!(
            flags.program,
            vec!["/bin/cat".to_owned(), "/etc/hostname".to_owned()]
        );
    }

    #[test]
    fn platform_requires_listen() {
        assert!(PlatformFlags::from_iter_safe(&["rvds"]).is_err());
        let flags = PlatformFlags::from_iter(&["rvds", "--listen", "*:16000"]);
        assert_eq!(flags.listen, "*:16000");
    }
}
