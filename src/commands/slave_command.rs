use crate::channel::endpoint::{Endpoint, Listener, DEFAULT_HOST};
use crate::commands::StubCommand;
use crate::flags::{apply_shared_flags, SlaveFlags};
use crate::session::debug_session::DebugSession;
use crate::session::queue_channel::QueueChannel;
use crate::session::{CompatibilityMode, Session};
use std::sync::Arc;

/// The slave subcommand, spawned by a platform session's qLaunchGDBServer:
/// bind a dynamic port, fork off the serving child, and report
/// "<port> <pid>" on stdout so the platform can relay them.
pub struct SlaveCommand {
    flags: SlaveFlags,
}

impl SlaveCommand {
    pub fn new(flags: SlaveFlags) -> SlaveCommand {
        SlaveCommand { flags }
    }
}

impl StubCommand for SlaveCommand {
    fn run(&mut self) -> i32 {
        apply_shared_flags(&self.flags.shared);

        let listener = match Listener::bind(&Endpoint::Tcp {
            host: DEFAULT_HOST.to_owned(),
            port: 0,
        }) {
            Ok(listener) => listener,
            Err(error) => {
                eprintln!("cannot bind dynamic port: {}", error);
                return 1;
            }
        };
        let port = match listener.local_port() {
            Some(port) => port,
            None => {
                eprintln!("cannot determine bound port");
                return 1;
            }
        };

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            eprintln!("cannot fork debug server");
            return 1;
        }
        if pid > 0 {
            // Parent: report and exit so the spawning platform session can
            // collect the output without waiting for the session to end.
            println!("{} {}", port, pid);
            return 0;
        }

        // The serving child inherited the parent's stdout, which may be the
        // platform session's capture pipe; holding it open would stall the
        // platform's read. Point it at /dev/null.
        unsafe {
            let null =
                libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR);
            if null >= 0 {
                libc::dup2(null, libc::STDOUT_FILENO);
                if null > libc::STDERR_FILENO {
                    libc::close(null);
                }
            }
        }

        match listener.accept() {
            Ok(channel) => {
                let queue_channel = Arc::new(QueueChannel::new(channel));
                let delegate = DebugSession::new(Arc::clone(&queue_channel));
                Session::new(queue_channel, Box::new(delegate), CompatibilityMode::Lldb).run(true);
                0
            }
            Err(error) => {
                eprintln!("accept failed: {}", error);
                1
            }
        }
    }
}
