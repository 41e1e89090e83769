use crate::channel::endpoint::{Endpoint, Listener};
use crate::commands::StubCommand;
use crate::flags::{apply_shared_flags, PlatformFlags};
use crate::host::daemon;
use crate::log::LogLevel::LogDebug;
use crate::session::platform_session::PlatformSession;
use crate::session::queue_channel::QueueChannel;
use crate::session::{CompatibilityMode, Session};
use std::sync::Arc;
use std::thread;

/// The platform subcommand: accept debugger connections forever, one
/// session thread per client, each with its own delegate state.
pub struct PlatformCommand {
    flags: PlatformFlags,
}

impl PlatformCommand {
    pub fn new(flags: PlatformFlags) -> PlatformCommand {
        PlatformCommand { flags }
    }
}

impl StubCommand for PlatformCommand {
    fn run(&mut self) -> i32 {
        apply_shared_flags(&self.flags.shared);

        let endpoint = match Endpoint::parse(&self.flags.listen) {
            Ok(endpoint) => endpoint,
            Err(_) => {
                eprintln!("cannot parse listen argument '{}'", self.flags.listen);
                return 1;
            }
        };
        let listener = match Listener::bind(&endpoint) {
            Ok(listener) => listener,
            Err(error) => {
                eprintln!("cannot listen on {}: {}", self.flags.listen, error);
                return 1;
            }
        };

        if self.flags.shared.daemonize {
            if daemon::daemonize().is_err() {
                eprintln!("cannot daemonize");
                return 1;
            }
        }

        loop {
            let channel = match listener.accept() {
                Ok(channel) => channel,
                Err(error) => {
                    log!(LogDebug, "accept failed: {}", error);
                    continue;
                }
            };
            thread::spawn(move || {
                // Platform sessions drive no inferior: the channel hands
                // over raw bytes and the session does its own framing.
                let queue_channel = Arc::new(QueueChannel::new_raw(channel));
                let delegate = PlatformSession::new();
                Session::new(queue_channel, Box::new(delegate), CompatibilityMode::Lldb)
                    .run(false);
            });
        }
    }
}
