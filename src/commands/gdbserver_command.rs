use crate::channel::endpoint::{self, Endpoint, Listener, DEFAULT_HOST};
use crate::channel::Channel;
use crate::commands::StubCommand;
use crate::flags::{apply_shared_flags, GdbserverFlags};
use crate::host::{daemon, platform};
use crate::log::LogLevel::LogError;
use crate::session::debug_session::DebugSession;
use crate::session::queue_channel::QueueChannel;
use crate::session::{CompatibilityMode, Session};
use libc::pid_t;
use std::io::Write;
use std::sync::Arc;

enum ChannelKind {
    FileDescriptor(i32),
    CharacterDevice(String),
    Network(Endpoint),
}

/// The gdbserver subcommand: one debug session over one connection.
pub struct GdbserverCommand {
    flags: GdbserverFlags,
}

impl GdbserverCommand {
    pub fn new(flags: GdbserverFlags) -> GdbserverCommand {
        GdbserverCommand { flags }
    }

    fn attach_pid(&self) -> Result<Option<pid_t>, String> {
        let spec = match &self.flags.attach {
            Some(spec) => spec,
            None => return Ok(None),
        };
        if let Ok(pid) = spec.parse::<pid_t>() {
            return Ok(Some(pid));
        }
        platform::find_process_by_name(spec)
            .map(Some)
            .ok_or_else(|| format!("no process named '{}'", spec))
    }

    fn channel_kind(&self) -> Result<ChannelKind, String> {
        if let Some(fd) = self.flags.fd {
            if fd < 0 {
                return Err(format!("invalid file descriptor {}", fd));
            }
            return Ok(ChannelKind::FileDescriptor(fd));
        }
        let address = self.flags.address.clone().unwrap_or_default();
        if self.flags.named_pipe.is_some() {
            // A dynamic port, reported back through the FIFO.
            return Ok(ChannelKind::Network(Endpoint::Tcp {
                host: DEFAULT_HOST.to_owned(),
                port: 0,
            }));
        }
        if address.is_empty() {
            return Ok(ChannelKind::Network(Endpoint::Tcp {
                host: DEFAULT_HOST.to_owned(),
                port: endpoint::DEFAULT_PORT,
            }));
        }
        match Endpoint::parse(&address) {
            Ok(Endpoint::CharacterDevice { path }) => Ok(ChannelKind::CharacterDevice(path)),
            Ok(endpoint) => Ok(ChannelKind::Network(endpoint)),
            Err(_) => Err(format!("cannot parse connection argument '{}'", address)),
        }
    }

    fn open_channel(&self) -> Result<Channel, String> {
        match self.channel_kind()? {
            ChannelKind::FileDescriptor(fd) => {
                Channel::from_inherited_fd(fd).map_err(|e| format!("cannot use fd {}: {}", fd, e))
            }
            ChannelKind::CharacterDevice(path) => endpoint::open_character_device(&path)
                .map_err(|e| format!("unable to open {}: {}", path, e)),
            ChannelKind::Network(endpoint) => {
                if self.flags.reverse_connect {
                    if self.flags.shared.daemonize {
                        daemon::daemonize().map_err(|e| format!("cannot daemonize: {}", e))?;
                    }
                    return endpoint::connect(&endpoint)
                        .map_err(|e| format!("cannot connect: {}", e));
                }
                let listener = Listener::bind(&endpoint)
                    .map_err(|e| format!("cannot listen: {}", e))?;
                if let Some(port) = listener.local_port() {
                    if let Some(pipe) = &self.flags.named_pipe {
                        // NUL-terminated, as the test harnesses expect.
                        let payload = format!("{}\0", port);
                        if std::fs::write(pipe, payload.as_bytes()).is_err() {
                            log!(LogError, "unable to write port to {}", pipe);
                        }
                    }
                    if self.flags.gdb_compat {
                        // Required when gdb launches the stub itself.
                        let _ = writeln!(std::io::stderr(), "Listening on port {}", port);
                    }
                }
                if self.flags.shared.daemonize {
                    daemon::daemonize().map_err(|e| format!("cannot daemonize: {}", e))?;
                }
                listener.accept().map_err(|e| format!("accept failed: {}", e))
            }
        }
    }
}

impl StubCommand for GdbserverCommand {
    fn run(&mut self) -> i32 {
        apply_shared_flags(&self.flags.shared);

        let attach_pid = match self.attach_pid() {
            Ok(pid) => pid,
            Err(message) => {
                eprintln!("{}", message);
                return 1;
            }
        };

        if self.flags.gdb_compat && attach_pid.is_none() && self.flags.program.is_empty() {
            eprintln!("either a program or target PID is required in gdb mode");
            return 1;
        }

        let mut env: Vec<(String, Option<String>)> = Vec::new();
        for entry in &self.flags.set_env {
            match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    env.push((key.to_owned(), Some(value.to_owned())));
                }
                _ => {
                    log!(LogError, "invalid environment value '{}', skipping", entry);
                }
            }
        }
        for key in &self.flags.unset_env {
            env.push((key.clone(), None));
        }

        let channel = match self.open_channel() {
            Ok(channel) => channel,
            Err(message) => fatal!("{}", message),
        };

        let queue_channel = Arc::new(QueueChannel::new(channel));
        let delegate = if let Some(pid) = attach_pid {
            match DebugSession::attach(Arc::clone(&queue_channel), pid) {
                Ok(delegate) => delegate,
                Err(error) => fatal!("cannot attach to process {}: {}", pid, error),
            }
        } else if !self.flags.program.is_empty() {
            match DebugSession::launch(Arc::clone(&queue_channel), self.flags.program.clone(), env)
            {
                Ok(delegate) => delegate,
                Err(error) => fatal!("cannot launch {}: {}", self.flags.program[0], error),
            }
        } else {
            DebugSession::new(Arc::clone(&queue_channel))
        };

        let mode = if self.flags.gdb_compat {
            CompatibilityMode::Gdb
        } else {
            CompatibilityMode::Lldb
        };
        Session::new(queue_channel, Box::new(delegate), mode).run(true);
        0
    }
}
