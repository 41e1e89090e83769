use super::Channel;
use crate::error::{ErrorCode, Result};
use crate::log::LogLevel::LogDebug;
use nix::sys::socket::{accept, bind, listen, socket, AddressFamily, SockAddr, SockFlag, SockType,
                       UnixAddr};
use nix::sys::termios::{tcgetattr, tcsetattr, ControlFlags, InputFlags, LocalFlags, OutputFlags,
                        SetArg, SpecialCharacterIndices};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::os::unix::net::UnixListener;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 12345;

/// A parsed connection argument.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix { path: String },
    UnixAbstract { name: String },
    /// No `://` and no `:` in the argument: a character device or FIFO
    /// opened directly with raw TTY settings.
    CharacterDevice { path: String },
}

impl Endpoint {
    /// Parse `tcp://[host]:port`, `unix:///path`, `unix-abstract://name`,
    /// a bare `[host]:port`, a bare port, or a device path.
    pub fn parse(arg: &str) -> Result<Endpoint> {
        let (protocol, rest) = match arg.find("://") {
            Some(at) => (&arg[..at], &arg[at + 3..]),
            None => {
                if !arg.contains(':') && !arg.chars().all(|c| c.is_ascii_digit()) {
                    return Ok(Endpoint::CharacterDevice {
                        path: arg.to_owned(),
                    });
                }
                ("tcp", arg)
            }
        };
        match protocol {
            "tcp" => {
                let (host, port) = split_host_port(rest)?;
                Ok(Endpoint::Tcp { host, port })
            }
            "unix" => Ok(Endpoint::Unix {
                path: rest.to_owned(),
            }),
            "unix-abstract" => Ok(Endpoint::UnixAbstract {
                name: rest.to_owned(),
            }),
            _ => Err(ErrorCode::InvalidArgument),
        }
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = match addr.rfind(':') {
        None => (String::new(), addr),
        Some(at) => {
            let raw_host = &addr[..at];
            // IPv6 addresses come bracketed: [a:b::1]:port.
            let host = if raw_host.starts_with('[') && raw_host.ends_with(']') {
                raw_host[1..raw_host.len() - 1].to_owned()
            } else if raw_host == "*" {
                // Listen on every interface.
                "0.0.0.0".to_owned()
            } else {
                raw_host.to_owned()
            };
            (host, &addr[at + 1..])
        }
    };
    let port = if port.is_empty() {
        DEFAULT_PORT
    } else {
        port.parse().map_err(|_| ErrorCode::InvalidArgument)?
    };
    let host = if host.is_empty() {
        DEFAULT_HOST.to_owned()
    } else {
        host
    };
    Ok((host, port))
}

/// A listening server socket of any supported family.
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
    Abstract(RawFd),
}

impl Listener {
    pub fn bind(endpoint: &Endpoint) -> Result<Listener> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port))
                    .map_err(|_| ErrorCode::last_error())?;
                log!(
                    LogDebug,
                    "listening on [{}:{}]",
                    host,
                    listener.local_addr().map(|a| a.port()).unwrap_or(*port)
                );
                Ok(Listener::Tcp(listener))
            }
            Endpoint::Unix { path } => {
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path).map_err(|_| ErrorCode::last_error())?;
                log!(LogDebug, "listening on {}", path);
                Ok(Listener::Unix(listener))
            }
            Endpoint::UnixAbstract { name } => {
                let fd = socket(
                    AddressFamily::Unix,
                    SockType::Stream,
                    SockFlag::empty(),
                    None,
                )
                .map_err(|_| ErrorCode::last_error())?;
                let addr = UnixAddr::new_abstract(name.as_bytes())
                    .map_err(|_| ErrorCode::InvalidArgument)?;
                bind(fd, &SockAddr::Unix(addr)).map_err(|_| ErrorCode::last_error())?;
                listen(fd, 1).map_err(|_| ErrorCode::last_error())?;
                log!(LogDebug, "listening on abstract socket {}", name);
                Ok(Listener::Abstract(fd))
            }
            Endpoint::CharacterDevice { .. } => Err(ErrorCode::InvalidArgument),
        }
    }

    /// The port actually bound, for `--named-pipe` and the gdb-compat
    /// startup print. Only meaningful for TCP listeners.
    pub fn local_port(&self) -> Option<u16> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok().map(|a| a.port()),
            _ => None,
        }
    }

    pub fn accept(&self) -> Result<Channel> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().map_err(|_| ErrorCode::last_error())?;
                log!(LogDebug, "client connected from {}", peer);
                Ok(Channel::from_fd(stream.into_raw_fd()))
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().map_err(|_| ErrorCode::last_error())?;
                Ok(Channel::from_fd(stream.into_raw_fd()))
            }
            Listener::Abstract(fd) => {
                let client = accept(*fd).map_err(|_| ErrorCode::last_error())?;
                Ok(Channel::from_fd(client))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Abstract(fd) = self {
            if *fd >= 0 {
                unsafe { libc::close(*fd) };
            }
        }
    }
}

/// Reverse connection: dial the debugger instead of listening.
pub fn connect(endpoint: &Endpoint) -> Result<Channel> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let addr = (host.as_str(), *port)
                .to_socket_addrs()
                .map_err(|_| ErrorCode::InvalidArgument)?
                .next()
                .ok_or(ErrorCode::InvalidArgument)?;
            let stream = TcpStream::connect(addr).map_err(|_| ErrorCode::last_error())?;
            log!(LogDebug, "connected to [{}:{}]", host, port);
            Ok(Channel::from_fd(stream.into_raw_fd()))
        }
        _ => Err(ErrorCode::Unsupported),
    }
}

/// Open a character device or FIFO and put it into raw 8-bit mode.
pub fn open_character_device(path: &str) -> Result<Channel> {
    let cpath = std::ffi::CString::new(path).map_err(|_| ErrorCode::InvalidArgument)?;
    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return Err(ErrorCode::last_error());
    }
    if let Ok(mut termios) = tcgetattr(fd) {
        termios.input_flags = InputFlags::empty();
        termios.output_flags = OutputFlags::empty();
        termios.local_flags = LocalFlags::empty();
        termios.control_flags &= !(ControlFlags::CSIZE | ControlFlags::PARENB);
        termios.control_flags |= ControlFlags::CLOCAL | ControlFlags::CS8;
        termios.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        termios.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        let _ = tcsetattr(fd, SetArg::TCSANOW, &termios);
    }
    Ok(Channel::from_fd(fd))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_variants() {
        assert_eq!(
            Endpoint::parse("tcp://localhost:5000").unwrap(),
            Endpoint::Tcp {
                host: "localhost".into(),
                port: 5000
            }
        );
        assert_eq!(
            Endpoint::parse("1234").unwrap(),
            Endpoint::Tcp {
                host: DEFAULT_HOST.into(),
                port: 1234
            }
        );
        assert_eq!(
            Endpoint::parse(":9999").unwrap(),
            Endpoint::Tcp {
                host: DEFAULT_HOST.into(),
                port: 9999
            }
        );
        assert_eq!(
            Endpoint::parse("*:17000").unwrap(),
            Endpoint::Tcp {
                host: "0.0.0.0".into(),
                port: 17000
            }
        );
    }

    #[test]
    fn parses_bracketed_ipv6() {
        assert_eq!(
            Endpoint::parse("[::1]:4000").unwrap(),
            Endpoint::Tcp {
                host: "::1".into(),
                port: 4000
            }
        );
    }

    #[test]
    fn parses_unix_and_abstract() {
        assert_eq!(
            Endpoint::parse("unix:///tmp/sock").unwrap(),
            Endpoint::Unix {
                path: "/tmp/sock".into()
            }
        );
        assert_eq!(
            Endpoint::parse("unix-abstract://stub").unwrap(),
            Endpoint::UnixAbstract {
                name: "stub".into()
            }
        );
    }

    #[test]
    fn bare_path_is_a_character_device() {
        assert_eq!(
            Endpoint::parse("/dev/ttyUSB0").unwrap(),
            Endpoint::CharacterDevice {
                path: "/dev/ttyUSB0".into()
            }
        );
    }

    #[test]
    fn tcp_listen_accept_connect() {
        let listener = Listener::bind(&Endpoint::Tcp {
            host: "127.0.0.1".into(),
            port: 0,
        })
        .unwrap();
        let port = listener.local_port().unwrap();
        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".into(),
            port,
        };
        let client = connect(&endpoint).unwrap();
        let server = listener.accept().unwrap();
        client.send(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let n = server.receive(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }
}
