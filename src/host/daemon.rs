use crate::error::{ErrorCode, Result};

/// Detach from the controlling terminal: fork (parent exits), start a new
/// session, and point the standard streams at /dev/null. Listening sockets
/// opened before the call survive it.
pub fn daemonize() -> Result<()> {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(ErrorCode::last_error());
    }
    if pid > 0 {
        unsafe { libc::_exit(0) };
    }

    if unsafe { libc::setsid() } < 0 {
        return Err(ErrorCode::last_error());
    }

    let null = unsafe { libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR) };
    if null >= 0 {
        unsafe {
            libc::dup2(null, libc::STDIN_FILENO);
            libc::dup2(null, libc::STDOUT_FILENO);
            libc::dup2(null, libc::STDERR_FILENO);
            if null > libc::STDERR_FILENO {
                libc::close(null);
            }
        }
    }
    Ok(())
}

/// Run in our own session without daemonizing (`--setsid`).
pub fn new_session() {
    unsafe {
        libc::setsid();
    }
}
