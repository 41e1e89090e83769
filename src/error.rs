use std::fmt;

/// Error taxonomy shared by every layer of the stub. Native failures are
/// translated into this set at the ptrace/file boundary and travel upward
/// unchanged until the session encodes them on the wire.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    Unknown,
    Unsupported,
    NotFound,
    AlreadyExist,
    Busy,
    InvalidArgument,
    InvalidHandle,
    InvalidAddress,
    NoPermission,
    NoMemory,
    ProcessNotFound,
}

pub type Result<T> = std::result::Result<T, ErrorCode>;

impl ErrorCode {
    pub fn from_errno(errno: i32) -> ErrorCode {
        match errno {
            libc::EBUSY => ErrorCode::Busy,
            libc::ESRCH => ErrorCode::ProcessNotFound,
            libc::EFAULT | libc::EIO => ErrorCode::InvalidAddress,
            libc::EPERM | libc::EACCES => ErrorCode::NoPermission,
            libc::ENOENT => ErrorCode::NotFound,
            libc::EEXIST => ErrorCode::AlreadyExist,
            libc::ENOMEM => ErrorCode::NoMemory,
            libc::ENOSYS => ErrorCode::Unsupported,
            libc::EBADF => ErrorCode::InvalidHandle,
            _ => ErrorCode::InvalidArgument,
        }
    }

    /// Translate the calling thread's current errno.
    pub fn last_error() -> ErrorCode {
        ErrorCode::from_errno(nix::errno::errno())
    }

    /// The errno value sent back in `E<hh>` and `F-1,<hh>` replies.
    pub fn gdb_errno(self) -> u8 {
        match self {
            ErrorCode::Unknown => libc::EIO as u8,
            ErrorCode::Unsupported => libc::ENOSYS as u8,
            ErrorCode::NotFound => libc::ENOENT as u8,
            ErrorCode::AlreadyExist => libc::EEXIST as u8,
            ErrorCode::Busy => libc::EBUSY as u8,
            ErrorCode::InvalidArgument => libc::EINVAL as u8,
            ErrorCode::InvalidHandle => libc::EBADF as u8,
            ErrorCode::InvalidAddress => libc::EFAULT as u8,
            ErrorCode::NoPermission => libc::EPERM as u8,
            ErrorCode::NoMemory => libc::ENOMEM as u8,
            ErrorCode::ProcessNotFound => libc::ESRCH as u8,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorCode::Unknown => "unknown error",
            ErrorCode::Unsupported => "unsupported",
            ErrorCode::NotFound => "not found",
            ErrorCode::AlreadyExist => "already exists",
            ErrorCode::Busy => "busy",
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::InvalidHandle => "invalid handle",
            ErrorCode::InvalidAddress => "invalid address",
            ErrorCode::NoPermission => "no permission",
            ErrorCode::NoMemory => "out of memory",
            ErrorCode::ProcessNotFound => "process not found",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_translation() {
        assert_eq!(ErrorCode::from_errno(libc::EBUSY), ErrorCode::Busy);
        assert_eq!(
            ErrorCode::from_errno(libc::ESRCH),
            ErrorCode::ProcessNotFound
        );
        assert_eq!(
            ErrorCode::from_errno(libc::EFAULT),
            ErrorCode::InvalidAddress
        );
        assert_eq!(ErrorCode::from_errno(libc::EIO), ErrorCode::InvalidAddress);
        assert_eq!(ErrorCode::from_errno(libc::EPERM), ErrorCode::NoPermission);
        // Anything unrecognized degrades to InvalidArgument.
        assert_eq!(
            ErrorCode::from_errno(libc::EXDEV),
            ErrorCode::InvalidArgument
        );
    }

    #[test]
    fn gdb_errno_is_stable() {
        assert_eq!(ErrorCode::InvalidArgument.gdb_errno(), 22);
        assert_eq!(ErrorCode::ProcessNotFound.gdb_errno(), 3);
        assert_eq!(ErrorCode::NoPermission.gdb_errno(), 1);
    }
}
