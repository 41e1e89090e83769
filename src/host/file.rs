use crate::error::{ErrorCode, Result};
use crate::scoped_fd::ScopedFd;
use bitflags::bitflags;
use std::ffi::CString;
use std::mem;

bitflags! {
    /// Open flags as they travel in vFile:open packets (GDB fileio
    /// encoding, not the host's O_* values).
    pub struct OpenFlags: u32 {
        const READ = 0x001;
        const WRITE = 0x002;
        const APPEND = 0x008;
        const CREAT = 0x200;
        const TRUNC = 0x400;
        const EXCL = 0x800;
    }
}

fn host_flags(flags: OpenFlags) -> i32 {
    let mut out = match (
        flags.contains(OpenFlags::READ),
        flags.contains(OpenFlags::WRITE),
    ) {
        (true, true) => libc::O_RDWR,
        (false, true) => libc::O_WRONLY,
        _ => libc::O_RDONLY,
    };
    if flags.contains(OpenFlags::APPEND) {
        out |= libc::O_APPEND;
    }
    if flags.contains(OpenFlags::CREAT) {
        out |= libc::O_CREAT;
    }
    if flags.contains(OpenFlags::TRUNC) {
        out |= libc::O_TRUNC;
    }
    if flags.contains(OpenFlags::EXCL) {
        out |= libc::O_EXCL;
    }
    out
}

fn cpath(path: &str) -> Result<CString> {
    CString::new(path).map_err(|_| ErrorCode::InvalidArgument)
}

/// An open host file serving vFile requests.
#[derive(Debug)]
pub struct HostFile {
    fd: ScopedFd,
}

impl HostFile {
    pub fn open(path: &str, flags: OpenFlags, mode: u32) -> Result<HostFile> {
        let cpath = cpath(path)?;
        let fd = unsafe { libc::open(cpath.as_ptr(), host_flags(flags), mode as libc::c_uint) };
        if fd < 0 {
            return Err(ErrorCode::last_error());
        }
        Ok(HostFile {
            fd: ScopedFd::from_raw(fd),
        })
    }

    pub fn pread(&self, count: usize, offset: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; count];
        let n = unsafe {
            libc::pread64(
                self.fd.as_raw(),
                buf.as_mut_ptr() as *mut libc::c_void,
                count,
                offset as libc::off64_t,
            )
        };
        if n < 0 {
            return Err(ErrorCode::last_error());
        }
        buf.truncate(n as usize);
        Ok(buf)
    }

    pub fn pwrite(&self, data: &[u8], offset: u64) -> Result<usize> {
        let n = unsafe {
            libc::pwrite64(
                self.fd.as_raw(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
                offset as libc::off64_t,
            )
        };
        if n < 0 {
            return Err(ErrorCode::last_error());
        }
        Ok(n as usize)
    }

    pub fn fstat(&self) -> Result<libc::stat64> {
        let mut st: libc::stat64 = unsafe { mem::zeroed() };
        if unsafe { libc::fstat64(self.fd.as_raw(), &mut st) } != 0 {
            return Err(ErrorCode::last_error());
        }
        Ok(st)
    }
}

pub fn stat(path: &str) -> Result<libc::stat64> {
    let cpath = cpath(path)?;
    let mut st: libc::stat64 = unsafe { mem::zeroed() };
    if unsafe { libc::stat64(cpath.as_ptr(), &mut st) } != 0 {
        return Err(ErrorCode::last_error());
    }
    Ok(st)
}

pub fn unlink(path: &str) -> Result<()> {
    let cpath = cpath(path)?;
    if unsafe { libc::unlink(cpath.as_ptr()) } != 0 {
        return Err(ErrorCode::last_error());
    }
    Ok(())
}

pub fn readlink(path: &str) -> Result<String> {
    let cpath = cpath(path)?;
    let mut buf = vec![0u8; libc::PATH_MAX as usize];
    let n = unsafe {
        libc::readlink(
            cpath.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
        )
    };
    if n < 0 {
        return Err(ErrorCode::last_error());
    }
    buf.truncate(n as usize);
    String::from_utf8(buf).map_err(|_| ErrorCode::InvalidArgument)
}

pub fn mkdir(path: &str, mode: u32) -> Result<()> {
    let cpath = cpath(path)?;
    if unsafe { libc::mkdir(cpath.as_ptr(), mode as libc::mode_t) } != 0 {
        return Err(ErrorCode::last_error());
    }
    Ok(())
}

pub fn chmod(path: &str, mode: u32) -> Result<()> {
    let cpath = cpath(path)?;
    if unsafe { libc::chmod(cpath.as_ptr(), mode as libc::mode_t) } != 0 {
        return Err(ErrorCode::last_error());
    }
    Ok(())
}

pub fn file_size(path: &str) -> Result<u64> {
    Ok(stat(path)?.st_size as u64)
}

pub fn exists(path: &str) -> bool {
    stat(path).is_ok()
}
