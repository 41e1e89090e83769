use crate::error::{ErrorCode, Result};
use crate::host::file::{self, HostFile, OpenFlags};
use std::collections::HashMap;

/// The per-session table of host files opened on behalf of the debugger,
/// keyed by opaque integer ids handed out in vFile:open replies.
pub struct FileOperations {
    files: HashMap<i32, HostFile>,
    next_fd: i32,
}

impl FileOperations {
    pub fn new() -> FileOperations {
        FileOperations {
            files: HashMap::new(),
            next_fd: 0,
        }
    }

    pub fn open(&mut self, path: &str, flags: u32, mode: u32) -> Result<i32> {
        let flags = OpenFlags::from_bits_truncate(flags);
        let file = HostFile::open(path, flags, mode)?;
        let fd = self.next_fd;
        self.next_fd += 1;
        self.files.insert(fd, file);
        Ok(fd)
    }

    pub fn close(&mut self, fd: i32) -> Result<()> {
        self.files
            .remove(&fd)
            .map(|_| ())
            .ok_or(ErrorCode::InvalidHandle)
    }

    pub fn pread(&mut self, fd: i32, count: usize, offset: u64) -> Result<Vec<u8>> {
        self.files
            .get(&fd)
            .ok_or(ErrorCode::InvalidHandle)?
            .pread(count, offset)
    }

    pub fn pwrite(&mut self, fd: i32, offset: u64, data: &[u8]) -> Result<usize> {
        self.files
            .get(&fd)
            .ok_or(ErrorCode::InvalidHandle)?
            .pwrite(data, offset)
    }

    pub fn fstat(&mut self, fd: i32) -> Result<Vec<u8>> {
        let st = self
            .files
            .get(&fd)
            .ok_or(ErrorCode::InvalidHandle)?
            .fstat()?;
        Ok(encode_stat(&st))
    }

    pub fn stat(&mut self, path: &str) -> Result<Vec<u8>> {
        Ok(encode_stat(&file::stat(path)?))
    }
}

/// Serialize a host stat into the fileio wire structure: seven u32 fields,
/// three u64 fields, three u32 timestamps, all big-endian.
pub fn encode_stat(st: &libc::stat64) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    for value in &[
        st.st_dev as u32,
        st.st_ino as u32,
        st.st_mode as u32,
        st.st_nlink as u32,
        st.st_uid,
        st.st_gid,
        st.st_rdev as u32,
    ] {
        out.extend_from_slice(&value.to_be_bytes());
    }
    for value in &[st.st_size as u64, st.st_blksize as u64, st.st_blocks as u64] {
        out.extend_from_slice(&value.to_be_bytes());
    }
    for value in &[st.st_atime as u32, st.st_mtime as u32, st.st_ctime as u32] {
        out.extend_from_slice(&value.to_be_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_read_write_close_cycle() {
        let path = format!("/tmp/rvds-fileops-test-{}", unsafe { libc::getpid() });
        let mut ops = FileOperations::new();
        // Flags: write|creat|trunc in fileio encoding.
        let fd = ops.open(&path, 0x002 | 0x200 | 0x400, 0o644).unwrap();
        assert_eq!(ops.pwrite(fd, 0, b"abcdef").unwrap(), 6);
        ops.close(fd).unwrap();

        let fd = ops.open(&path, 0x001, 0).unwrap();
        assert_eq!(ops.pread(fd, 3, 2).unwrap(), b"cde".to_vec());
        let stat = ops.fstat(fd).unwrap();
        assert_eq!(stat.len(), 64);
        // st_size lives at offset 28, big-endian.
        assert_eq!(&stat[28..36], &6u64.to_be_bytes());
        ops.close(fd).unwrap();
        assert_eq!(ops.close(fd), Err(ErrorCode::InvalidHandle));
        file::unlink(&path).unwrap();
    }

    #[test]
    fn ids_are_not_reused() {
        let mut ops = FileOperations::new();
        let a = ops.open("/proc/self/status", 0x001, 0).unwrap();
        ops.close(a).unwrap();
        let b = ops.open("/proc/self/status", 0x001, 0).unwrap();
        assert_ne!(a, b);
    }
}
