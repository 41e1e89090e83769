use crate::error::{ErrorCode, Result};
use libc::pid_t;
use std::ffi::CStr;
use std::fs;

/// What the platform session reports about a host process.
#[derive(Clone, Debug, Default)]
pub struct ProcessInfo {
    pub pid: pid_t,
    pub parent_pid: pid_t,
    pub name: String,
    pub real_uid: u32,
    pub real_gid: u32,
    pub effective_uid: u32,
    pub effective_gid: u32,
}

/// Filter criteria from a qfProcessInfo request.
#[derive(Clone, Debug, Default)]
pub struct ProcessInfoMatch {
    pub name: String,
    /// equals / starts_with / ends_with / contains.
    pub name_match: String,
    pub pid: pid_t,
    pub parent_pid: pid_t,
    pub real_uid: Option<u32>,
    pub real_gid: Option<u32>,
    pub effective_uid: Option<u32>,
    pub effective_gid: Option<u32>,
}

/// Enumerate the numeric entries of /proc.
pub fn enumerate_processes() -> Vec<pid_t> {
    let mut pids = Vec::new();
    if let Ok(entries) = fs::read_dir("/proc") {
        for entry in entries.flatten() {
            if let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<pid_t>().ok())
            {
                pids.push(pid);
            }
        }
    }
    pids.sort_unstable();
    pids
}

pub fn process_info(pid: pid_t) -> Result<ProcessInfo> {
    let status =
        fs::read_to_string(format!("/proc/{}/status", pid)).map_err(|_| ErrorCode::ProcessNotFound)?;
    let mut info = ProcessInfo {
        pid,
        ..Default::default()
    };
    for line in status.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("PPid:") => {
                info.parent_pid = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            }
            Some("Uid:") => {
                info.real_uid = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                info.effective_uid = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            }
            Some("Gid:") => {
                info.real_gid = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                info.effective_gid = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            }
            _ => {}
        }
    }
    // Prefer the executable path; fall back to the comm name.
    info.name = fs::read_link(format!("/proc/{}/exe", pid))
        .ok()
        .and_then(|p| p.to_str().map(str::to_owned))
        .or_else(|| {
            fs::read_to_string(format!("/proc/{}/comm", pid))
                .ok()
                .map(|s| s.trim_end().to_owned())
        })
        .unwrap_or_default();
    Ok(info)
}

fn name_matches(wanted: &str, kind: &str, name: &str) -> bool {
    match kind {
        "equals" | "" => name == wanted,
        "starts_with" => name.starts_with(wanted),
        "ends_with" => name.ends_with(wanted),
        "contains" => name.contains(wanted),
        _ => true,
    }
}

/// Does `info` satisfy the match block? Name matching also tries the last
/// path component, since /proc exe paths are absolute.
pub fn process_matches(filter: &ProcessInfoMatch, info: &ProcessInfo) -> bool {
    if !filter.name.is_empty() {
        let basename = info.name.rsplit('/').next().unwrap_or(&info.name);
        if !name_matches(&filter.name, &filter.name_match, &info.name)
            && !name_matches(&filter.name, &filter.name_match, basename)
        {
            return false;
        }
    }
    if filter.pid != 0 && info.pid != filter.pid {
        return false;
    }
    if filter.parent_pid != 0 && info.parent_pid != filter.parent_pid {
        return false;
    }
    if filter.real_uid.map_or(false, |uid| info.real_uid != uid) {
        return false;
    }
    if filter.real_gid.map_or(false, |gid| info.real_gid != gid) {
        return false;
    }
    if filter
        .effective_uid
        .map_or(false, |uid| info.effective_uid != uid)
    {
        return false;
    }
    if filter
        .effective_gid
        .map_or(false, |gid| info.effective_gid != gid)
    {
        return false;
    }
    true
}

/// One line of /proc/pid/maps, as qMemoryRegionInfo wants it.
#[derive(Clone, Debug)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub name: Option<String>,
}

/// The mapping containing `address`, if any.
pub fn memory_region(pid: pid_t, address: u64) -> Result<MemoryRegion> {
    let maps =
        fs::read_to_string(format!("/proc/{}/maps", pid)).map_err(|_| ErrorCode::ProcessNotFound)?;
    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let range = fields.next().unwrap_or("");
        let perms = fields.next().unwrap_or("");
        let name = line.splitn(6, ' ').nth(5).map(|n| n.trim().to_owned());
        let mut bounds = range.splitn(2, '-');
        let start = u64::from_str_radix(bounds.next().unwrap_or(""), 16);
        let end = u64::from_str_radix(bounds.next().unwrap_or(""), 16);
        if let (Ok(start), Ok(end)) = (start, end) {
            if address >= start && address < end {
                return Ok(MemoryRegion {
                    start,
                    end,
                    readable: perms.contains('r'),
                    writable: perms.contains('w'),
                    executable: perms.contains('x'),
                    name: name.filter(|n| !n.is_empty()),
                });
            }
        }
    }
    Err(ErrorCode::NotFound)
}

/// The comm name of one thread of a process.
pub fn thread_name(pid: pid_t, tid: pid_t) -> Option<String> {
    fs::read_to_string(format!("/proc/{}/task/{}/comm", pid, tid))
        .ok()
        .map(|s| s.trim_end().to_owned())
}

/// Find a process whose name (or basename) equals `name`.
pub fn find_process_by_name(name: &str) -> Option<pid_t> {
    for pid in enumerate_processes() {
        if let Ok(info) = process_info(pid) {
            let basename = info.name.rsplit('/').next().unwrap_or(&info.name);
            if info.name == name || basename == name {
                return Some(pid);
            }
        }
    }
    None
}

pub fn terminate_process(pid: pid_t) -> Result<()> {
    if unsafe { libc::kill(pid, libc::SIGKILL) } != 0 {
        return Err(ErrorCode::last_error());
    }
    Ok(())
}

pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return String::new();
    }
    unsafe { CStr::from_ptr(buf.as_ptr() as *const libc::c_char) }
        .to_string_lossy()
        .into_owned()
}

pub fn user_name(uid: u32) -> Option<String> {
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0u8; 1024];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwuid_r(
            uid,
            &mut pwd,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    Some(
        unsafe { CStr::from_ptr(pwd.pw_name) }
            .to_string_lossy()
            .into_owned(),
    )
}

pub fn group_name(gid: u32) -> Option<String> {
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut buf = vec![0u8; 1024];
    let mut result: *mut libc::group = std::ptr::null_mut();
    let rc = unsafe {
        libc::getgrgid_r(
            gid,
            &mut grp,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    Some(
        unsafe { CStr::from_ptr(grp.gr_name) }
            .to_string_lossy()
            .into_owned(),
    )
}

pub fn self_executable_path() -> String {
    fs::read_link("/proc/self/exe")
        .ok()
        .and_then(|p| p.to_str().map(str::to_owned))
        .unwrap_or_default()
}

/// Target triple advertised in qHostInfo/qProcessInfo.
pub fn triple() -> &'static str {
    if cfg!(target_arch = "riscv64") {
        "riscv64-unknown-linux-gnu"
    } else if cfg!(target_arch = "x86_64") {
        "x86_64-unknown-linux-gnu"
    } else if cfg!(target_arch = "aarch64") {
        "aarch64-unknown-linux-gnu"
    } else {
        "unknown-unknown-linux-gnu"
    }
}

pub fn pointer_size() -> usize {
    std::mem::size_of::<usize>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn our_own_process_is_enumerable() {
        let pid = unsafe { libc::getpid() };
        assert!(enumerate_processes().contains(&pid));
        let info = process_info(pid).unwrap();
        assert_eq!(info.pid, pid);
        assert!(!info.name.is_empty());
        assert_eq!(info.real_uid, unsafe { libc::getuid() });
    }

    #[test]
    fn match_filters_apply() {
        let info = ProcessInfo {
            pid: 10,
            parent_pid: 1,
            name: "/usr/bin/target".to_owned(),
            ..Default::default()
        };
        let mut filter = ProcessInfoMatch::default();
        assert!(process_matches(&filter, &info));
        filter.name = "target".to_owned();
        filter.name_match = "equals".to_owned();
        assert!(process_matches(&filter, &info));
        filter.name = "tar".to_owned();
        assert!(!process_matches(&filter, &info));
        filter.name_match = "starts_with".to_owned();
        assert!(process_matches(&filter, &info));
        filter.pid = 11;
        assert!(!process_matches(&filter, &info));
    }

    #[test]
    fn root_user_resolves() {
        assert_eq!(user_name(0).as_deref(), Some("root"));
        assert!(group_name(0).is_some());
    }
}
