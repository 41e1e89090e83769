//! Process-model smoke test against a real traced child. Kept as a single
//! test: the wait machinery reaps with waitpid(-1), which must not race
//! with other tests' children in this binary.
//!
//! Architecture-specific paths (breakpoints, stepping, injected syscalls)
//! are exercised by unit tests against a fake inferior; here we drive the
//! arch-neutral lifecycle: spawn, initial stop, memory access, resume,
//! terminate, and detach.

use rvds::host::spawner::{ProcessSpawner, Redirect};
use rvds::target::{Process, ResumeAction, ResumeKind, StopEvent};

fn spawn_sleeper() -> Process {
    let mut spawner = ProcessSpawner::new("/bin/sleep");
    spawner
        .set_arguments(&["30".to_owned()])
        .redirect_stdin(Redirect::Null);
    Process::spawn(&mut spawner, false).expect("spawn traced sleeper")
}

#[test]
fn spawn_control_terminate_detach() {
    // --- spawn + initial state ---
    let mut process = spawn_sleeper();
    let pid = process.pid();
    assert!(pid > 0);
    assert!(process.is_alive());
    assert!(!process.is_attached());
    assert_eq!(process.thread_ids(), vec![pid]);
    assert_eq!(process.current_thread(), pid);
    assert!(!process.has_running_threads());

    // --- memory access through the spliced path ---
    let region = rvds::host::platform::memory_region(pid, 0).err();
    assert!(region.is_some(), "address 0 must not be mapped");
    let maps = std::fs::read_to_string(format!("/proc/{}/maps", pid)).unwrap();
    let first = maps.lines().next().unwrap();
    let start = u64::from_str_radix(first.split('-').next().unwrap(), 16).unwrap();
    let mut buf = [0u8; 16];
    process.read_memory(start, &mut buf).expect("read mapped memory");

    let info = rvds::host::platform::memory_region(pid, start).unwrap();
    assert!(info.start <= start && start < info.end);

    // --- resume, then terminate while running ---
    process
        .resume(&[ResumeAction {
            kind: ResumeKind::Continue,
            tid: None,
            signal: None,
        }])
        .expect("continue all threads");
    assert!(process.has_running_threads());
    match process.terminate().expect("terminate") {
        StopEvent::Killed { signal } => assert_eq!(signal, libc::SIGKILL),
        other => panic!("expected SIGKILL termination, got {:?}", other),
    }

    // --- detach leaves the child running ---
    let mut process = spawn_sleeper();
    let pid = process.pid();
    process.detach().expect("detach");
    assert_eq!(unsafe { libc::kill(pid, 0) }, 0, "child should survive detach");
    unsafe {
        libc::kill(pid, libc::SIGKILL);
        let mut status = 0;
        libc::waitpid(pid, &mut status, 0);
    }
}
