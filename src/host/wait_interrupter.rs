use crate::error::{ErrorCode, Result};
use crate::log::LogLevel::LogDebug;
use crate::wait_status::WaitStatus;
use libc::pid_t;
use std::sync::Mutex;

/// Unblocks a waitpid that will otherwise never return.
///
/// When every thread of the inferior is already stopped, a SIGSTOP sent in
/// response to an interrupt packet changes nothing and the server thread
/// stays parked in wait. Arming the latch forks a child that exits
/// immediately; its exit event is what wakes the waiter. `check_interrupt`
/// run against each wait result identifies and consumes that event.
///
/// At most one interrupt is in flight: arming while armed is a no-op.
pub struct WaitInterrupter {
    // 0 while the slot is empty.
    pid: Mutex<pid_t>,
}

impl WaitInterrupter {
    pub fn new() -> WaitInterrupter {
        WaitInterrupter { pid: Mutex::new(0) }
    }

    pub fn send_interrupt(&self) -> Result<()> {
        let mut slot = self.pid.lock().unwrap();
        if *slot > 0 {
            return Ok(());
        }

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(ErrorCode::last_error());
        }
        if pid == 0 {
            // Exiting wakes the waiting parent with a WIFEXITED status.
            // Nothing else may run here: the child shares the parent's
            // lock state.
            unsafe { libc::_exit(0) };
        }

        log!(LogDebug, "forked process {} to interrupt waiter", pid);
        *slot = pid;
        Ok(())
    }

    /// True iff this wait result is the armed child's clean exit. The slot
    /// is cleared in that case, so each arm pairs with at most one check.
    pub fn check_interrupt(&self, tid: pid_t, status: WaitStatus) -> bool {
        {
            let mut slot = self.pid.lock().unwrap();
            if *slot <= 0 {
                return false;
            }
            if *slot != tid || !status.exited() {
                return false;
            }
            *slot = 0;
        }
        log!(LogDebug, "received interrupt from process {}", tid);
        true
    }

    /// Reap and discard an armed interrupt whose wait event was never (or
    /// already) consumed, so a stale arm cannot fake a future interrupt.
    pub fn drain(&self) {
        let mut slot = self.pid.lock().unwrap();
        if *slot > 0 {
            let mut raw = 0;
            unsafe { libc::waitpid(*slot, &mut raw, 0) };
            *slot = 0;
        }
    }

    #[cfg(test)]
    fn armed_pid(&self) -> pid_t {
        *self.pid.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unarmed_latch_matches_nothing() {
        let latch = WaitInterrupter::new();
        assert!(!latch.check_interrupt(1234, WaitStatus::new(0)));
    }

    #[test]
    fn interrupt_pairs_with_exactly_one_check() {
        let latch = WaitInterrupter::new();
        latch.send_interrupt().unwrap();
        let child = latch.armed_pid();
        assert!(child > 0);

        let mut raw = 0;
        let waited = unsafe { libc::waitpid(child, &mut raw, 0) };
        assert_eq!(waited, child);
        let status = WaitStatus::new(raw);
        assert!(status.exited());

        assert!(latch.check_interrupt(child, status));
        // The slot is clear; the same event does not match twice.
        assert!(!latch.check_interrupt(child, status));
    }

    #[test]
    fn foreign_events_do_not_consume_the_slot() {
        let latch = WaitInterrupter::new();
        latch.send_interrupt().unwrap();
        let child = latch.armed_pid();

        // A stop event for some other thread is not the interrupt.
        let stop = WaitStatus::new((libc::SIGTRAP << 8) | 0x7f);
        assert!(!latch.check_interrupt(child + 1, WaitStatus::new(0)));
        assert!(!latch.check_interrupt(child, stop));

        // The real exit still matches afterwards.
        let mut raw = 0;
        unsafe { libc::waitpid(child, &mut raw, 0) };
        assert!(latch.check_interrupt(child, WaitStatus::new(raw)));
    }

    #[test]
    fn second_arm_is_a_no_op() {
        let latch = WaitInterrupter::new();
        latch.send_interrupt().unwrap();
        let first = latch.armed_pid();
        latch.send_interrupt().unwrap();
        assert_eq!(latch.armed_pid(), first);

        let mut raw = 0;
        unsafe { libc::waitpid(first, &mut raw, 0) };
        assert!(latch.check_interrupt(first, WaitStatus::new(raw)));
    }
}
