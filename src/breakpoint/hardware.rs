use super::{InferiorMemory, Lifetime, Mode, SiteTable};
use crate::error::{ErrorCode, Result};

/// Hardware breakpoints and watchpoints are driven through a small bank of
/// debug registers indexed 0..max. RISC-V Linux exposes no portable
/// interface for programming them, so every operation reports Unsupported;
/// the bank bookkeeping stays so the session can answer capability queries.
pub struct HardwareBreakpointManager {
    table: SiteTable,
    max_watchpoints: usize,
}

impl HardwareBreakpointManager {
    pub fn new(max_watchpoints: usize) -> HardwareBreakpointManager {
        HardwareBreakpointManager {
            table: SiteTable::new(),
            max_watchpoints,
        }
    }

    pub fn max_watchpoints(&self) -> usize {
        self.max_watchpoints
    }

    pub fn add(
        &mut self,
        _mem: &mut dyn InferiorMemory,
        _address: u64,
        _lifetime: Lifetime,
        _size: usize,
        _mode: Mode,
    ) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    pub fn remove(&mut self, _mem: &mut dyn InferiorMemory, _address: u64) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    pub fn hit(&mut self, _pc: u64) -> bool {
        false
    }

    pub fn site_count(&self) -> usize {
        self.table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::FakeMemory;
    use super::*;

    #[test]
    fn everything_is_unsupported() {
        let mut mem = FakeMemory::new();
        let mut mgr = HardwareBreakpointManager::new(4);
        assert_eq!(mgr.max_watchpoints(), 4);
        assert_eq!(
            mgr.add(&mut mem, 0x1000, Lifetime::Permanent, 8, Mode::WRITE),
            Err(ErrorCode::Unsupported)
        );
        assert_eq!(mgr.remove(&mut mem, 0x1000), Err(ErrorCode::Unsupported));
        assert!(!mgr.hit(0x1000));
    }
}
