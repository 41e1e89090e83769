use super::{add_reference, InferiorMemory, Lifetime, Mode, Site, SiteTable};
use crate::arch::riscv;
use crate::error::{ErrorCode, Result};
use crate::log::LogLevel::LogDebug;

/// Software breakpoints: the trap opcode is written over the original
/// instruction, whose bytes are saved in the site. All reads and writes of
/// inferior memory must be run through `patch_read`/`patch_write` so the
/// debugger never observes the traps.
pub struct SoftwareBreakpointManager {
    table: SiteTable,
}

impl SoftwareBreakpointManager {
    pub fn new() -> SoftwareBreakpointManager {
        SoftwareBreakpointManager {
            table: SiteTable::new(),
        }
    }

    fn is_valid(&self, size: usize, mode: Mode) -> Result<()> {
        if mode != Mode::EXEC {
            return Err(ErrorCode::InvalidArgument);
        }
        match size {
            0 | 2 | 4 => Ok(()),
            _ => {
                log!(LogDebug, "received unsupported breakpoint size '{}'", size);
                Err(ErrorCode::InvalidArgument)
            }
        }
    }

    /// Pick the trap width for `address` from the instruction encoding
    /// found there.
    pub fn choose_size(&self, mem: &mut dyn InferiorMemory, address: u64) -> Result<usize> {
        let mut half = [0u8; 2];
        mem.read_memory(address, &mut half)?;
        self.patch_slice(address, &mut half);
        Ok(riscv::instruction_size(u16::from_le_bytes(half)))
    }

    /// Install or re-reference a site.
    pub fn add(
        &mut self,
        mem: &mut dyn InferiorMemory,
        address: u64,
        lifetime: Lifetime,
        size: usize,
        mode: Mode,
    ) -> Result<()> {
        self.is_valid(size, mode)?;
        let size = if size == 0 {
            self.choose_size(mem, address)?
        } else {
            size
        };
        if add_reference(&mut self.table, address, lifetime, size, mode)?.is_none() {
            return Ok(());
        }

        // Save what is there now, seen through any other installed site.
        let mut saved = vec![0u8; size];
        mem.read_memory(address, &mut saved)?;
        self.patch_slice(address, &mut saved);
        mem.write_memory(address, riscv::trap_opcode(size))?;
        log!(
            LogDebug,
            "installed software breakpoint at {:#x} (size {})",
            address,
            size
        );

        self.table.insert(Site {
            address,
            size,
            mode,
            lifetime,
            refs: 1,
            saved_bytes: saved,
            hw_index: None,
        });
        Ok(())
    }

    /// Drop one reference; uninstall and erase when the count reaches zero.
    pub fn remove(&mut self, mem: &mut dyn InferiorMemory, address: u64) -> Result<()> {
        let id = self.table.id_at(address).ok_or(ErrorCode::NotFound)?;
        let site = self.table.get_mut(id).unwrap();
        site.refs -= 1;
        if site.refs > 0 {
            return Ok(());
        }
        let site = self.table.erase(id).unwrap();
        mem.write_memory(site.address, &site.saved_bytes)?;
        log!(
            LogDebug,
            "removed software breakpoint at {:#x}",
            site.address
        );
        Ok(())
    }

    /// The lifetime of the installed site covering `pc`, if any. One-shot
    /// sites are removed on their first hit, before returning.
    pub fn hit(&mut self, mem: &mut dyn InferiorMemory, pc: u64) -> Option<Lifetime> {
        let id = self.table.covering(pc)?;
        let lifetime = self.table.get(id).unwrap().lifetime;
        if lifetime == Lifetime::TemporaryOneShot {
            let site = self.table.erase(id).unwrap();
            let _ = mem.write_memory(site.address, &site.saved_bytes);
        }
        Some(lifetime)
    }

    pub fn has_site_at(&self, address: u64) -> bool {
        self.table.id_at(address).is_some()
    }

    pub fn site_count(&self) -> usize {
        self.table.len()
    }

    /// Uninstall every site, restoring original bytes. Used before detach.
    pub fn clear(&mut self, mem: &mut dyn InferiorMemory) {
        for id in self.table.ids() {
            if let Some(site) = self.table.erase(id) {
                let _ = mem.write_memory(site.address, &site.saved_bytes);
            }
        }
    }

    /// Overlay the saved original bytes onto a buffer just read from
    /// `address`, so the debugger never sees planted traps.
    pub fn patch_read(&self, address: u64, buf: &mut [u8]) {
        self.patch_slice(address, buf);
    }

    fn patch_slice(&self, address: u64, buf: &mut [u8]) {
        let end = address + buf.len() as u64;
        for (_, site) in self.table.iter() {
            let site_end = site.address + site.size as u64;
            if site.address >= end || site_end <= address {
                continue;
            }
            let from = site.address.max(address);
            let to = site_end.min(end);
            for at in from..to {
                buf[(at - address) as usize] = site.saved_bytes[(at - site.address) as usize];
            }
        }
    }

    /// Route a write around installed traps: overlapping bytes land in the
    /// shadow copy, and the trap opcode stays in the underlying memory.
    pub fn patch_write(&mut self, address: u64, buf: &mut [u8]) {
        let end = address + buf.len() as u64;
        for (_, site) in self.table.iter_mut() {
            let site_end = site.address + site.size as u64;
            if site.address >= end || site_end <= address {
                continue;
            }
            let from = site.address.max(address);
            let to = site_end.min(end);
            let opcode = riscv::trap_opcode(site.size);
            for at in from..to {
                let site_off = (at - site.address) as usize;
                let buf_off = (at - address) as usize;
                site.saved_bytes[site_off] = buf[buf_off];
                buf[buf_off] = opcode[site_off];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::FakeMemory;
    use super::*;

    fn manager_and_memory() -> (SoftwareBreakpointManager, FakeMemory) {
        let mut mem = FakeMemory::new();
        // addi a0, a0, 1 (RVI) at 0x1000; c.nop (RVC) at 0x1004.
        mem.load(0x1000, &[0x13, 0x05, 0x15, 0x00]);
        mem.load(0x1004, &[0x01, 0x00]);
        (SoftwareBreakpointManager::new(), mem)
    }

    #[test]
    fn choose_size_follows_encoding() {
        let (mgr, mut mem) = manager_and_memory();
        // ebreak bytes: low bits 11 -> full width.
        mem.load(0x2000, &[0x73, 0x00, 0x10, 0x00]);
        // c.ebreak bytes: low bits 10 -> compressed.
        mem.load(0x3000, &[0x02, 0x90]);
        assert_eq!(mgr.choose_size(&mut mem, 0x2000).unwrap(), 4);
        assert_eq!(mgr.choose_size(&mut mem, 0x3000).unwrap(), 2);
    }

    #[test]
    fn install_writes_trap_and_saves_original() {
        let (mut mgr, mut mem) = manager_and_memory();
        mgr.add(&mut mem, 0x1000, Lifetime::Permanent, 0, Mode::EXEC)
            .unwrap();
        assert_eq!(mem.raw(0x1000, 4), riscv::EBREAK.to_vec());

        // A spliced read must still observe the original instruction.
        let mut buf = [0u8; 4];
        mem.read_memory(0x1000, &mut buf).unwrap();
        mgr.patch_read(0x1000, &mut buf);
        assert_eq!(buf, [0x13, 0x05, 0x15, 0x00]);
    }

    #[test]
    fn balanced_add_remove_restores_memory() {
        let (mut mgr, mut mem) = manager_and_memory();
        mgr.add(&mut mem, 0x1000, Lifetime::Permanent, 4, Mode::EXEC)
            .unwrap();
        mgr.add(&mut mem, 0x1000, Lifetime::Permanent, 4, Mode::EXEC)
            .unwrap();
        mgr.remove(&mut mem, 0x1000).unwrap();
        // Still referenced: trap still present.
        assert_eq!(mem.raw(0x1000, 4), riscv::EBREAK.to_vec());
        mgr.remove(&mut mem, 0x1000).unwrap();
        assert_eq!(mem.raw(0x1000, 4), vec![0x13, 0x05, 0x15, 0x00]);
        assert!(mgr.remove(&mut mem, 0x1000).is_err());
    }

    #[test]
    fn mismatched_attributes_are_rejected() {
        let (mut mgr, mut mem) = manager_and_memory();
        mgr.add(&mut mem, 0x1000, Lifetime::Permanent, 4, Mode::EXEC)
            .unwrap();
        assert_eq!(
            mgr.add(&mut mem, 0x1000, Lifetime::TemporaryOneShot, 4, Mode::EXEC),
            Err(ErrorCode::InvalidArgument)
        );
    }

    #[test]
    fn non_exec_modes_are_invalid() {
        let (mut mgr, mut mem) = manager_and_memory();
        assert_eq!(
            mgr.add(&mut mem, 0x1000, Lifetime::Permanent, 4, Mode::WRITE),
            Err(ErrorCode::InvalidArgument)
        );
        assert_eq!(
            mgr.add(&mut mem, 0x1000, Lifetime::Permanent, 8, Mode::EXEC),
            Err(ErrorCode::InvalidArgument)
        );
    }

    #[test]
    fn one_shot_sites_vanish_on_hit() {
        let (mut mgr, mut mem) = manager_and_memory();
        mgr.add(&mut mem, 0x1004, Lifetime::TemporaryOneShot, 2, Mode::EXEC)
            .unwrap();
        assert_eq!(mem.raw(0x1004, 2), riscv::C_EBREAK.to_vec());
        assert_eq!(mgr.hit(&mut mem, 0x1004), Some(Lifetime::TemporaryOneShot));
        // Removed and restored by the hit itself.
        assert!(!mgr.has_site_at(0x1004));
        assert_eq!(mem.raw(0x1004, 2), vec![0x01, 0x00]);
        assert!(mgr.hit(&mut mem, 0x1004).is_none());
    }

    #[test]
    fn permanent_sites_survive_hits() {
        let (mut mgr, mut mem) = manager_and_memory();
        mgr.add(&mut mem, 0x1000, Lifetime::Permanent, 4, Mode::EXEC)
            .unwrap();
        assert_eq!(mgr.hit(&mut mem, 0x1000), Some(Lifetime::Permanent));
        assert!(mgr.has_site_at(0x1000));
    }

    #[test]
    fn write_across_a_site_updates_the_shadow() {
        let (mut mgr, mut mem) = manager_and_memory();
        mgr.add(&mut mem, 0x1000, Lifetime::Permanent, 4, Mode::EXEC)
            .unwrap();

        // Debugger writes new code over the whole region.
        let mut data = vec![0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
        mgr.patch_write(0x0ffe, &mut data);
        mem.write_memory(0x0ffe, &data).unwrap();

        // Underlying memory keeps the trap...
        assert_eq!(mem.raw(0x1000, 4), riscv::EBREAK.to_vec());
        // ...but a spliced read sees the debugger's bytes...
        let mut buf = [0u8; 6];
        mem.read_memory(0x0ffe, &mut buf).unwrap();
        mgr.patch_read(0x0ffe, &mut buf);
        assert_eq!(buf, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        // ...and removal restores them to memory for real.
        mgr.remove(&mut mem, 0x1000).unwrap();
        assert_eq!(mem.raw(0x1000, 4), vec![0xcc, 0xdd, 0xee, 0xff]);
    }

    #[test]
    fn clear_restores_every_site() {
        let (mut mgr, mut mem) = manager_and_memory();
        mgr.add(&mut mem, 0x1000, Lifetime::Permanent, 4, Mode::EXEC)
            .unwrap();
        mgr.add(&mut mem, 0x1004, Lifetime::Permanent, 2, Mode::EXEC)
            .unwrap();
        mgr.clear(&mut mem);
        assert_eq!(mgr.site_count(), 0);
        assert_eq!(mem.raw(0x1000, 4), vec![0x13, 0x05, 0x15, 0x00]);
        assert_eq!(mem.raw(0x1004, 2), vec![0x01, 0x00]);
    }
}
