pub mod hardware;
pub mod software;

pub use hardware::HardwareBreakpointManager;
pub use software::SoftwareBreakpointManager;

use crate::error::{ErrorCode, Result};
use bitflags::bitflags;
use std::collections::HashMap;

/// Byte-level access to the inferior's address space. Implemented by the
/// ptrace layer (raw) and used by the managers to install and restore trap
/// bytes; the process model layers breakpoint splicing on top.
pub trait InferiorMemory {
    fn read_memory(&mut self, address: u64, buf: &mut [u8]) -> Result<()>;
    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()>;
}

bitflags! {
    pub struct Mode: u32 {
        const EXEC = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
    }
}

impl Mode {
    pub fn access() -> Mode {
        Mode::READ | Mode::WRITE
    }
}

/// How long a site outlives its installation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Lifetime {
    /// Stays until explicitly removed by the debugger.
    Permanent,
    /// Belongs to an internal operation; removed when the operation ends.
    Temporary,
    /// Removed by the manager on the first observed hit.
    TemporaryOneShot,
}

pub type SiteId = u32;

/// One breakpoint or watchpoint location.
#[derive(Clone, Debug)]
pub struct Site {
    pub address: u64,
    pub size: usize,
    pub mode: Mode,
    pub lifetime: Lifetime,
    pub refs: u32,
    /// Original inferior bytes, present while a software site is installed.
    pub saved_bytes: Vec<u8>,
    /// Debug register index, present while a hardware site is installed.
    pub hw_index: Option<usize>,
}

/// Dense site storage plus an address index. Sites are alive while their
/// refcount is positive; nothing points back at the manager.
#[derive(Default)]
pub struct SiteTable {
    sites: HashMap<SiteId, Site>,
    by_address: HashMap<u64, SiteId>,
    next_id: SiteId,
}

impl SiteTable {
    pub fn new() -> SiteTable {
        SiteTable::default()
    }

    pub fn insert(&mut self, site: Site) -> SiteId {
        let id = self.next_id;
        self.next_id += 1;
        self.by_address.insert(site.address, id);
        self.sites.insert(id, site);
        id
    }

    pub fn id_at(&self, address: u64) -> Option<SiteId> {
        self.by_address.get(&address).copied()
    }

    pub fn get(&self, id: SiteId) -> Option<&Site> {
        self.sites.get(&id)
    }

    pub fn get_mut(&mut self, id: SiteId) -> Option<&mut Site> {
        self.sites.get_mut(&id)
    }

    pub fn erase(&mut self, id: SiteId) -> Option<Site> {
        let site = self.sites.remove(&id)?;
        self.by_address.remove(&site.address);
        Some(site)
    }

    /// The site whose span contains `address`, if any.
    pub fn covering(&self, address: u64) -> Option<SiteId> {
        self.sites
            .iter()
            .find(|(_, s)| address >= s.address && address < s.address + s.size as u64)
            .map(|(id, _)| *id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SiteId, &Site)> {
        self.sites.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&SiteId, &mut Site)> {
        self.sites.iter_mut()
    }

    pub fn ids(&self) -> Vec<SiteId> {
        self.sites.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }
}

/// Shared add/remove bookkeeping: returns Ok(Some(id)) when a new site must
/// be installed, Ok(None) when an existing site was re-referenced.
pub(crate) fn add_reference(
    table: &mut SiteTable,
    address: u64,
    lifetime: Lifetime,
    size: usize,
    mode: Mode,
) -> Result<Option<()>> {
    if let Some(id) = table.id_at(address) {
        let site = table.get_mut(id).unwrap();
        if site.size != size || site.mode != mode || site.lifetime != lifetime {
            return Err(ErrorCode::InvalidArgument);
        }
        site.refs += 1;
        return Ok(None);
    }
    Ok(Some(()))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::InferiorMemory;
    use crate::error::{ErrorCode, Result};
    use std::collections::HashMap;

    /// Sparse byte-addressable fake inferior for manager and planner tests.
    pub struct FakeMemory {
        bytes: HashMap<u64, u8>,
    }

    impl FakeMemory {
        pub fn new() -> FakeMemory {
            FakeMemory {
                bytes: HashMap::new(),
            }
        }

        pub fn load(&mut self, address: u64, data: &[u8]) {
            for (i, &b) in data.iter().enumerate() {
                self.bytes.insert(address + i as u64, b);
            }
        }

        pub fn raw(&self, address: u64, len: usize) -> Vec<u8> {
            (0..len)
                .map(|i| *self.bytes.get(&(address + i as u64)).unwrap_or(&0))
                .collect()
        }
    }

    impl InferiorMemory for FakeMemory {
        fn read_memory(&mut self, address: u64, buf: &mut [u8]) -> Result<()> {
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = *self
                    .bytes
                    .get(&(address + i as u64))
                    .ok_or(ErrorCode::InvalidAddress)?;
            }
            Ok(())
        }

        fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()> {
            for (i, &b) in data.iter().enumerate() {
                self.bytes.insert(address + i as u64, b);
            }
            Ok(())
        }
    }
}
