use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use mem::{Addr, Frame, PAGE_SHIFT};
use utils::{bail_libc, SysError, SysResult};

use super::{Mmu, Pte, PteFlags};

// Shifts of the vpn that select a table at each level above the leaf,
// mirroring a four-level x86-64 page directory.
const LEVEL_SHIFTS: [u32; 3] = [9, 18, 27];

#[derive(Debug, Default)]
struct Tables {
    ptes: BTreeMap<u64, Pte>,
    // (level, index) of every table page that has been materialised.
    tables: BTreeSet<(usize, u64)>,
}

/// Page directory kept in host memory.
///
/// Table pages are accounted for but never freed before `release`, which
/// matches the behavior of a hardware MMU that keeps intermediate tables.
#[derive(Debug, Default)]
pub struct SoftMmu {
    inner: Mutex<Tables>,
}

impl SoftMmu {
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().ptes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn table_pages(&self) -> usize {
        self.inner.lock().unwrap().tables.len()
    }
}

fn vpn(addr: Addr) -> SysResult<u64> {
    if !addr.is_page_aligned() {
        bail_libc!(libc::EINVAL);
    }
    Ok(addr.0 >> PAGE_SHIFT)
}

impl Mmu for SoftMmu {
    fn resolve(&self, addr: Addr, frame: Frame, flags: PteFlags) -> SysResult<usize> {
        let vpn = vpn(addr)?;
        let mut inner = self.inner.lock().unwrap();
        let mut allocated = 0;
        // Leaf table plus every directory level above it.
        if inner.tables.insert((0, vpn >> 9)) {
            allocated += 1;
        }
        for (level, shift) in LEVEL_SHIFTS.iter().enumerate() {
            if inner.tables.insert((level + 1, vpn >> (shift + 9))) {
                allocated += 1;
            }
        }
        inner.ptes.insert(vpn, Pte { frame, flags });
        if allocated > 0 {
            logger::trace!("soft mmu: {} table pages for {}", allocated, addr);
        }
        Ok(allocated)
    }

    fn protect(&self, addr: Addr, flags: PteFlags) -> Option<Frame> {
        let vpn = vpn(addr).ok()?;
        let mut inner = self.inner.lock().unwrap();
        let pte = inner.ptes.get_mut(&vpn)?;
        pte.flags = flags;
        Some(pte.frame)
    }

    fn drop_page(&self, addr: Addr) -> Option<Pte> {
        let vpn = vpn(addr).ok()?;
        self.inner.lock().unwrap().ptes.remove(&vpn)
    }

    fn read(&self, addr: Addr) -> Option<Pte> {
        let vpn = vpn(addr).ok()?;
        self.inner.lock().unwrap().ptes.get(&vpn).copied()
    }

    fn release(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        if !inner.ptes.is_empty() {
            logger::warn!(
                "soft mmu released with {} live translations",
                inner.ptes.len()
            );
            inner.ptes.clear();
        }
        let freed = inner.tables.len();
        inner.tables.clear();
        freed
    }
}

#[cfg(test)]
mod tests {
    use mem::{AccessType, PAGE_SIZE};

    use super::*;

    const PAGE: u64 = PAGE_SIZE as u64;

    fn rw() -> PteFlags {
        PteFlags {
            perms: AccessType::read_write(),
            ..PteFlags::default()
        }
    }

    #[test]
    fn resolve_counts_new_tables() {
        let mmu = SoftMmu::default();
        // First translation materialises one table per level.
        assert_eq!(mmu.resolve(Addr(0x10000), Frame(1), rw()), Ok(4));
        // Same leaf table.
        assert_eq!(mmu.resolve(Addr(0x10000 + PAGE), Frame(2), rw()), Ok(0));
        // Next leaf table, same directory.
        assert_eq!(mmu.resolve(Addr(0x10000 + 512 * PAGE), Frame(3), rw()), Ok(1));
        assert_eq!(mmu.table_pages(), 5);
        assert_eq!(mmu.len(), 3);
    }

    #[test]
    fn resolve_rejects_unaligned() {
        let mmu = SoftMmu::default();
        assert_eq!(
            mmu.resolve(Addr(0x10001), Frame(1), rw()),
            Err(SysError::new(libc::EINVAL))
        );
        assert!(mmu.is_empty());
    }

    #[test]
    fn protect_and_drop() {
        let mmu = SoftMmu::default();
        let addr = Addr(0x20000);
        assert_eq!(mmu.protect(addr, rw()), None);
        mmu.resolve(addr, Frame(9), rw()).unwrap();

        let ro = PteFlags {
            perms: AccessType::read(),
            cow: true,
            dirty: false,
        };
        assert_eq!(mmu.protect(addr, ro), Some(Frame(9)));
        assert_eq!(
            mmu.read(addr),
            Some(Pte {
                frame: Frame(9),
                flags: ro
            })
        );
        assert_eq!(mmu.drop_page(addr).map(|p| p.frame), Some(Frame(9)));
        assert_eq!(mmu.read(addr), None);
        assert_eq!(mmu.drop_page(addr), None);
    }

    #[test]
    fn release_frees_tables() {
        let mmu = SoftMmu::default();
        mmu.resolve(Addr(0x10000), Frame(1), rw()).unwrap();
        mmu.drop_page(Addr(0x10000));
        assert_eq!(mmu.release(), 4);
        assert_eq!(mmu.table_pages(), 0);
    }
}
