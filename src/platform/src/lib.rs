mod soft;

pub use soft::SoftMmu;

use mem::{AccessType, Addr, AddrRange, Frame};
use once_cell::sync::Lazy;
use utils::SysResult;

const MAX_USER_ADDRESS: u64 = 0x7ffffffff000; // largest possible user address
const KERNEL_BASE: u64 = 0xffff800000000000;
const KERNEL_END: u64 = 0xfffffffffffff000;

pub static SYSTEM_MMAP_MIN_ADDR: Lazy<u64> = Lazy::new(|| {
    std::fs::read_to_string("/proc/sys/vm/mmap_min_addr")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(65536)
});

/// Attributes of one translation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PteFlags {
    pub perms: AccessType,
    /// The frame is shared with the page cache and must be copied before the
    /// first store.
    pub cow: bool,
    /// Set by stores through the translation.
    pub dirty: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pte {
    pub frame: Frame,
    pub flags: PteFlags,
}

/// Architecture-specific translation layer behind one address space.
///
/// All addresses are page aligned. Calls may be made with the address space
/// lock held, so implementations must not call back into the memory manager.
pub trait Mmu: Send + Sync + std::fmt::Debug {
    /// Installs or replaces the translation for `addr`. Returns the number of
    /// page-table pages that had to be allocated.
    fn resolve(&self, addr: Addr, frame: Frame, flags: PteFlags) -> SysResult<usize>;
    /// Changes the attributes of an existing translation and returns its
    /// frame, or `None` if `addr` is not mapped.
    fn protect(&self, addr: Addr, flags: PteFlags) -> Option<Frame>;
    /// Removes the translation for `addr`, returning what it was.
    fn drop_page(&self, addr: Addr) -> Option<Pte>;
    fn read(&self, addr: Addr) -> Option<Pte>;
    /// Frees the page directory. Returns the number of page-table pages freed.
    fn release(&self) -> usize;
}

#[derive(Clone, Copy, Debug)]
pub enum Platform {
    Soft,
}

impl Platform {
    pub fn min_user_address(&self) -> Addr {
        Addr(*SYSTEM_MMAP_MIN_ADDR)
    }

    // max_user_address returns the first address that may not be used by user application
    pub fn max_user_address(&self) -> Addr {
        Addr(MAX_USER_ADDRESS)
    }

    pub fn user_range(&self) -> AddrRange {
        AddrRange {
            start: self.min_user_address().0,
            end: self.max_user_address().0,
        }
    }

    pub fn kernel_range(&self) -> AddrRange {
        AddrRange {
            start: KERNEL_BASE,
            end: KERNEL_END,
        }
    }

    pub fn new_mmu(&self) -> Box<dyn Mmu> {
        match self {
            Platform::Soft => Box::new(SoftMmu::default()),
        }
    }
}
