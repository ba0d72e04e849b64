use std::{collections::BTreeMap, sync::Arc};

use mem::{AccessType, AddrRange};
use memmap::BackingObject;
use platform::PteFlags;
use segment::{Set, SetOperations};
use utils::Range;

/// Who owns the frame behind a resident page, and so where it goes back to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PageOwner {
    /// A page cache reference on the region's backing object.
    Cache,
    /// A frame from the allocator, private to this address space.
    Private,
    /// Part of the region's physical range.
    Physical,
}

// Vma represents virtual memory area
#[derive(Clone, Debug)]
pub(crate) struct Vma {
    pub backing: Option<Arc<dyn BackingObject>>,
    /// Backing offset of the first page, or the physical base address.
    pub offset: u64,
    pub perms: AccessType,
    pub max_perms: AccessType,
    pub private: bool,
    pub cow: bool,
    pub phys: bool,
    pub fixed: bool,
    pub dead: bool,
    /// Installed translations, keyed by page address.
    pub resident: BTreeMap<u64, PageOwner>,
}

impl Vma {
    /// Offset into the backing object (or physical address) of the page at
    /// `addr` of a vma starting at `start`.
    pub fn offset_at(&self, start: u64, addr: u64) -> u64 {
        self.offset + (addr - start)
    }

    /// Translation attributes for a page of this vma.
    pub fn pte_flags(&self, owner: PageOwner, dirty: bool) -> PteFlags {
        let cow = self.cow && owner == PageOwner::Cache;
        let perms = if cow {
            self.perms.effective().without_write()
        } else {
            self.perms.effective()
        };
        PteFlags { perms, cow, dirty }
    }
}

pub(crate) type VmaSet = Set<u64, Vma>;

pub(crate) struct VmaSetOperations;
impl SetOperations for VmaSetOperations {
    type K = u64;
    type V = Vma;

    fn split(&self, r: Range<Self::K>, v: &Self::V, split: Self::K) -> (Self::V, Self::V) {
        let mut v1 = v.clone();
        let v2_resident = v1.resident.split_off(&split);
        let v2 = Vma {
            offset: v.offset_at(r.start, split),
            resident: v2_resident,
            ..v.clone()
        };
        (v1, v2)
    }
}

/// Snapshot of one region of an address space.
#[derive(Clone, Debug)]
pub struct Region {
    pub range: AddrRange,
    pub backing: Option<Arc<dyn BackingObject>>,
    pub offset: u64,
    pub perms: AccessType,
    /// Ceiling for later protect calls.
    pub max_perms: AccessType,
    pub private: bool,
    pub cow: bool,
    pub phys: bool,
    pub fixed: bool,
    pub dead: bool,
    /// Number of pages with an installed translation.
    pub resident: usize,
}

impl Region {
    pub(crate) fn new(range: AddrRange, vma: &Vma) -> Self {
        Self {
            range,
            backing: vma.backing.clone(),
            offset: vma.offset,
            perms: vma.perms,
            max_perms: vma.max_perms,
            private: vma.private,
            cow: vma.cow,
            phys: vma.phys,
            fixed: vma.fixed,
            dead: vma.dead,
            resident: vma.resident.len(),
        }
    }

    pub fn start(&self) -> u64 {
        self.range.start
    }

    pub fn len(&self) -> u64 {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}
