use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use mem::{is_page_aligned, AccessType, Addr, AddrRange, Frame, PAGE_SIZE};
use memmap::{mmap_opts::MmapOpts, BackingObject};
use platform::{Mmu, Pte, PteFlags};
use segment::Seg;
use serde::Serialize;
use utils::{bail_libc, SysError, SysResult};

use crate::{
    kernel::MemoryContext,
    region::{PageOwner, Region, Vma, VmaSet, VmaSetOperations},
};

const PAGE: u64 = PAGE_SIZE as u64;

#[derive(Debug)]
pub(crate) struct Inner {
    vmas: VmaSet,
    virtual_size: u64,
    physical_size: u64,
    shared_size: u64,
    table_pages: u64,
    destroyed: bool,
}

impl Inner {
    // The live vmas covering all of `ar`, or ENOENT if any part of it is
    // unmapped or dead.
    fn covering(&self, ar: AddrRange) -> SysResult<Vec<Seg<u64>>> {
        let segs = self.vmas.segments_in(ar);
        let mut covered = ar.start;
        for seg in &segs {
            if seg.start() > covered || self.vmas.value(seg).dead {
                bail_libc!(libc::ENOENT);
            }
            covered = seg.end();
        }
        if covered < ar.end {
            bail_libc!(libc::ENOENT);
        }
        Ok(segs)
    }

    // The live vma containing `page`.
    fn live_vma(&self, page: Addr) -> Option<Seg<u64>> {
        if self.destroyed {
            return None;
        }
        self.vmas
            .find_segment(page.0)
            .filter(|seg| !self.vmas.value(seg).dead)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressSpaceStats {
    /// Total length of live regions.
    pub virtual_size: u64,
    /// Resident pages plus page-table pages, in bytes.
    pub physical_size: u64,
    /// Resident pages owned by the page cache, in bytes.
    pub shared_size: u64,
    pub table_pages: u64,
    pub regions: usize,
    pub soft_faults: u64,
    pub hard_faults: u64,
    pub cow_faults: u64,
}

#[derive(Debug, Default)]
pub(crate) struct FaultCounters {
    soft: AtomicU64,
    hard: AtomicU64,
    cow: AtomicU64,
}

impl FaultCounters {
    pub fn record_fill(&self, did_io: bool) {
        if did_io {
            self.hard.fetch_add(1, Ordering::Relaxed);
        } else {
            self.soft.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cow(&self) {
        self.cow.fetch_add(1, Ordering::Relaxed);
    }
}

// Frames handed back after the address space lock is dropped.
enum Reclaim {
    Cache {
        object: Arc<dyn BackingObject>,
        offset: u64,
        dirty: bool,
    },
    Frame(Frame),
}

struct DirtyPage {
    addr: Addr,
    frame: Frame,
    object: Arc<dyn BackingObject>,
    offset: u64,
}

#[derive(Clone, Copy, Debug)]
enum Change {
    Perms(AccessType),
    // Marks the range for reclamation by the next scavenge.
    Dead,
}

/// What the fault resolver needs to know about the vma covering a page.
#[derive(Clone, Debug)]
pub(crate) struct FaultTarget {
    pub backing: Option<Arc<dyn BackingObject>>,
    /// Backing offset (or physical address) of the page.
    pub offset: u64,
    pub perms: AccessType,
    pub cow: bool,
    pub phys: bool,
    pub pte: Option<Pte>,
}

impl FaultTarget {
    // Whether `vma` still maps the same thing at `page`.
    fn matches(&self, start: u64, page: Addr, vma: &Vma) -> bool {
        let same_backing = match (&self.backing, &vma.backing) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_backing && vma.phys == self.phys && vma.offset_at(start, page.0) == self.offset
    }
}

/// A set of mapped regions plus the translations installed for them.
///
/// One lock guards the region map and the size counters. The page cache and
/// backing objects are never called with that lock held; the MMU is.
#[derive(Debug)]
pub struct AddressSpace {
    inner: Mutex<Inner>,
    mmu: Box<dyn Mmu>,
    ctx: Arc<MemoryContext>,
    bounds: AddrRange,
    refs: AtomicUsize,
    kernel: bool,
    pub(crate) faults: FaultCounters,
}

impl AddressSpace {
    /// A user address space covering `bounds`, holding one reference.
    pub fn create(ctx: Arc<MemoryContext>, bounds: AddrRange) -> Arc<Self> {
        Self::with_bounds(ctx, bounds, false)
    }

    pub fn new_kernel(ctx: Arc<MemoryContext>) -> Arc<Self> {
        let bounds = ctx.config().kernel_range();
        Self::with_bounds(ctx, bounds, true)
    }

    fn with_bounds(ctx: Arc<MemoryContext>, bounds: AddrRange, kernel: bool) -> Arc<Self> {
        if !is_page_aligned(bounds.start) || !is_page_aligned(bounds.end) || bounds.is_empty() {
            panic!("invalid address space bounds {:?}", bounds);
        }
        let mmu = ctx.platform().new_mmu();
        Arc::new(Self {
            inner: Mutex::new(Inner {
                vmas: VmaSet::new(Box::new(VmaSetOperations)),
                virtual_size: 0,
                physical_size: 0,
                shared_size: 0,
                table_pages: 0,
                destroyed: false,
            }),
            mmu,
            ctx,
            bounds,
            refs: AtomicUsize::new(1),
            kernel,
            faults: FaultCounters::default(),
        })
    }

    /// Takes another reference, e.g. for a new thread of the same task.
    pub fn open(self: &Arc<Self>) -> Arc<Self> {
        self.refs.fetch_add(1, Ordering::SeqCst);
        Arc::clone(self)
    }

    /// Drops a reference; the last one destroys the address space.
    pub fn close(&self) {
        match self.refs.fetch_sub(1, Ordering::SeqCst) {
            0 => panic!("address space refcount underflow"),
            1 => self.destroy(),
            _ => {}
        }
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    pub fn bounds(&self) -> AddrRange {
        self.bounds
    }

    pub fn context(&self) -> &Arc<MemoryContext> {
        &self.ctx
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn map(&self, opts: MmapOpts) -> SysResult<Addr> {
        let length = opts.length;
        if length == 0 || !is_page_aligned(length) || length > self.bounds.len() {
            bail_libc!(libc::EINVAL);
        }
        if opts.phys && opts.backing.is_some() {
            bail_libc!(libc::EINVAL);
        }
        let hint = match opts.addr {
            Some(addr) if !addr.is_page_aligned() => {
                if opts.fixed {
                    bail_libc!(libc::EINVAL);
                }
                Some(addr.round_down())
            }
            Some(addr) => Some(addr),
            None if opts.fixed => bail_libc!(libc::EINVAL),
            None => None,
        };
        let offset = if opts.backing.is_some() || opts.phys {
            if !is_page_aligned(opts.offset) {
                bail_libc!(libc::EINVAL);
            }
            opts.offset
                .checked_add(length)
                .ok_or_else(|| SysError::new(libc::EINVAL))?;
            opts.offset
        } else {
            0
        };
        let max_perms = opts.max_perms.unwrap_or(opts.perms);
        if !max_perms.is_superset_of(opts.perms) {
            bail_libc!(libc::EINVAL);
        }

        let ar = {
            let mut inner = self.lock();
            if inner.destroyed {
                bail_libc!(libc::EINVAL);
            }
            let mut start = None;
            if let Some(hint) = hint {
                match hint.to_range(length) {
                    Some(r) if self.bounds.is_superset_of(&r) && inner.vmas.is_free(r) => {
                        start = Some(r.start)
                    }
                    _ if opts.fixed => {
                        logger::debug!("fixed map at {} of {:#x} bytes collides", hint, length);
                        bail_libc!(libc::ERANGE);
                    }
                    _ => {}
                }
            }
            let start = match start {
                Some(start) => start,
                None => inner
                    .vmas
                    .first_fit(self.bounds, length)
                    .ok_or_else(|| SysError::new(libc::ENOMEM))?,
            };
            let ar = AddrRange {
                start,
                end: start + length,
            };
            let vma = Vma {
                backing: opts.backing.clone(),
                offset,
                perms: opts.perms,
                max_perms,
                private: opts.private,
                cow: opts.private && opts.backing.is_some(),
                phys: opts.phys,
                fixed: opts.fixed,
                dead: false,
                resident: BTreeMap::new(),
            };
            inner.vmas.insert(ar, vma);
            inner.virtual_size += length;
            ar
        };
        logger::debug!(
            "map {:?} {:?} private={} backed={} phys={}",
            ar,
            opts.perms,
            opts.private,
            opts.backing.is_some(),
            opts.phys
        );

        if opts.precommit {
            if let Err(e) = self.populate(Addr(ar.start), length, false) {
                logger::debug!("precommit of {:?} stopped early: {}", ar, e);
            }
        }
        Ok(Addr(ar.start))
    }

    /// Page-aligned range `[addr, addr + length)` rounded up to whole pages
    /// and checked against the bounds.
    pub(crate) fn checked_range(&self, addr: Addr, length: u64) -> SysResult<AddrRange> {
        if !addr.is_page_aligned() || length == 0 {
            bail_libc!(libc::EINVAL);
        }
        let length = Addr(length)
            .round_up()
            .ok_or_else(|| SysError::new(libc::EINVAL))?;
        let ar = addr
            .to_range(length.0)
            .ok_or_else(|| SysError::new(libc::EINVAL))?;
        if !self.bounds.is_superset_of(&ar) {
            bail_libc!(libc::EINVAL);
        }
        Ok(ar)
    }

    /// Changes the access rights of every page in the range. Rights above a
    /// region's ceiling are silently dropped.
    pub fn protect(&self, addr: Addr, length: u64, perms: AccessType) -> SysResult<()> {
        let ar = self.checked_range(addr, length)?;
        self.change(ar, Change::Perms(perms))?;
        logger::debug!("protect {:?} {:?}", ar, perms);
        Ok(())
    }

    pub fn unmap(&self, addr: Addr, length: u64) -> SysResult<()> {
        let ar = self.checked_range(addr, length)?;
        self.change(ar, Change::Dead)?;
        logger::debug!("unmap {:?}", ar);
        if self.ctx.config().eager_scavenge {
            self.scavenge();
        }
        Ok(())
    }

    fn change(&self, ar: AddrRange, change: Change) -> SysResult<()> {
        let mut inner = self.lock();
        if inner.destroyed {
            bail_libc!(libc::EINVAL);
        }

        // Nothing is split until the whole range is known to be mapped.
        let segs = inner.covering(ar)?;

        let Inner {
            vmas, virtual_size, ..
        } = &mut *inner;
        for seg in segs {
            let seg = vmas.isolate(&seg, ar);
            let len = seg.range().len();
            let vma = vmas.value_mut(&seg);
            match change {
                Change::Dead => {
                    vma.dead = true;
                    *virtual_size -= len;
                }
                Change::Perms(perms) => {
                    vma.perms = perms.intersect(vma.max_perms);
                    for (&page, &owner) in &vma.resident {
                        let dirty = self.mmu.read(Addr(page)).map_or(false, |p| p.flags.dirty);
                        self.mmu.protect(Addr(page), vma.pte_flags(owner, dirty));
                    }
                }
            }
        }
        Ok(())
    }

    /// Removes every dead region, returning how many were removed.
    pub fn scavenge(&self) -> usize {
        let (removed, reclaims) = {
            let mut inner = self.lock();
            let dead: Vec<u64> = inner
                .vmas
                .iter()
                .filter(|(_, vma)| vma.dead)
                .map(|(r, _)| r.start)
                .collect();
            let mut reclaims = Vec::new();
            for start in &dead {
                let (range, vma) = inner
                    .vmas
                    .remove(*start)
                    .unwrap_or_else(|| panic!("dead vma at {:#x} vanished", start));
                self.drop_pages(&mut inner, range, &vma, &mut reclaims);
            }
            (dead.len(), reclaims)
        };
        if removed > 0 {
            logger::debug!(
                "scavenged {} regions, {} pages to reclaim",
                removed,
                reclaims.len()
            );
        }
        self.reclaim(reclaims);
        removed
    }

    /// Writes back stores made through shared file mappings in the range.
    /// Fails with ENOENT if part of the range is not mapped.
    pub fn sync(&self, addr: Addr, length: u64) -> SysResult<()> {
        let ar = self.checked_range(addr, length)?;
        {
            let inner = self.lock();
            if inner.destroyed {
                bail_libc!(libc::EINVAL);
            }
            inner.covering(ar)?;
        }
        self.flush(ar)
    }

    /// Writes back every dirty shared page of the address space.
    pub fn sync_all(&self) -> SysResult<()> {
        if self.is_destroyed() {
            return Ok(());
        }
        self.flush(self.bounds)
    }

    // A shared page's dirty bit lives in its translation until handed to the
    // page cache. The cache is marked before the translation is cleared.
    fn flush(&self, ar: AddrRange) -> SysResult<()> {
        let dirty = self.dirty_shared_pages(ar);
        if dirty.is_empty() {
            return Ok(());
        }
        let cache = self.ctx.page_cache();
        for page in &dirty {
            cache.mark_dirty(&page.object, page.offset);
        }
        {
            let _inner = self.lock();
            for page in &dirty {
                match self.mmu.read(page.addr) {
                    Some(pte) if pte.frame == page.frame && pte.flags.dirty => {
                        self.mmu.protect(
                            page.addr,
                            PteFlags {
                                dirty: false,
                                ..pte.flags
                            },
                        );
                    }
                    _ => {}
                }
            }
        }
        logger::debug!("sync {:?}: {} dirty pages", ar, dirty.len());

        let mut objects: Vec<&Arc<dyn BackingObject>> = Vec::new();
        for page in &dirty {
            if !objects.iter().any(|o| Arc::ptr_eq(o, &page.object)) {
                objects.push(&page.object);
            }
        }
        let mut first_err = None;
        for object in objects {
            if let Err(e) = cache.sync_object(object) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn dirty_shared_pages(&self, ar: AddrRange) -> Vec<DirtyPage> {
        let inner = self.lock();
        let mut out = Vec::new();
        for seg in inner.vmas.segments_in(ar) {
            let vma = inner.vmas.value(&seg);
            let object = match &vma.backing {
                Some(object) if !vma.dead => object,
                _ => continue,
            };
            let start = std::cmp::max(seg.start(), ar.start);
            let end = std::cmp::min(seg.end(), ar.end);
            for (&page, &owner) in vma.resident.range(start..end) {
                if owner != PageOwner::Cache {
                    continue;
                }
                match self.mmu.read(Addr(page)) {
                    Some(pte) if pte.flags.dirty && !pte.flags.cow => out.push(DirtyPage {
                        addr: Addr(page),
                        frame: pte.frame,
                        object: Arc::clone(object),
                        offset: vma.offset_at(seg.start(), page),
                    }),
                    _ => {}
                }
            }
        }
        out
    }

    /// Closes every region and releases the page directory. Later
    /// operations fail with EINVAL.
    pub fn destroy(&self) {
        let reclaims = {
            let mut inner = self.lock();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            let mut reclaims = Vec::new();
            while let Some((range, vma)) = inner.vmas.remove_first() {
                if !vma.dead {
                    inner.virtual_size -= range.len();
                }
                self.drop_pages(&mut inner, range, &vma, &mut reclaims);
            }
            let freed = self.mmu.release() as u64;
            inner.table_pages = inner.table_pages.saturating_sub(freed);
            inner.physical_size = inner.physical_size.saturating_sub(freed * PAGE);
            reclaims
        };
        logger::info!(
            "address space {:?} destroyed, {} pages reclaimed",
            self.bounds,
            reclaims.len()
        );
        self.reclaim(reclaims);
    }

    // Caller holds the lock and has already taken `vma` out of the set.
    fn drop_pages(&self, inner: &mut Inner, range: AddrRange, vma: &Vma, out: &mut Vec<Reclaim>) {
        for (&page, &owner) in &vma.resident {
            let pte = self
                .mmu
                .drop_page(Addr(page))
                .unwrap_or_else(|| panic!("resident page {:#x} has no translation", page));
            inner.physical_size -= PAGE;
            match owner {
                PageOwner::Cache => {
                    inner.shared_size -= PAGE;
                    let object = vma
                        .backing
                        .clone()
                        .unwrap_or_else(|| panic!("cached page {:#x} without backing", page));
                    out.push(Reclaim::Cache {
                        object,
                        offset: vma.offset_at(range.start, page),
                        dirty: pte.flags.dirty,
                    });
                }
                PageOwner::Private => out.push(Reclaim::Frame(pte.frame)),
                PageOwner::Physical => {}
            }
        }
    }

    fn reclaim(&self, reclaims: Vec<Reclaim>) {
        for r in reclaims {
            match r {
                Reclaim::Cache {
                    object,
                    offset,
                    dirty,
                } => self.ctx.page_cache().release(&object, offset, dirty),
                Reclaim::Frame(frame) => self.ctx.allocator().release(frame),
            }
        }
    }

    /// The region containing `addr`, dead or alive.
    pub fn search(&self, addr: Addr) -> Option<Region> {
        let inner = self.lock();
        let seg = inner.vmas.search_le(addr.0)?;
        if !seg.range().contains(addr.0) {
            return None;
        }
        Some(Region::new(seg.range(), inner.vmas.value(&seg)))
    }

    pub fn regions(&self) -> Vec<Region> {
        self.lock()
            .vmas
            .iter()
            .map(|(r, vma)| Region::new(r, vma))
            .collect()
    }

    pub fn stats(&self) -> AddressSpaceStats {
        let inner = self.lock();
        AddressSpaceStats {
            virtual_size: inner.virtual_size,
            physical_size: inner.physical_size,
            shared_size: inner.shared_size,
            table_pages: inner.table_pages,
            regions: inner.vmas.len(),
            soft_faults: self.faults.soft.load(Ordering::Relaxed),
            hard_faults: self.faults.hard.load(Ordering::Relaxed),
            cow_faults: self.faults.cow.load(Ordering::Relaxed),
        }
    }

    /// The translation installed for the page containing `addr`.
    pub fn pte(&self, addr: Addr) -> Option<Pte> {
        self.mmu.read(addr.round_down())
    }

    pub(crate) fn fault_target(&self, page: Addr) -> Option<FaultTarget> {
        let inner = self.lock();
        let seg = inner.live_vma(page)?;
        let vma = inner.vmas.value(&seg);
        Some(FaultTarget {
            backing: vma.backing.clone(),
            offset: vma.offset_at(seg.start(), page.0),
            perms: vma.perms,
            cow: vma.cow,
            phys: vma.phys,
            pte: self.mmu.read(page),
        })
    }

    /// Installs `frame` at `page` unless someone beat us to it. Returns
    /// false when the frame was not used and must be given back.
    pub(crate) fn install(
        &self,
        page: Addr,
        frame: Frame,
        owner: PageOwner,
        target: &FaultTarget,
        dirty: bool,
    ) -> SysResult<bool> {
        let mut inner = self.lock();
        let seg = inner
            .live_vma(page)
            .ok_or_else(|| SysError::seg_fault(page.0))?;
        let Inner {
            vmas,
            physical_size,
            shared_size,
            table_pages,
            ..
        } = &mut *inner;
        let vma = vmas.value_mut(&seg);
        if !target.matches(seg.start(), page, vma) {
            return Err(SysError::seg_fault(page.0));
        }
        if vma.resident.contains_key(&page.0) {
            return Ok(false);
        }
        let tables = self.mmu.resolve(page, frame, vma.pte_flags(owner, dirty))? as u64;
        vma.resident.insert(page.0, owner);
        *physical_size += PAGE * (1 + tables);
        *table_pages += tables;
        if owner == PageOwner::Cache {
            *shared_size += PAGE;
        }
        Ok(true)
    }

    /// Swaps the shared copy-on-write frame `old` at `page` for the private
    /// copy `new`. Returns false if the page no longer maps `old`.
    pub(crate) fn replace_cow(
        &self,
        page: Addr,
        target: &FaultTarget,
        old: Frame,
        new: Frame,
    ) -> SysResult<bool> {
        let mut inner = self.lock();
        let seg = inner
            .live_vma(page)
            .ok_or_else(|| SysError::seg_fault(page.0))?;
        let Inner {
            vmas,
            physical_size,
            shared_size,
            table_pages,
            ..
        } = &mut *inner;
        let vma = vmas.value_mut(&seg);
        if !target.matches(seg.start(), page, vma) || !vma.perms.write {
            return Err(SysError::seg_fault(page.0));
        }
        match (vma.resident.get(&page.0), self.mmu.read(page)) {
            (Some(PageOwner::Cache), Some(pte)) if pte.frame == old && pte.flags.cow => {}
            _ => return Ok(false),
        }
        let tables = self
            .mmu
            .resolve(page, new, vma.pte_flags(PageOwner::Private, true))? as u64;
        vma.resident.insert(page.0, PageOwner::Private);
        *shared_size -= PAGE;
        *physical_size += PAGE * tables;
        *table_pages += tables;
        Ok(true)
    }

    /// Sets the dirty bit of a resident page.
    pub(crate) fn mark_dirty(&self, page: Addr) {
        let _inner = self.lock();
        if let Some(pte) = self.mmu.read(page) {
            if !pte.flags.dirty {
                self.mmu.protect(
                    page,
                    PteFlags {
                        dirty: true,
                        ..pte.flags
                    },
                );
            }
        }
    }

    /// Runs `f` on the frame at `page` under the lock if the page is resident
    /// and accessible for the requested kind of access. Returns false when a
    /// fault is needed first.
    pub(crate) fn with_page<F: FnMut(Frame) -> SysResult<()>>(
        &self,
        page: Addr,
        write: bool,
        f: &mut F,
    ) -> SysResult<bool> {
        let inner = self.lock();
        let seg = inner
            .live_vma(page)
            .ok_or_else(|| SysError::seg_fault(page.0))?;
        let perms = inner.vmas.value(&seg).perms.effective();
        let allowed = if write { perms.write } else { perms.read };
        if !allowed {
            return Err(SysError::seg_fault(page.0));
        }
        match self.mmu.read(page) {
            Some(pte) if !write || (!pte.flags.cow && pte.flags.perms.write) => {
                f(pte.frame)?;
                if write && !pte.flags.dirty {
                    self.mmu.protect(
                        page,
                        PteFlags {
                            dirty: true,
                            ..pte.flags
                        },
                    );
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use rand::Rng;

    use super::*;
    use crate::MmConfig;

    pub(crate) fn context_with(config: MmConfig) -> Arc<MemoryContext> {
        MemoryContext::from_config(config).expect("failed to create memory context")
    }

    pub(crate) fn context(frames: u64) -> Arc<MemoryContext> {
        context_with(MmConfig {
            frames,
            ..MmConfig::default()
        })
    }

    pub(crate) fn address_space(frames: u64) -> Arc<AddressSpace> {
        context(frames).new_user_space()
    }

    fn anon(length: u64, perms: AccessType) -> MmapOpts {
        MmapOpts {
            length,
            private: true,
            perms,
            ..MmapOpts::default()
        }
    }

    fn fixed(addr: u64, length: u64, perms: AccessType) -> MmapOpts {
        MmapOpts {
            addr: Some(Addr(addr)),
            fixed: true,
            ..anon(length, perms)
        }
    }

    fn live_span(space: &AddressSpace) -> u64 {
        space
            .regions()
            .iter()
            .filter(|r| !r.dead)
            .map(|r| r.len())
            .sum()
    }

    fn assert_disjoint(space: &AddressSpace) {
        let regions = space.regions();
        for pair in regions.windows(2) {
            assert!(
                pair[0].range.end <= pair[1].range.start,
                "{:?} overlaps {:?}",
                pair[0].range,
                pair[1].range
            );
        }
        for r in &regions {
            assert!(space.bounds().is_superset_of(&r.range));
        }
    }

    #[test]
    fn map_first_fit_and_search() {
        let space = AddressSpace::create(
            context(16),
            AddrRange {
                start: 0x1000,
                end: 0x10000,
            },
        );
        let a = space
            .map(anon(PAGE, AccessType::read_write()))
            .expect("error occurred in map");
        assert!(a.is_page_aligned());
        assert!(space.bounds().contains(a.0));

        let found = space.search(a).expect("mapped region not found");
        assert_eq!(found.range, AddrRange { start: a.0, end: a.0 + PAGE });
        assert!(space.search(Addr(a.0 + PAGE)).is_none());
        assert_eq!(found.max_perms, AccessType::read_write());

        let b = space.map(anon(PAGE, AccessType::read())).unwrap();
        assert_eq!(b.0, a.0 + PAGE);
        assert_eq!(space.search(Addr(a.0 + PAGE + 5)).unwrap().range.start, b.0);
        assert_eq!(space.stats().virtual_size, 2 * PAGE);
    }

    #[test]
    fn fixed_hint_is_exact_or_erange() {
        let space = address_space(16);
        let h = 0x400000;
        assert_eq!(
            space.map(fixed(h, 2 * PAGE, AccessType::read())),
            Ok(Addr(h))
        );
        assert_eq!(
            space.map(fixed(h + PAGE, PAGE, AccessType::read())),
            Err(SysError::new(libc::ERANGE))
        );

        // The same hint without FIXED falls back to a disjoint address.
        let a = space
            .map(MmapOpts {
                addr: Some(Addr(h)),
                ..anon(PAGE, AccessType::read())
            })
            .unwrap();
        assert_ne!(a.0, h);
        assert_disjoint(&space);

        // An out-of-bounds fixed hint collides with nothing but still fails.
        let upper = space.bounds().end;
        assert_eq!(
            space.map(fixed(upper - PAGE, 2 * PAGE, AccessType::read())),
            Err(SysError::new(libc::ERANGE))
        );
        // A misaligned hint without FIXED is rounded down.
        let b = space
            .map(MmapOpts {
                addr: Some(Addr(0x800123)),
                ..anon(PAGE, AccessType::read())
            })
            .unwrap();
        assert_eq!(b, Addr(0x800000));
    }

    #[test]
    fn map_rejects_bad_arguments() {
        let space = address_space(16);
        let backing: Arc<dyn BackingObject> = Arc::new(memmap::BytesObject::default());
        for (name, opts) in vec![
            ("zero length", anon(0, AccessType::read())),
            ("misaligned length", anon(PAGE + 1, AccessType::read())),
            (
                "fixed without hint",
                MmapOpts {
                    fixed: true,
                    ..anon(PAGE, AccessType::read())
                },
            ),
            ("misaligned fixed hint", fixed(0x400010, PAGE, AccessType::read())),
            (
                "misaligned offset",
                MmapOpts {
                    backing: Some(Arc::clone(&backing)),
                    offset: 10,
                    ..anon(PAGE, AccessType::read())
                },
            ),
            (
                "offset overflow",
                MmapOpts {
                    backing: Some(Arc::clone(&backing)),
                    offset: u64::MAX - PAGE + 1,
                    ..anon(PAGE, AccessType::read())
                },
            ),
            (
                "ceiling below perms",
                MmapOpts {
                    max_perms: Some(AccessType::read()),
                    ..anon(PAGE, AccessType::read_write())
                },
            ),
            (
                "phys with backing",
                MmapOpts {
                    backing: Some(Arc::clone(&backing)),
                    phys: true,
                    ..anon(PAGE, AccessType::read())
                },
            ),
            ("oversized", anon(space.bounds().len() + PAGE, AccessType::read())),
        ] {
            assert_eq!(
                space.map(opts),
                Err(SysError::new(libc::EINVAL)),
                "{}",
                name
            );
        }
        assert!(space.regions().is_empty());
    }

    #[test]
    fn map_enomem_when_full() {
        let space = AddressSpace::create(
            context(16),
            AddrRange {
                start: 0x1000,
                end: 0x4000,
            },
        );
        space.map(anon(2 * PAGE, AccessType::read())).unwrap();
        assert_eq!(
            space.map(anon(2 * PAGE, AccessType::read())),
            Err(SysError::new(libc::ENOMEM))
        );
        assert_eq!(space.map(anon(PAGE, AccessType::read())), Ok(Addr(0x3000)));
    }

    #[test]
    fn protect_splits_into_three() {
        let space = address_space(16);
        let h = 0x400000;
        space
            .map(fixed(h, 3 * PAGE, AccessType::read_write()))
            .expect("error occurred in map");
        space
            .protect(Addr(h + PAGE), PAGE, AccessType::read())
            .expect("error occurred in protect");

        let regions = space.regions();
        let got: Vec<_> = regions.iter().map(|r| (r.range.start, r.range.end, r.perms)).collect();
        assert_eq!(
            got,
            vec![
                (h, h + PAGE, AccessType::read_write()),
                (h + PAGE, h + 2 * PAGE, AccessType::read()),
                (h + 2 * PAGE, h + 3 * PAGE, AccessType::read_write()),
            ]
        );
        assert_eq!(space.stats().virtual_size, 3 * PAGE);
    }

    #[test]
    fn protect_clamps_to_ceiling() {
        let space = address_space(16);
        let a = space
            .map(MmapOpts {
                max_perms: Some(AccessType::read_write()),
                ..anon(PAGE, AccessType::read())
            })
            .unwrap();
        space.protect(a, PAGE, AccessType::any_access()).unwrap();
        assert_eq!(space.search(a).unwrap().perms, AccessType::read_write());

        let b = space.map(anon(PAGE, AccessType::read())).unwrap();
        space.protect(b, PAGE, AccessType::read_write()).unwrap();
        assert_eq!(space.search(b).unwrap().perms, AccessType::read());
    }

    #[test]
    fn protect_over_hole_has_no_effect() {
        let space = address_space(16);
        let h = 0x400000;
        space.map(fixed(h, PAGE, AccessType::read_write())).unwrap();
        space
            .map(fixed(h + 2 * PAGE, 2 * PAGE, AccessType::read_write()))
            .unwrap();
        assert_eq!(
            space.protect(Addr(h), 4 * PAGE, AccessType::read()),
            Err(SysError::new(libc::ENOENT))
        );
        assert_eq!(
            space.protect(Addr(h + 3 * PAGE), 2 * PAGE, AccessType::read()),
            Err(SysError::new(libc::ENOENT))
        );
        let regions = space.regions();
        assert_eq!(regions.len(), 2);
        assert!(regions.iter().all(|r| r.perms == AccessType::read_write()));

        assert_eq!(
            space.protect(Addr(h + 1), PAGE, AccessType::read()),
            Err(SysError::new(libc::EINVAL))
        );
        assert_eq!(
            space.protect(Addr(h), 0, AccessType::read()),
            Err(SysError::new(libc::EINVAL))
        );
    }

    #[test]
    fn unmap_twice_is_enoent() {
        let space = address_space(16);
        let a = space.map(anon(2 * PAGE, AccessType::read())).unwrap();
        space.unmap(a, PAGE).expect("error occurred in unmap");
        assert_eq!(space.unmap(a, PAGE), Err(SysError::new(libc::ENOENT)));
        assert_eq!(space.stats().virtual_size, PAGE);
        assert_eq!(space.regions().len(), 1);
    }

    #[test]
    fn deferred_scavenge_reserves_range() {
        let space = context_with(MmConfig {
            frames: 16,
            eager_scavenge: false,
            ..MmConfig::default()
        })
        .new_user_space();
        let h = 0x400000;
        space.map(fixed(h, PAGE, AccessType::read_write())).unwrap();
        space.populate(Addr(h), PAGE, true).unwrap();
        space.unmap(Addr(h), PAGE).unwrap();

        let dead = space.search(Addr(h)).expect("dead region is still reserved");
        assert!(dead.dead);
        assert_eq!(space.stats().virtual_size, 0);
        assert_eq!(
            space.map(fixed(h, PAGE, AccessType::read())),
            Err(SysError::new(libc::ERANGE))
        );
        assert_eq!(space.context().allocator().allocated(), 1);

        assert_eq!(space.scavenge(), 1);
        assert_eq!(space.context().allocator().allocated(), 0);
        assert_eq!(space.stats().physical_size, space.stats().table_pages * PAGE);
        assert_eq!(space.map(fixed(h, PAGE, AccessType::read())), Ok(Addr(h)));
        assert_eq!(space.scavenge(), 0);
    }

    #[test]
    fn random_map_protect_unmap() {
        let space = AddressSpace::create(
            context(16),
            AddrRange {
                start: 0x10000,
                end: 0x10000 + 64 * PAGE,
            },
        );
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let page = 0x10000 + rng.gen_range(0..64) * PAGE;
            let length = rng.gen_range(1..8) * PAGE;
            let res = match rng.gen_range(0..4) {
                0 => space.map(fixed(page, length, AccessType::read_write())).map(|_| ()),
                1 => space.map(anon(length, AccessType::read())).map(|_| ()),
                2 => space.protect(Addr(page), length, AccessType::read()),
                _ => space.unmap(Addr(page), length),
            };
            if let Err(e) = res {
                assert!(
                    [libc::ERANGE, libc::ENOMEM, libc::ENOENT, libc::EINVAL].contains(&e.code()),
                    "unexpected error {:?}",
                    e
                );
            }
            assert_disjoint(&space);
            assert_eq!(space.stats().virtual_size, live_span(&space));
        }
    }

    #[test]
    fn usage_address_space_updates() {
        let space = address_space(16);
        let addr = space
            .map(anon(2 * PAGE, AccessType::read()))
            .expect("error occurred in map");
        assert_eq!(space.stats().virtual_size, live_span(&space));
        space.unmap(addr, PAGE).expect("error occurred in unmap");
        assert_eq!(space.stats().virtual_size, live_span(&space));
        assert_eq!(space.stats().virtual_size, PAGE);
    }

    #[test]
    fn close_destroys_on_last_reference() {
        let space = address_space(16);
        let a = space.map(anon(4 * PAGE, AccessType::read_write())).unwrap();
        space.populate(a, 4 * PAGE, true).unwrap();
        assert_eq!(space.context().allocator().allocated(), 4);

        let other = space.open();
        assert_eq!(space.ref_count(), 2);
        space.close();
        assert!(!other.is_destroyed());

        other.close();
        assert!(space.is_destroyed());
        assert_eq!(space.context().allocator().allocated(), 0);
        let stats = space.stats();
        assert_eq!(stats.physical_size, 0);
        assert_eq!(stats.table_pages, 0);
        assert_eq!(stats.virtual_size, 0);
        assert_eq!(stats.regions, 0);

        assert_eq!(
            space.map(anon(PAGE, AccessType::read())),
            Err(SysError::new(libc::EINVAL))
        );
        assert_eq!(
            space.protect(a, PAGE, AccessType::read()),
            Err(SysError::new(libc::EINVAL))
        );
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn close_underflow_panics() {
        let space = address_space(4);
        space.close();
        space.close();
    }

    #[test]
    fn kernel_space_uses_kernel_bounds() {
        let ctx = context(16);
        let ks = AddressSpace::new_kernel(Arc::clone(&ctx));
        assert!(ks.is_kernel());
        assert_eq!(ks.bounds(), ctx.config().kernel_range());
        let a = ks.map(anon(PAGE, AccessType::read_write())).unwrap();
        assert!(a.0 >= ctx.config().kernel_range().start);
        ks.close();
    }
}
