//! Demand paging and copy-on-write.
//!
//! The resolver keeps no state of its own: the address space supplies the
//! region and the memory context supplies the allocator and page cache.

use mem::{Addr, Frame};
use pgalloc::MemoryKind;
use utils::{SysError, SysResult};

use crate::{address_space::FaultTarget, kernel::MemoryContext, region::PageOwner, AddressSpace};

/// Why the faulting access trapped. Both may be set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultReason {
    /// No translation for the page.
    pub missing: bool,
    /// The access was a store.
    pub write: bool,
}

impl FaultReason {
    pub const MISSING: Self = Self {
        missing: true,
        write: false,
    };
    pub const WRITE: Self = Self {
        missing: false,
        write: true,
    };
    pub const MISSING_WRITE: Self = Self {
        missing: true,
        write: true,
    };
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultOutcome {
    /// This call installed the translation.
    pub installed: bool,
    /// The page was read from its backing object.
    pub did_io: bool,
    /// A private copy replaced a shared copy-on-write page.
    pub copied: bool,
}

/// Resolves a fault at `addr`. An error is fatal for the faulting access:
/// a segmentation violation when no region allows the access, or the
/// allocator or backing I/O error that stopped the resolution.
pub fn handle_fault(space: &AddressSpace, addr: Addr, reason: FaultReason) -> SysResult<FaultOutcome> {
    let res = resolve(space, addr, reason);
    if let Err(e) = &res {
        logger::warn!("fault at {} ({:?}) failed: {}", addr, reason, e);
    }
    res
}

fn resolve(space: &AddressSpace, addr: Addr, reason: FaultReason) -> SysResult<FaultOutcome> {
    let page = addr.round_down();
    let target = space
        .fault_target(page)
        .ok_or_else(|| SysError::seg_fault(addr.0))?;
    if !target.perms.any() || (reason.write && !target.perms.write) {
        return Err(SysError::seg_fault(addr.0));
    }

    let mut outcome = FaultOutcome::default();
    let mut pte = target.pte;
    if pte.is_none() {
        outcome = fill(space, page, &target, reason.write && !target.cow)?;
        pte = space.pte(page);
    }
    if reason.write {
        match pte {
            Some(p) if p.flags.cow => {
                outcome.copied = copy_on_write(space, page, &target, p.frame)?;
            }
            Some(_) => space.mark_dirty(page),
            None => return Err(SysError::seg_fault(addr.0)),
        }
    }
    Ok(outcome)
}

// Obtains a frame for a missing page and installs it.
fn fill(
    space: &AddressSpace,
    page: Addr,
    target: &FaultTarget,
    dirty: bool,
) -> SysResult<FaultOutcome> {
    let ctx = space.context();
    let (frame, owner, did_io) = if target.phys {
        (Frame::containing(target.offset), PageOwner::Physical, false)
    } else if let Some(object) = &target.backing {
        let fetched = ctx.page_cache().fetch(object, target.offset)?;
        (fetched.frame, PageOwner::Cache, fetched.did_io)
    } else {
        let frame = ctx.allocator().allocate_zeroed(MemoryKind::Anonymous)?;
        (frame, PageOwner::Private, false)
    };

    match space.install(page, frame, owner, target, dirty) {
        Ok(true) => {
            space.faults.record_fill(did_io);
            Ok(FaultOutcome {
                installed: true,
                did_io,
                copied: false,
            })
        }
        Ok(false) => {
            give_back(ctx, target, frame, owner);
            Ok(FaultOutcome {
                did_io,
                ..FaultOutcome::default()
            })
        }
        Err(e) => {
            give_back(ctx, target, frame, owner);
            Err(e)
        }
    }
}

fn give_back(ctx: &MemoryContext, target: &FaultTarget, frame: Frame, owner: PageOwner) {
    match (owner, &target.backing) {
        (PageOwner::Cache, Some(object)) => ctx.page_cache().release(object, target.offset, false),
        (PageOwner::Private, _) => ctx.allocator().release(frame),
        _ => {}
    }
}

// Replaces the shared frame `shared` at `page` with a private copy. Returns
// false if another thread changed the page first.
fn copy_on_write(
    space: &AddressSpace,
    page: Addr,
    target: &FaultTarget,
    shared: Frame,
) -> SysResult<bool> {
    let ctx = space.context();
    let object = target
        .backing
        .as_ref()
        .ok_or_else(|| SysError::seg_fault(page.0))?;
    // Pin the shared page while copying out of it.
    let pinned = ctx.page_cache().fetch(object, target.offset)?;
    let res = if pinned.frame == shared {
        copy_and_replace(space, page, target, shared)
    } else {
        Ok(false)
    };
    ctx.page_cache().release(object, target.offset, false);
    if let Ok(true) = res {
        // The reference that the shared translation held.
        ctx.page_cache().release(object, target.offset, false);
        space.faults.record_cow();
        logger::trace!("copy-on-write of {} from {}", page, shared);
    }
    res
}

fn copy_and_replace(
    space: &AddressSpace,
    page: Addr,
    target: &FaultTarget,
    shared: Frame,
) -> SysResult<bool> {
    let allocator = space.context().allocator();
    let copy = allocator.allocate(MemoryKind::Anonymous)?;
    let res = allocator
        .copy_frame(copy, shared)
        .and_then(|()| space.replace_cow(page, target, shared, copy));
    if !matches!(res, Ok(true)) {
        allocator.release(copy);
    }
    res
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Barrier},
        thread,
        time::Duration,
    };

    use mem::{AccessType, PAGE_SIZE};
    use memmap::{mmap_opts::MmapOpts, testing::TestObject, BackingObject};

    use super::*;
    use crate::address_space::tests::address_space;

    const PAGE: u64 = PAGE_SIZE as u64;

    fn pattern(pages: u64) -> Vec<u8> {
        (0..pages * PAGE).map(|i| (i / PAGE + 1) as u8).collect()
    }

    fn file_map(
        space: &AddressSpace,
        object: &Arc<TestObject>,
        pages: u64,
        private: bool,
    ) -> Addr {
        let backing: Arc<dyn BackingObject> = object.clone();
        space
            .map(MmapOpts {
                length: pages * PAGE,
                backing: Some(backing),
                private,
                perms: AccessType::read_write(),
                ..MmapOpts::default()
            })
            .expect("error occurred in map")
    }

    fn frame_bytes(space: &AddressSpace, frame: Frame) -> Vec<u8> {
        let mut buf = vec![0u8; PAGE as usize];
        space
            .context()
            .allocator()
            .read_frame(frame, 0, &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn anonymous_fault_zero_fills() {
        let space = address_space(8);
        let a = space
            .map(MmapOpts {
                length: 2 * PAGE,
                private: true,
                perms: AccessType::read_write(),
                ..MmapOpts::default()
            })
            .unwrap();
        let out = handle_fault(&space, Addr(a.0 + 0x123), FaultReason::MISSING).unwrap();
        assert_eq!(
            out,
            FaultOutcome {
                installed: true,
                did_io: false,
                copied: false
            }
        );
        let pte = space.pte(a).expect("no translation after fault");
        assert_eq!(frame_bytes(&space, pte.frame), vec![0u8; PAGE as usize]);
        assert_eq!(pte.flags.perms, AccessType::read_write());

        // Already resident.
        let out = handle_fault(&space, a, FaultReason::MISSING).unwrap();
        assert!(!out.installed);

        let stats = space.stats();
        assert_eq!(stats.soft_faults, 1);
        assert_eq!(stats.hard_faults, 0);
        assert_eq!(stats.physical_size, PAGE * (1 + stats.table_pages));
        assert_eq!(stats.shared_size, 0);
    }

    #[test]
    fn file_fault_is_hard_then_soft() {
        let object = Arc::new(TestObject::new(pattern(2)));
        let space = address_space(8);
        let a = file_map(&space, &object, 2, false);
        let out = handle_fault(&space, Addr(a.0 + PAGE), FaultReason::MISSING).unwrap();
        assert!(out.installed && out.did_io);

        // Another address space mapping the same object hits the cache.
        let other = AddressSpace::create(Arc::clone(space.context()), space.bounds());
        let b = file_map(&other, &object, 2, false);
        let out = handle_fault(&other, Addr(b.0 + PAGE), FaultReason::MISSING).unwrap();
        assert!(out.installed && !out.did_io);
        assert_eq!(object.reads(), 1);
        assert_eq!(space.pte(Addr(a.0 + PAGE)).unwrap().frame, other.pte(Addr(b.0 + PAGE)).unwrap().frame);

        let backing: Arc<dyn BackingObject> = object.clone();
        assert_eq!(space.context().page_cache().ref_count(&backing, PAGE), Some(2));
        assert_eq!(space.stats().hard_faults, 1);
        assert_eq!(other.stats().soft_faults, 1);
        assert_eq!(space.stats().shared_size, PAGE);
        other.close();
        space.close();
        assert_eq!(space.context().page_cache().ref_count(&backing, PAGE), Some(0));
        assert!(space.context().page_cache().in_lru(&backing, PAGE));
    }

    #[test]
    fn cow_write_copies_page() {
        let object = Arc::new(TestObject::new(pattern(1)));
        let backing: Arc<dyn BackingObject> = object.clone();
        let space = address_space(8);
        let a = file_map(&space, &object, 1, true);
        let cache = space.context().page_cache();

        handle_fault(&space, a, FaultReason::MISSING).unwrap();
        let shared = space.pte(a).unwrap();
        assert!(shared.flags.cow);
        assert!(!shared.flags.perms.write);
        assert_eq!(cache.ref_count(&backing, 0), Some(1));

        let out = handle_fault(&space, a, FaultReason::WRITE).unwrap();
        assert!(out.copied && !out.installed);
        let private = space.pte(a).unwrap();
        assert_ne!(private.frame, shared.frame);
        assert!(!private.flags.cow);
        assert!(private.flags.perms.write);
        assert_eq!(frame_bytes(&space, private.frame), frame_bytes(&space, shared.frame));
        assert_eq!(cache.ref_count(&backing, 0), Some(0));

        let stats = space.stats();
        assert_eq!(stats.cow_faults, 1);
        assert_eq!(stats.shared_size, 0);

        // A second write fault finds a private page and copies nothing.
        let out = handle_fault(&space, a, FaultReason::WRITE).unwrap();
        assert!(!out.copied);
        space.close();
        assert_eq!(object.writes(), 0);
    }

    #[test]
    fn missing_write_on_cow_region_fills_and_copies() {
        let object = Arc::new(TestObject::new(pattern(1)));
        let space = address_space(8);
        let a = file_map(&space, &object, 1, true);
        let out = handle_fault(&space, a, FaultReason::MISSING_WRITE).unwrap();
        assert!(out.installed && out.did_io && out.copied);
        let pte = space.pte(a).unwrap();
        assert!(!pte.flags.cow);
        assert_eq!(frame_bytes(&space, pte.frame), pattern(1));
        // Shared frame stays cached, the copy is private.
        assert_eq!(space.context().allocator().allocated(), 2);
    }

    #[test]
    fn disallowed_faults_are_seg_faults() {
        let space = address_space(8);
        let ro = space
            .map(MmapOpts {
                length: PAGE,
                private: true,
                perms: AccessType::read(),
                ..MmapOpts::default()
            })
            .unwrap();
        let none = space
            .map(MmapOpts {
                length: PAGE,
                private: true,
                ..MmapOpts::default()
            })
            .unwrap();
        let unmapped = Addr(space.bounds().end - PAGE);

        for (addr, reason) in &[
            (ro, FaultReason::MISSING_WRITE),
            (none, FaultReason::MISSING),
            (unmapped, FaultReason::MISSING),
        ] {
            let err = handle_fault(&space, *addr, *reason).unwrap_err();
            assert!(err.is_seg_fault(), "{} {:?}: {:?}", addr, reason, err);
            assert_eq!(err.code(), libc::EFAULT);
        }
        assert_eq!(space.context().allocator().allocated(), 0);
    }

    #[test]
    fn cow_region_without_write_refuses_write() {
        let object = Arc::new(TestObject::new(pattern(1)));
        let space = address_space(8);
        let a = file_map(&space, &object, 1, true);
        handle_fault(&space, a, FaultReason::MISSING).unwrap();
        space.protect(a, PAGE, AccessType::read()).unwrap();
        assert!(handle_fault(&space, a, FaultReason::WRITE)
            .unwrap_err()
            .is_seg_fault());
        assert!(space.pte(a).unwrap().flags.cow);
    }

    #[test]
    fn dead_region_refuses_faults() {
        let space = crate::address_space::tests::context_with(crate::MmConfig {
            frames: 8,
            eager_scavenge: false,
            ..crate::MmConfig::default()
        })
        .new_user_space();
        let a = space
            .map(MmapOpts {
                length: PAGE,
                private: true,
                perms: AccessType::read(),
                ..MmapOpts::default()
            })
            .unwrap();
        space.unmap(a, PAGE).unwrap();
        assert!(handle_fault(&space, a, FaultReason::MISSING)
            .unwrap_err()
            .is_seg_fault());
    }

    #[test]
    fn failed_read_is_fatal_and_leaves_nothing() {
        let object = Arc::new(TestObject::new(pattern(1)));
        object.set_fail_reads(true);
        let space = address_space(8);
        let a = file_map(&space, &object, 1, false);
        let err = handle_fault(&space, a, FaultReason::MISSING).unwrap_err();
        assert_eq!(err, SysError::new(libc::EIO));
        assert!(space.pte(a).is_none());
        assert!(space.context().page_cache().is_empty());
        assert_eq!(space.context().allocator().allocated(), 0);
        assert_eq!(space.stats().physical_size, 0);

        object.set_fail_reads(false);
        assert!(handle_fault(&space, a, FaultReason::MISSING).unwrap().did_io);
        assert_eq!(object.reads(), 2);
    }

    #[test]
    fn exhausted_allocator_is_fatal() {
        let space = address_space(1);
        let a = space
            .map(MmapOpts {
                length: 2 * PAGE,
                private: true,
                perms: AccessType::read_write(),
                ..MmapOpts::default()
            })
            .unwrap();
        handle_fault(&space, a, FaultReason::MISSING).unwrap();
        assert_eq!(
            handle_fault(&space, Addr(a.0 + PAGE), FaultReason::MISSING),
            Err(SysError::new(libc::ENOMEM))
        );
        assert!(space.pte(Addr(a.0 + PAGE)).is_none());
    }

    #[test]
    fn physical_region_maps_fixed_frames() {
        let space = address_space(8);
        let a = space
            .map(MmapOpts {
                length: 2 * PAGE,
                offset: 0x5000,
                phys: true,
                perms: AccessType::read_write(),
                ..MmapOpts::default()
            })
            .unwrap();
        handle_fault(&space, Addr(a.0 + PAGE), FaultReason::MISSING_WRITE).unwrap();
        let pte = space.pte(Addr(a.0 + PAGE)).unwrap();
        assert_eq!(pte.frame, Frame(6));
        assert!(pte.flags.dirty);
        assert_eq!(space.context().allocator().allocated(), 0);

        space.unmap(a, 2 * PAGE).unwrap();
        assert_eq!(space.context().allocator().allocated(), 0);
    }

    #[test]
    fn concurrent_faults_read_once() {
        const THREADS: usize = 8;
        let object = Arc::new(
            TestObject::new(pattern(1)).with_read_delay(Duration::from_millis(50)),
        );
        let space = address_space(16);
        let a = file_map(&space, &object, 1, false);
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let space = space.open();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let out = handle_fault(&space, a, FaultReason::MISSING).unwrap();
                    space.close();
                    out.installed
                })
            })
            .collect();
        let installed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|installed| *installed)
            .count();

        assert_eq!(installed, 1);
        assert_eq!(object.reads(), 1);
        let backing: Arc<dyn BackingObject> = object.clone();
        assert_eq!(space.context().page_cache().ref_count(&backing, 0), Some(1));
        assert_eq!(space.search(a).unwrap().resident, 1);
    }
}
