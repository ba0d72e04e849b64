use std::cmp::min;

use mem::{Addr, AddrRange, Frame, PAGE_SIZE};
use utils::{bail_libc, SysError, SysResult};

use crate::{
    fault::{handle_fault, FaultReason},
    AddressSpace,
};

const PAGE: u64 = PAGE_SIZE as u64;

// A page can be reclaimed between the fault and the access that needed it.
const FAULT_RETRIES: usize = 3;

impl AddressSpace {
    /// Copies `dst.len()` bytes starting at `addr` out of the address space,
    /// faulting pages in as needed.
    pub fn copy_in(&self, addr: Addr, dst: &mut [u8]) -> SysResult<usize> {
        let ar = check_io_range(addr, dst.len())?;
        let allocator = self.context().allocator();
        let mut done = 0;
        for (page, off, len) in chunks(ar) {
            let buf = &mut dst[done..done + len];
            self.access_page(page, false, |frame| {
                allocator.read_frame(frame, off, &mut buf[..])
            })
            .map_err(translate_io_error)?;
            done += len;
        }
        Ok(done)
    }

    /// Copies `src` into the address space at `addr`, breaking copy-on-write
    /// sharing and setting dirty bits as needed.
    pub fn copy_out(&self, addr: Addr, src: &[u8]) -> SysResult<usize> {
        let ar = check_io_range(addr, src.len())?;
        let allocator = self.context().allocator();
        let mut done = 0;
        for (page, off, len) in chunks(ar) {
            let buf = &src[done..done + len];
            self.access_page(page, true, |frame| allocator.write_frame(frame, off, buf))
                .map_err(translate_io_error)?;
            done += len;
        }
        Ok(done)
    }

    /// Faults in every page of the range ahead of use. Returns the number of
    /// pages this call installed.
    pub fn populate(&self, addr: Addr, length: u64, write: bool) -> SysResult<usize> {
        let ar = self.checked_range(addr, length)?;
        let reason = FaultReason {
            missing: true,
            write,
        };
        let mut installed = 0;
        for page in (ar.start..ar.end).step_by(PAGE as usize) {
            if handle_fault(self, Addr(page), reason)?.installed {
                installed += 1;
            }
        }
        Ok(installed)
    }

    fn access_page<F: FnMut(Frame) -> SysResult<()>>(
        &self,
        page: Addr,
        write: bool,
        mut f: F,
    ) -> SysResult<()> {
        let reason = FaultReason {
            missing: true,
            write,
        };
        for _ in 0..FAULT_RETRIES {
            if self.with_page(page, write, &mut f)? {
                return Ok(());
            }
            handle_fault(self, page, reason)?;
        }
        bail_libc!(libc::EFAULT)
    }
}

fn check_io_range(addr: Addr, len: usize) -> SysResult<AddrRange> {
    addr.to_range(len as u64)
        .ok_or_else(|| SysError::new(libc::EFAULT))
}

// (page, offset in page, length) for each page touched by `ar`.
fn chunks(ar: AddrRange) -> impl Iterator<Item = (Addr, usize, usize)> {
    let mut cur = ar.start;
    std::iter::from_fn(move || {
        if cur >= ar.end {
            return None;
        }
        let addr = Addr(cur);
        let off = addr.page_offset();
        let len = min(PAGE - off, ar.end - cur);
        cur += len;
        Some((addr.round_down(), off as usize, len as usize))
    })
}

fn translate_io_error(err: SysError) -> SysError {
    logger::warn!("MM I/O error: {:?}", err);
    SysError::new(libc::EFAULT)
}
