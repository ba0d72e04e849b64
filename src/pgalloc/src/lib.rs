mod usage;

pub use usage::{MemoryKind, MemoryUsage};

use std::fs::File as StdFile;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::Mutex;

use mem::{Frame, PAGE_SIZE};
use segment::{Set, SetOperations};
use utils::{bail_libc, mem::create_mem_fd, Range, SysError, SysResult};

const PAGE: u64 = PAGE_SIZE as u64;

/// Source of physical page frames.
///
/// Frames handed out by `allocate` are owned by the caller until passed back
/// to `release`. Contents of a fresh frame are unspecified; use
/// `allocate_zeroed` where the frame becomes visible to a task.
pub trait FrameAllocator: Send + Sync + std::fmt::Debug {
    fn allocate(&self, kind: MemoryKind) -> SysResult<Frame>;
    fn release(&self, frame: Frame);
    fn read_frame(&self, frame: Frame, offset: usize, dst: &mut [u8]) -> SysResult<()>;
    fn write_frame(&self, frame: Frame, offset: usize, src: &[u8]) -> SysResult<()>;
    fn copy_frame(&self, dst: Frame, src: Frame) -> SysResult<()>;
    fn zero_frame(&self, frame: Frame) -> SysResult<()>;
    /// Number of frames currently allocated.
    fn allocated(&self) -> u64;

    fn allocate_zeroed(&self, kind: MemoryKind) -> SysResult<Frame> {
        let frame = self.allocate(kind)?;
        if let Err(e) = self.zero_frame(frame) {
            self.release(frame);
            return Err(e);
        }
        Ok(frame)
    }
}

#[derive(PartialEq, Copy, Clone, Debug)]
struct UsageInfo {
    kind: MemoryKind,
}

// Keyed by frame number.
type UsageSet = Set<u64, UsageInfo>;

struct UsageInfoSetOperations;
impl SetOperations for UsageInfoSetOperations {
    type K = u64;
    type V = UsageInfo;
    fn merge(
        &self,
        _: Range<Self::K>,
        v1: &Self::V,
        _: Range<Self::K>,
        v2: &Self::V,
    ) -> Option<Self::V> {
        if v1 == v2 {
            Some(*v1)
        } else {
            None
        }
    }

    fn split(&self, _: Range<Self::K>, v: &Self::V, _: Self::K) -> (Self::V, Self::V) {
        (*v, *v)
    }
}

/// Frames carved out of a memfd that is mapped once into the host address
/// space. Frame `n` lives at byte offset `n * PAGE_SIZE` of the file.
#[derive(Debug)]
pub struct MemoryFile {
    file: StdFile,
    base: usize,
    frames: u64,
    usage: Mutex<UsageSet>,
    accounting: MemoryUsage,
}

impl MemoryFile {
    pub fn new(name: &str, frames: u64) -> SysResult<Self> {
        let fd = create_mem_fd(name, 0).map_err(SysError::from_nix_errno)?;
        let file = unsafe { StdFile::from_raw_fd(fd) };
        Self::from_file(file, frames)
    }

    pub fn from_file(file: StdFile, frames: u64) -> SysResult<Self> {
        if frames == 0 {
            bail_libc!(libc::EINVAL);
        }
        let len = frames
            .checked_mul(PAGE)
            .ok_or_else(|| SysError::new(libc::EINVAL))?;
        file.set_len(len).map_err(SysError::from_io_error)?;
        let m = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if m == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            logger::warn!("failed to map MemoryFile of {} frames: {}", frames, err);
            return Err(SysError::from_io_error(err));
        }
        logger::debug!("MemoryFile: {} frames mapped at {:p}", frames, m);
        Ok(MemoryFile {
            file,
            base: m as usize,
            frames,
            usage: Mutex::new(UsageSet::new(Box::new(UsageInfoSetOperations))),
            accounting: MemoryUsage::default(),
        })
    }

    pub fn usage(&self) -> &MemoryUsage {
        &self.accounting
    }

    // Host address of byte `offset` in `frame`, checking that `len` bytes fit.
    fn frame_ptr(&self, frame: Frame, offset: usize, len: usize) -> SysResult<*mut u8> {
        if frame.0 >= self.frames || offset + len > PAGE as usize {
            bail_libc!(libc::EFAULT);
        }
        Ok((self.base + (frame.0 * PAGE) as usize + offset) as *mut u8)
    }
}

impl Drop for MemoryFile {
    fn drop(&mut self) {
        let len = (self.frames * PAGE) as usize;
        if unsafe { libc::munmap(self.base as *mut libc::c_void, len) } < 0 {
            logger::warn!("failed to unmap MemoryFile");
        }
    }
}

impl FrameAllocator for MemoryFile {
    fn allocate(&self, kind: MemoryKind) -> SysResult<Frame> {
        let mut usage = self.usage.lock().unwrap();
        let pfn = find_available_frame(&usage, self.frames)
            .ok_or_else(|| SysError::new(libc::ENOMEM))?;
        usage.insert(
            Range {
                start: pfn,
                end: pfn + 1,
            },
            UsageInfo { kind },
        );
        self.accounting.inc(PAGE, kind);
        Ok(Frame(pfn))
    }

    fn release(&self, frame: Frame) {
        let mut usage = self.usage.lock().unwrap();
        let seg = usage
            .find_segment(frame.0)
            .unwrap_or_else(|| panic!("release of unallocated frame {}", frame));
        let seg = usage.isolate(
            &seg,
            Range {
                start: frame.0,
                end: frame.0 + 1,
            },
        );
        let (_, info) = usage
            .remove(seg.start())
            .unwrap_or_else(|| panic!("isolated frame {} vanished", frame));
        self.accounting.dec(PAGE, info.kind);
    }

    fn read_frame(&self, frame: Frame, offset: usize, dst: &mut [u8]) -> SysResult<()> {
        let src = self.frame_ptr(frame, offset, dst.len())?;
        unsafe { std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    fn write_frame(&self, frame: Frame, offset: usize, src: &[u8]) -> SysResult<()> {
        let dst = self.frame_ptr(frame, offset, src.len())?;
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        Ok(())
    }

    fn copy_frame(&self, dst: Frame, src: Frame) -> SysResult<()> {
        if dst == src {
            return Ok(());
        }
        let s = self.frame_ptr(src, 0, PAGE as usize)?;
        let d = self.frame_ptr(dst, 0, PAGE as usize)?;
        unsafe { std::ptr::copy_nonoverlapping(s, d, PAGE as usize) };
        Ok(())
    }

    fn zero_frame(&self, frame: Frame) -> SysResult<()> {
        let p = self.frame_ptr(frame, 0, PAGE as usize)?;
        unsafe { std::ptr::write_bytes(p, 0, PAGE as usize) };
        Ok(())
    }

    fn allocated(&self) -> u64 {
        self.usage.lock().unwrap().span()
    }
}

fn find_available_frame(usage: &UsageSet, frames: u64) -> Option<u64> {
    usage.first_fit(
        Range {
            start: 0,
            end: frames,
        },
        1,
    )
}
