//! Instrumented backing object for exercising the page cache and fault paths.

use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use utils::{SysError, SysResult};

use super::{BackingObject, BytesObject};

#[derive(Debug, Default)]
pub struct TestObject {
    inner: BytesObject,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    read_delay: Option<Duration>,
    write_delay: Option<Duration>,
}

impl TestObject {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            inner: BytesObject::new(data),
            ..Self::default()
        }
    }

    /// Every read sleeps for `delay` before touching the data.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.contents()
    }
}

impl BackingObject for TestObject {
    fn read(&self, dst: &mut [u8], offset: u64) -> SysResult<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.read_delay {
            std::thread::sleep(delay);
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SysError::new(libc::EIO));
        }
        self.inner.read(dst, offset)
    }

    fn write(&self, src: &[u8], offset: u64) -> SysResult<usize> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.write_delay {
            std::thread::sleep(delay);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SysError::new(libc::EIO));
        }
        self.inner.write(src, offset)
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }
}
