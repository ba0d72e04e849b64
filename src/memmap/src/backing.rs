use std::{
    fs::{File as StdFile, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::RwLock,
};

use utils::{SysError, SysResult};

/// Storage behind a file mapping.
///
/// The page cache only ever reads and writes whole pages through this
/// interface. A read past the end returns fewer bytes than requested.
pub trait BackingObject: Send + Sync + std::fmt::Debug {
    fn read(&self, dst: &mut [u8], offset: u64) -> SysResult<usize>;
    fn write(&self, src: &[u8], offset: u64) -> SysResult<usize>;
    fn size(&self) -> u64;
}

#[derive(Debug)]
pub struct HostFile {
    file: StdFile,
    path: PathBuf,
}

impl HostFile {
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> SysResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(SysError::from_io_error)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl BackingObject for HostFile {
    fn read(&self, dst: &mut [u8], offset: u64) -> SysResult<usize> {
        let mut done = 0;
        while done < dst.len() {
            match self.file.read_at(&mut dst[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    logger::warn!("read of {:?} at {:#x} failed: {}", self.path, offset, e);
                    return Err(SysError::from_io_error(e));
                }
            }
        }
        Ok(done)
    }

    fn write(&self, src: &[u8], offset: u64) -> SysResult<usize> {
        self.file.write_all_at(src, offset).map_err(|e| {
            logger::warn!("write of {:?} at {:#x} failed: {}", self.path, offset, e);
            SysError::from_io_error(e)
        })?;
        Ok(src.len())
    }

    fn size(&self) -> u64 {
        self.file.metadata().map(|m| m.len()).unwrap_or(0)
    }
}

/// Growable in-memory object, used for anonymous shared memory and tests.
#[derive(Debug, Default)]
pub struct BytesObject {
    data: RwLock<Vec<u8>>,
}

impl BytesObject {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.read().unwrap().clone()
    }
}

impl BackingObject for BytesObject {
    fn read(&self, dst: &mut [u8], offset: u64) -> SysResult<usize> {
        let data = self.data.read().unwrap();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = std::cmp::min(dst.len(), data.len() - offset);
        dst[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, src: &[u8], offset: u64) -> SysResult<usize> {
        let mut data = self.data.write().unwrap();
        let offset = offset as usize;
        let end = offset + src.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(src);
        Ok(src.len())
    }

    fn size(&self) -> u64 {
        self.data.read().unwrap().len() as u64
    }
}
