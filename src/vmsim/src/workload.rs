use std::{path::PathBuf, str::FromStr, sync::Arc, thread};

use anyhow::{ensure, Context};
use mem::{AccessType, Addr, PAGE_SIZE};
use memmap::{mmap_opts::MmapOpts, BackingObject, BytesObject, HostFile};
use mm::{AddressSpace, AddressSpaceStats, MemoryContext};
use serde::Serialize;
use utils::SysResult;

const PAGE: u64 = PAGE_SIZE as u64;
const WORKERS: u64 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Workload {
    /// Anonymous private memory touched through copy-in/copy-out.
    Demand,
    /// Writes through a private file mapping.
    Cow,
    /// Writes through a shared file mapping, flushed while still mapped.
    Shared,
    /// Several threads faulting on the same region.
    Threads,
}

impl Workload {
    pub const ALL: [Workload; 4] = [
        Workload::Demand,
        Workload::Cow,
        Workload::Shared,
        Workload::Threads,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Workload::Demand => "demand",
            Workload::Cow => "cow",
            Workload::Shared => "shared",
            Workload::Threads => "threads",
        }
    }
}

impl FromStr for Workload {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Workload::ALL
            .iter()
            .copied()
            .find(|w| w.name() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown workload {}", s))
    }
}

#[derive(Clone, Debug, Default)]
pub struct Options {
    pub pages: u64,
    /// Host file used instead of an in-memory object.
    pub file: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub workload: &'static str,
    /// Usage of the workload's address space just before it was closed.
    pub stats: AddressSpaceStats,
    pub cache_pages: usize,
    pub frames_allocated: u64,
}

/// Runs `workload` in a fresh user address space of `ctx`.
pub fn run(ctx: &Arc<MemoryContext>, workload: Workload, opts: &Options) -> anyhow::Result<Report> {
    ensure!(opts.pages > 0, "a workload needs at least one page");
    logger::info!("running {} over {} pages", workload.name(), opts.pages);

    let space = ctx.new_user_space();
    let res = match workload {
        Workload::Demand => demand(&space, opts.pages),
        Workload::Cow => backing(opts).and_then(|b| cow(&space, b, opts.pages)),
        Workload::Shared => backing(opts).and_then(|b| shared(&space, b, opts.pages)),
        Workload::Threads => threads(&space, opts.pages),
    };
    let stats = space.stats();
    space.close();
    res?;

    Ok(Report {
        workload: workload.name(),
        stats,
        cache_pages: ctx.page_cache().len(),
        frames_allocated: ctx.allocator().allocated(),
    })
}

fn backing(opts: &Options) -> anyhow::Result<Arc<dyn BackingObject>> {
    match &opts.file {
        Some(path) => {
            let file = HostFile::open(path, true)
                .with_context(|| format!("failed to open {:?}", path))?;
            Ok(Arc::new(file))
        }
        None => Ok(Arc::new(BytesObject::new(pattern(opts.pages * PAGE)))),
    }
}

fn pattern(len: u64) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// Contents of the first `len` bytes of `object`, zero-filled past its end.
fn snapshot(object: &Arc<dyn BackingObject>, len: u64) -> anyhow::Result<Vec<u8>> {
    let mut buf = vec![0u8; len as usize];
    object.read(&mut buf, 0)?;
    Ok(buf)
}

fn map(space: &AddressSpace, opts: MmapOpts) -> anyhow::Result<Addr> {
    let length = opts.length;
    let addr = space
        .map(opts)
        .with_context(|| format!("failed to map {:#x} bytes", length))?;
    logger::debug!("mapped {:#x} bytes at {:#x}", length, addr.0);
    Ok(addr)
}

fn demand(space: &AddressSpace, pages: u64) -> anyhow::Result<()> {
    let length = pages * PAGE;
    let addr = map(
        space,
        MmapOpts {
            length,
            private: true,
            perms: AccessType::read_write(),
            ..MmapOpts::default()
        },
    )?;

    let data = pattern(length);
    space.copy_out(addr, &data)?;
    let mut back = vec![0u8; data.len()];
    space.copy_in(addr, &mut back)?;
    ensure!(back == data, "anonymous memory lost its contents");

    let half = (pages / 2).max(1) * PAGE;
    space.protect(addr, half, AccessType::read())?;
    ensure!(
        space.copy_out(addr, &data[..1]).is_err(),
        "write to read-only memory succeeded"
    );
    space.copy_in(addr, &mut back[..1])?;
    space.unmap(addr, length)?;
    Ok(())
}

fn cow(space: &AddressSpace, object: Arc<dyn BackingObject>, pages: u64) -> anyhow::Result<()> {
    let length = pages * PAGE;
    let before = snapshot(&object, length)?;
    let addr = map(
        space,
        MmapOpts {
            length,
            backing: Some(Arc::clone(&object)),
            private: true,
            perms: AccessType::read_write(),
            ..MmapOpts::default()
        },
    )?;

    let mut seen = vec![0u8; length as usize];
    space.copy_in(addr, &mut seen)?;
    ensure!(seen == before, "private mapping does not match its file");

    for page in 0..pages {
        space.copy_out(Addr(addr.0 + page * PAGE), b"cow")?;
    }
    space.copy_in(addr, &mut seen[..3])?;
    ensure!(&seen[..3] == b"cow", "private write was lost");

    space.unmap(addr, length)?;
    space.context().page_cache().sync_object(&object)?;
    ensure!(
        snapshot(&object, length)? == before,
        "private write reached the backing object"
    );
    Ok(())
}

fn shared(space: &AddressSpace, object: Arc<dyn BackingObject>, pages: u64) -> anyhow::Result<()> {
    let length = pages * PAGE;
    let addr = map(
        space,
        MmapOpts {
            length,
            backing: Some(Arc::clone(&object)),
            perms: AccessType::read_write(),
            ..MmapOpts::default()
        },
    )?;

    let marker = b"shared";
    for page in 0..pages {
        space.copy_out(Addr(addr.0 + page * PAGE), marker)?;
    }
    space.sync(addr, length)?;

    // Write-back never grows the object.
    let size = object.size();
    let contents = snapshot(&object, length)?;
    for page in 0..pages {
        let off = page * PAGE;
        if off + marker.len() as u64 > size {
            break;
        }
        let off = off as usize;
        ensure!(
            &contents[off..off + marker.len()] == marker,
            "shared write to page {} was not written back",
            page
        );
    }
    space.unmap(addr, length)?;
    Ok(())
}

fn threads(space: &Arc<AddressSpace>, pages: u64) -> anyhow::Result<()> {
    let length = pages * PAGE;
    let addr = map(
        space,
        MmapOpts {
            length,
            private: true,
            perms: AccessType::read_write(),
            ..MmapOpts::default()
        },
    )?;

    let handles: Vec<_> = (0..WORKERS)
        .map(|id| {
            let space = space.open();
            thread::spawn(move || -> SysResult<()> {
                let res = (0..pages).try_for_each(|page| {
                    let at = Addr(addr.0 + page * PAGE + id * 8);
                    space.copy_out(at, &id.to_le_bytes()).map(|_| ())
                });
                space.close();
                res
            })
        })
        .collect();
    for h in handles {
        h.join()
            .map_err(|_| anyhow::anyhow!("worker thread panicked"))??;
    }

    for page in 0..pages {
        let mut buf = [0u8; (WORKERS * 8) as usize];
        space.copy_in(Addr(addr.0 + page * PAGE), &mut buf)?;
        for (id, word) in buf.chunks(8).enumerate() {
            ensure!(
                word == (id as u64).to_le_bytes(),
                "page {} lost the write of worker {}",
                page,
                id
            );
        }
    }
    space.unmap(addr, length)?;
    Ok(())
}
