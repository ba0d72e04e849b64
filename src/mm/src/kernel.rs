use std::sync::{Arc, Mutex, RwLock, Weak};

use anyhow::Context;
use once_cell::sync::OnceCell;
use pgalloc::{FrameAllocator, MemoryFile};
use pgcache::PageCache;
use platform::Platform;
use utils::SysResult;

use crate::{AddressSpace, MmConfig};

/// Collaborators shared by every address space of one kernel.
#[derive(Debug)]
pub struct MemoryContext {
    allocator: Arc<dyn FrameAllocator>,
    page_cache: PageCache,
    platform: Platform,
    config: MmConfig,
    // User address spaces handed out by `new_user_space`.
    spaces: Mutex<Vec<Weak<AddressSpace>>>,
}

impl MemoryContext {
    pub fn new(
        allocator: Arc<dyn FrameAllocator>,
        platform: Platform,
        config: MmConfig,
    ) -> Arc<Self> {
        let page_cache = PageCache::new(Arc::clone(&allocator), config.page_cache_opts());
        Arc::new(Self {
            allocator,
            page_cache,
            platform,
            config,
            spaces: Mutex::new(Vec::new()),
        })
    }

    /// A context backed by a fresh host frame pool sized by `config`.
    pub fn from_config(config: MmConfig) -> SysResult<Arc<Self>> {
        let allocator = MemoryFile::new("vmsim-memory", config.frames)?;
        Ok(Self::new(Arc::new(allocator), Platform::Soft, config))
    }

    pub fn allocator(&self) -> &Arc<dyn FrameAllocator> {
        &self.allocator
    }

    pub fn page_cache(&self) -> &PageCache {
        &self.page_cache
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn config(&self) -> &MmConfig {
        &self.config
    }

    /// A new user address space with one reference.
    pub fn new_user_space(self: &Arc<Self>) -> Arc<AddressSpace> {
        let space = AddressSpace::create(Arc::clone(self), self.config.user_range());
        let mut spaces = self.spaces.lock().unwrap();
        spaces.retain(|s| s.strong_count() > 0);
        spaces.push(Arc::downgrade(&space));
        space
    }

    /// Writes back dirty shared pages of every live user address space.
    pub fn sync_spaces(&self) -> SysResult<()> {
        let spaces: Vec<_> = self
            .spaces
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        let mut first_err = None;
        for space in spaces {
            if let Err(e) = space.sync_all() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
pub struct Kernel {
    ctx: Arc<MemoryContext>,
    address_space: Arc<AddressSpace>,
}

impl Kernel {
    pub fn new(ctx: Arc<MemoryContext>) -> Self {
        let address_space = AddressSpace::new_kernel(Arc::clone(&ctx));
        Self { ctx, address_space }
    }

    pub fn load(config: MmConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let ctx = MemoryContext::from_config(config).context("failed to create frame pool")?;
        Ok(Self::new(ctx))
    }

    pub fn context(&self) -> &Arc<MemoryContext> {
        &self.ctx
    }

    pub fn address_space(&self) -> &Arc<AddressSpace> {
        &self.address_space
    }

    /// Tears down the kernel address space and flushes the page cache,
    /// including stores made through mappings that are still live.
    pub fn shutdown(&self) -> SysResult<()> {
        let res = self.ctx.sync_spaces();
        self.address_space.close();
        self.ctx.page_cache().sync().and(res)
    }
}

static KERNEL: OnceCell<RwLock<Option<Arc<Kernel>>>> = OnceCell::new();

fn slot() -> &'static RwLock<Option<Arc<Kernel>>> {
    KERNEL.get_or_init(|| RwLock::new(None))
}

pub fn init(kernel: Kernel) -> anyhow::Result<Arc<Kernel>> {
    let mut slot = slot().write().expect("failed to acquire write lock");
    if slot.is_some() {
        anyhow::bail!("kernel is already set");
    }
    let kernel = Arc::new(kernel);
    *slot = Some(Arc::clone(&kernel));
    logger::info!("kernel memory context initialized");
    Ok(kernel)
}

pub fn kernel() -> Arc<Kernel> {
    try_kernel().expect("Kernel is not set")
}

pub fn try_kernel() -> Option<Arc<Kernel>> {
    slot().read().expect("failed to acquire read lock").clone()
}

/// Empties the slot and shuts the kernel down.
pub fn teardown() -> anyhow::Result<()> {
    let kernel = slot().write().expect("failed to acquire write lock").take();
    match kernel {
        Some(kernel) => {
            kernel.shutdown().context("failed to flush page cache")?;
            logger::info!("kernel memory context torn down");
            Ok(())
        }
        None => anyhow::bail!("kernel is not set"),
    }
}
