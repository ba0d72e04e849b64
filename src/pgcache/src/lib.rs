use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use mem::{is_page_aligned, Frame, PAGE_SIZE};
use memmap::BackingObject;
use pgalloc::{FrameAllocator, MemoryKind};
use utils::{bail_libc, SysError, SysResult};

const PAGE: u64 = PAGE_SIZE as u64;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct PageKey {
    object: usize,
    offset: u64,
}

impl PageKey {
    fn new(object: &Arc<dyn BackingObject>, offset: u64) -> Self {
        Self {
            object: Arc::as_ptr(object) as *const () as usize,
            offset,
        }
    }
}

#[derive(Debug)]
enum PageState {
    Loading,
    Ready,
    Failed(SysError),
}

#[derive(Debug)]
struct CachedPage {
    object: Arc<dyn BackingObject>,
    offset: u64,
    frame: Frame,
    dirty: AtomicBool,
    // Held across the backing read and across write-back.
    state: Mutex<PageState>,
}

#[derive(Debug)]
struct Entry {
    page: Arc<CachedPage>,
    refs: usize,
    lru_tick: Option<u64>,
}

#[derive(Debug, Default)]
struct Inner {
    pages: HashMap<PageKey, Entry>,
    // Unreferenced pages, oldest release first.
    lru: BTreeMap<u64, PageKey>,
    tick: u64,
}

impl Inner {
    fn push_lru(&mut self, key: PageKey) {
        self.tick += 1;
        let tick = self.tick;
        let entry = self
            .pages
            .get_mut(&key)
            .unwrap_or_else(|| panic!("LRU insert of uncached page {:?}", key));
        entry.lru_tick = Some(tick);
        self.lru.insert(tick, key);
    }
}

/// Result of [`PageCache::fetch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fetched {
    pub frame: Frame,
    /// Whether this call read the page from its backing object.
    pub did_io: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct PageCacheOpts {
    /// Pages evicted per round when the allocator runs dry.
    pub evict_batch: usize,
    /// Unreferenced pages kept resident before `fetch` trims the LRU.
    pub lru_high_watermark: usize,
}

impl Default for PageCacheOpts {
    fn default() -> Self {
        Self {
            evict_batch: 32,
            lru_high_watermark: 1024,
        }
    }
}

/// Reference-counted, write-back cache of backing object pages.
///
/// Lock order is page state mutex, then the cache lock. The cache lock is
/// never held across backing I/O.
#[derive(Debug)]
pub struct PageCache {
    allocator: Arc<dyn FrameAllocator>,
    inner: Mutex<Inner>,
    opts: PageCacheOpts,
}

impl PageCache {
    pub fn new(allocator: Arc<dyn FrameAllocator>, opts: PageCacheOpts) -> Self {
        Self {
            allocator,
            inner: Mutex::new(Inner::default()),
            opts,
        }
    }

    pub fn allocator(&self) -> &Arc<dyn FrameAllocator> {
        &self.allocator
    }

    /// Returns the frame caching page `offset` of `object`, taking a
    /// reference on it. Concurrent callers for the same page share a single
    /// backing read.
    pub fn fetch(&self, object: &Arc<dyn BackingObject>, offset: u64) -> SysResult<Fetched> {
        if !is_page_aligned(offset) {
            bail_libc!(libc::EINVAL);
        }
        let key = PageKey::new(object, offset);
        if let Some(page) = self.try_get(key) {
            return Self::wait_ready(&page).map(|frame| Fetched {
                frame,
                did_io: false,
            });
        }

        self.trim_lru();
        let frame = self.allocate_frame()?;
        let page = Arc::new(CachedPage {
            object: Arc::clone(object),
            offset,
            frame,
            dirty: AtomicBool::new(false),
            state: Mutex::new(PageState::Loading),
        });
        let mut state = page.state.lock().unwrap();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.pages.contains_key(&key) {
                // Lost the race against another loader.
                drop(inner);
                drop(state);
                self.allocator.release(frame);
                return self.fetch(object, offset);
            }
            inner.pages.insert(
                key,
                Entry {
                    page: Arc::clone(&page),
                    refs: 1,
                    lru_tick: None,
                },
            );
        }

        logger::debug!("page cache miss: object {:#x} offset {:#x}", key.object, offset);
        match self.fill(&page) {
            Ok(()) => {
                *state = PageState::Ready;
                Ok(Fetched { frame, did_io: true })
            }
            Err(e) => {
                logger::warn!(
                    "page cache read of object {:#x} offset {:#x} failed: {}",
                    key.object,
                    offset,
                    e
                );
                *state = PageState::Failed(e.clone());
                self.inner.lock().unwrap().pages.remove(&key);
                drop(state);
                self.allocator.release(frame);
                Err(e)
            }
        }
    }

    // Takes a reference on a cached page and pulls it off the LRU.
    fn try_get(&self, key: PageKey) -> Option<Arc<CachedPage>> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.pages.get_mut(&key)?;
        entry.refs += 1;
        let tick = entry.lru_tick.take();
        let page = Arc::clone(&entry.page);
        if let Some(tick) = tick {
            inner.lru.remove(&tick);
        }
        Some(page)
    }

    fn wait_ready(page: &CachedPage) -> SysResult<Frame> {
        let state = page.state.lock().unwrap_or_else(|e| e.into_inner());
        match &*state {
            PageState::Ready => Ok(page.frame),
            PageState::Failed(e) => Err(e.clone()),
            PageState::Loading => Err(SysError::new(libc::EIO)),
        }
    }

    fn fill(&self, page: &CachedPage) -> SysResult<()> {
        let mut buf = vec![0u8; PAGE as usize];
        let n = page.object.read(&mut buf, page.offset)?;
        if n < buf.len() {
            buf[n..].iter_mut().for_each(|b| *b = 0);
        }
        self.allocator.write_frame(page.frame, 0, &buf)
    }

    fn allocate_frame(&self) -> SysResult<Frame> {
        match self.allocator.allocate(MemoryKind::PageCache) {
            Err(e) if e.code() == libc::ENOMEM => {
                if self.evict(self.opts.evict_batch) == 0 {
                    return Err(e);
                }
                self.allocator.allocate(MemoryKind::PageCache)
            }
            res => res,
        }
    }

    fn trim_lru(&self) {
        let excess = self
            .lru_len()
            .saturating_sub(self.opts.lru_high_watermark);
        if excess > 0 {
            self.evict(excess);
        }
    }

    /// Drops one reference on a cached page, recording `dirty` if set. The
    /// page moves to the LRU when its last reference goes away.
    pub fn release(&self, object: &Arc<dyn BackingObject>, offset: u64, dirty: bool) {
        let key = PageKey::new(object, offset);
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .pages
            .get_mut(&key)
            .unwrap_or_else(|| panic!("release of uncached page {:?}", key));
        if entry.refs == 0 {
            panic!("page cache refcount underflow for {:?}", key);
        }
        if dirty {
            entry.page.dirty.store(true, Ordering::SeqCst);
        }
        entry.refs -= 1;
        if entry.refs == 0 {
            inner.push_lru(key);
        }
    }

    pub fn mark_dirty(&self, object: &Arc<dyn BackingObject>, offset: u64) {
        let key = PageKey::new(object, offset);
        if let Some(entry) = self.inner.lock().unwrap().pages.get(&key) {
            entry.page.dirty.store(true, Ordering::SeqCst);
        }
    }

    /// Evicts up to `max_count` unreferenced pages, oldest first, writing
    /// dirty ones back. Returns the number of frames freed.
    pub fn evict(&self, max_count: usize) -> usize {
        let mut evicted = 0;
        for _ in 0..max_count {
            let (key, page) = {
                let mut inner = self.inner.lock().unwrap();
                let tick = match inner.lru.keys().next() {
                    Some(tick) => *tick,
                    None => break,
                };
                let key = inner.lru.remove(&tick).unwrap_or_else(|| {
                    panic!("LRU tick {} vanished under the cache lock", tick)
                });
                let entry = inner
                    .pages
                    .get_mut(&key)
                    .unwrap_or_else(|| panic!("LRU holds uncached page {:?}", key));
                entry.lru_tick = None;
                (key, Arc::clone(&entry.page))
            };

            let state = page.state.lock().unwrap();
            if let Err(e) = self.write_back(&page) {
                logger::warn!(
                    "write-back of object {:#x} offset {:#x} failed: {}",
                    key.object,
                    page.offset,
                    e
                );
                let mut inner = self.inner.lock().unwrap();
                let requeue = inner
                    .pages
                    .get(&key)
                    .map_or(false, |e| e.refs == 0 && e.lru_tick.is_none());
                if requeue {
                    inner.push_lru(key);
                }
                continue;
            }
            let mut inner = self.inner.lock().unwrap();
            let removable = inner
                .pages
                .get(&key)
                .map_or(false, |e| e.refs == 0 && e.lru_tick.is_none());
            if removable {
                inner.pages.remove(&key);
                drop(inner);
                drop(state);
                self.allocator.release(page.frame);
                evicted += 1;
            }
        }
        if evicted > 0 {
            logger::debug!("page cache evicted {} pages", evicted);
        }
        evicted
    }

    // Caller holds the page state lock.
    fn write_back(&self, page: &CachedPage) -> SysResult<()> {
        if !page.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let res = self.write_page(page);
        if res.is_err() {
            page.dirty.store(true, Ordering::SeqCst);
        }
        res
    }

    fn write_page(&self, page: &CachedPage) -> SysResult<()> {
        let size = page.object.size();
        if page.offset >= size {
            return Ok(());
        }
        let len = std::cmp::min(PAGE, size - page.offset) as usize;
        let mut buf = vec![0u8; len];
        self.allocator.read_frame(page.frame, 0, &mut buf)?;
        page.object.write(&buf, page.offset)?;
        Ok(())
    }

    /// Writes back every dirty page of `object` without evicting it.
    pub fn sync_object(&self, object: &Arc<dyn BackingObject>) -> SysResult<()> {
        let id = PageKey::new(object, 0).object;
        self.sync_matching(|key| key.object == id)
    }

    /// Writes back every dirty page in the cache without evicting it.
    pub fn sync(&self) -> SysResult<()> {
        self.sync_matching(|_| true)
    }

    fn sync_matching<F: Fn(&PageKey) -> bool>(&self, matches: F) -> SysResult<()> {
        let pages: Vec<_> = {
            let inner = self.inner.lock().unwrap();
            inner
                .pages
                .iter()
                .filter(|(k, _)| matches(k))
                .map(|(_, e)| Arc::clone(&e.page))
                .collect()
        };
        let mut first_err = None;
        for page in pages {
            let state = page.state.lock().unwrap();
            if !matches!(*state, PageState::Ready) {
                continue;
            }
            if let Err(e) = self.write_back(&page) {
                logger::warn!("sync of offset {:#x} failed: {}", page.offset, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lru_len(&self) -> usize {
        self.inner.lock().unwrap().lru.len()
    }

    pub fn ref_count(&self, object: &Arc<dyn BackingObject>, offset: u64) -> Option<usize> {
        let key = PageKey::new(object, offset);
        self.inner.lock().unwrap().pages.get(&key).map(|e| e.refs)
    }

    pub fn is_dirty(&self, object: &Arc<dyn BackingObject>, offset: u64) -> bool {
        let key = PageKey::new(object, offset);
        self.inner
            .lock()
            .unwrap()
            .pages
            .get(&key)
            .map_or(false, |e| e.page.dirty.load(Ordering::SeqCst))
    }

    pub fn in_lru(&self, object: &Arc<dyn BackingObject>, offset: u64) -> bool {
        let key = PageKey::new(object, offset);
        self.inner
            .lock()
            .unwrap()
            .pages
            .get(&key)
            .map_or(false, |e| e.lru_tick.is_some())
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        let inner = match self.inner.get_mut() {
            Ok(inner) => inner,
            Err(e) => e.into_inner(),
        };
        for (_, entry) in inner.pages.drain() {
            if entry.refs > 0 {
                logger::warn!(
                    "page cache dropped with {} references on offset {:#x}",
                    entry.refs,
                    entry.page.offset
                );
            }
            self.allocator.release(entry.page.frame);
        }
    }
}
