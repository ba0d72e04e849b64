use std::sync::atomic::{AtomicU64, Ordering};

#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum MemoryKind {
    System,
    Anonymous,
    PageCache,
    PageTable,
}

/// Bytes currently allocated, broken down by [`MemoryKind`].
#[derive(Debug, Default)]
pub struct MemoryUsage {
    system: AtomicU64,
    anonymous: AtomicU64,
    page_cache: AtomicU64,
    page_table: AtomicU64,
}

impl MemoryUsage {
    fn counter(&self, kind: MemoryKind) -> &AtomicU64 {
        match kind {
            MemoryKind::System => &self.system,
            MemoryKind::Anonymous => &self.anonymous,
            MemoryKind::PageCache => &self.page_cache,
            MemoryKind::PageTable => &self.page_table,
        }
    }

    pub(crate) fn inc(&self, val: u64, kind: MemoryKind) {
        self.counter(kind).fetch_add(val, Ordering::SeqCst);
    }

    pub(crate) fn dec(&self, val: u64, kind: MemoryKind) {
        let prev = self.counter(kind).fetch_sub(val, Ordering::SeqCst);
        if prev < val {
            panic!("{:?} usage underflow: {} < {}", kind, prev, val);
        }
    }

    pub fn get(&self, kind: MemoryKind) -> u64 {
        self.counter(kind).load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u64 {
        [
            MemoryKind::System,
            MemoryKind::Anonymous,
            MemoryKind::PageCache,
            MemoryKind::PageTable,
        ]
        .iter()
        .map(|k| self.get(*k))
        .sum()
    }
}
