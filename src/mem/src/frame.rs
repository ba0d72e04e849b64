use super::PAGE_SHIFT;

/// Physical page frame number.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame(pub u64);

impl Frame {
    /// The frame holding physical address `pa`.
    #[inline]
    pub const fn containing(pa: u64) -> Self {
        Frame(pa >> PAGE_SHIFT)
    }

    #[inline]
    pub const fn phys_addr(&self) -> u64 {
        self.0 << PAGE_SHIFT
    }

    /// The frame `n` pages above this one.
    #[inline]
    pub fn offset(&self, n: u64) -> Option<Self> {
        self.0.checked_add(n).map(Frame)
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pfn:{:#x}", self.0)
    }
}
