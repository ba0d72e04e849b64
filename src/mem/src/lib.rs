mod access_type;
mod addr;
mod frame;

pub use access_type::AccessType;
pub use addr::*;
pub use frame::Frame;

pub const PAGE_SHIFT: i32 = 12;
pub const PAGE_SIZE: i32 = 1 << PAGE_SHIFT;

/// Whether `v` is a multiple of the page size.
#[inline]
pub fn is_page_aligned(v: u64) -> bool {
    v & (PAGE_SIZE as u64 - 1) == 0
}
