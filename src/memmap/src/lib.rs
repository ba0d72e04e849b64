mod backing;
pub mod mmap_opts;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backing::*;
