// Address space management is modelled on gVisor's mm package, reduced to
// what a simulated kernel needs: regions, demand paging and copy-on-write.

mod address_space;
pub mod config;
pub mod fault;
mod io;
pub mod kernel;
mod region;

pub use address_space::{AddressSpace, AddressSpaceStats};
pub use config::MmConfig;
pub use fault::{handle_fault, FaultOutcome, FaultReason};
pub use kernel::{Kernel, MemoryContext};
pub use region::Region;
