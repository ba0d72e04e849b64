use std::ffi::CString;

use nix::sys::memfd;

pub fn create_mem_fd(name: &str, flags: u32) -> nix::Result<i32> {
    let name = CString::new(name).map_err(|_| nix::errno::Errno::EINVAL)?;
    let flags = memfd::MemFdCreateFlag::from_bits(flags).ok_or(nix::errno::Errno::EINVAL)?;
    memfd::memfd_create(&name, flags)
}
