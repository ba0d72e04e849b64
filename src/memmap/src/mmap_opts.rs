use std::sync::Arc;

use mem::{AccessType, Addr};

use super::BackingObject;

#[derive(Default, Debug, Clone)]
pub struct MmapOpts {
    pub length: u64,
    /// `None` maps anonymous, zero-filled memory.
    pub backing: Option<Arc<dyn BackingObject>>,
    /// Offset into `backing`, or the physical base address when `phys` is set.
    pub offset: u64,
    pub addr: Option<Addr>,
    pub private: bool,
    pub fixed: bool,
    pub phys: bool,
    pub precommit: bool,
    pub perms: AccessType,
    /// Ceiling for later protect calls. Defaults to `perms`.
    pub max_perms: Option<AccessType>,
}
