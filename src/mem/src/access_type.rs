#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct AccessType {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl std::fmt::Debug for AccessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { "r" } else { "-" },
            if self.write { "w" } else { "-" },
            if self.execute { "x" } else { "-" }
        )
    }
}

impl AccessType {
    pub const fn no_access() -> Self {
        Self {
            read: false,
            write: false,
            execute: false,
        }
    }

    pub const fn read() -> Self {
        Self {
            read: true,
            write: false,
            execute: false,
        }
    }

    pub const fn write() -> Self {
        Self {
            read: false,
            write: true,
            execute: false,
        }
    }

    pub const fn execute() -> Self {
        Self {
            read: false,
            write: false,
            execute: true,
        }
    }

    pub const fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            execute: false,
        }
    }

    pub const fn any_access() -> Self {
        Self {
            read: true,
            write: true,
            execute: true,
        }
    }

    pub fn is_superset_of(&self, other: AccessType) -> bool {
        if !self.read && other.read {
            false
        } else if !self.write && other.write {
            false
        } else {
            self.execute || !other.execute
        }
    }

    pub fn intersect(&self, other: AccessType) -> AccessType {
        AccessType {
            read: self.read && other.read,
            write: self.write && other.write,
            execute: self.execute && other.execute,
        }
    }

    pub fn union(&self, other: AccessType) -> AccessType {
        AccessType {
            read: self.read || other.read,
            write: self.write || other.write,
            execute: self.execute || other.execute,
        }
    }

    /// Write and execute imply read on every MMU we support.
    pub fn effective(&self) -> AccessType {
        let mut ret = *self;
        if ret.write || ret.execute {
            ret.read = true;
        }
        ret
    }

    pub fn any(&self) -> bool {
        self.read || self.write || self.execute
    }

    pub fn without_write(&self) -> AccessType {
        AccessType {
            write: false,
            ..*self
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superset_and_intersect() {
        let rw = AccessType::read_write();
        assert!(AccessType::any_access().is_superset_of(rw));
        assert!(!AccessType::read().is_superset_of(rw));
        assert_eq!(rw.intersect(AccessType::read()), AccessType::read());
        assert_eq!(
            AccessType::write().effective(),
            AccessType::read_write()
        );
        assert_eq!(rw.without_write(), AccessType::read());
    }

    #[test]
    fn debug_format() {
        let at = AccessType::read().union(AccessType::execute());
        assert_eq!(format!("{:?}", at), "r-x");
        assert_eq!(format!("{:?}", AccessType::no_access()), "---");
    }
}
