use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysErrorKind {
    Libc,
    Nix, // from nix crate
    Eof,
    SegFault(u64),
    StdIoError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysError {
    code: i32,
    desc: Option<String>,
    kind: SysErrorKind,
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SysErrorKind::SegFault(addr) => write!(f, "segmentation violation at {:#x}", addr),
            _ => write!(
                f,
                "SysError occured with code: {} {:?} {:?}",
                self.code, self.desc, self.kind
            ),
        }
    }
}

impl std::error::Error for SysError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl SysError {
    pub fn new(code: i32) -> Self {
        Self {
            code,
            desc: None,
            kind: SysErrorKind::Libc,
        }
    }

    pub fn new_with_msg(code: i32, msg: String) -> Self {
        Self {
            code,
            desc: Some(msg),
            kind: SysErrorKind::Libc,
        }
    }

    /// A fault that can not be resolved. The trap layer delivers SIGSEGV.
    pub fn seg_fault(addr: u64) -> Self {
        Self {
            code: libc::EFAULT,
            desc: None,
            kind: SysErrorKind::SegFault(addr),
        }
    }

    pub fn kind(&self) -> SysErrorKind {
        self.kind
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn is_seg_fault(&self) -> bool {
        matches!(self.kind, SysErrorKind::SegFault(_))
    }

    pub fn eof() -> Self {
        Self {
            code: -1,
            desc: Some("EOF".to_string()),
            kind: SysErrorKind::Eof,
        }
    }

    pub fn from_io_error(e: std::io::Error) -> Self {
        Self {
            code: e.raw_os_error().unwrap_or(libc::EIO),
            desc: Some(e.to_string()),
            kind: SysErrorKind::StdIoError,
        }
    }

    pub fn from_nix_errno(e: nix::errno::Errno) -> Self {
        Self {
            code: e as i32,
            desc: Some(e.desc().to_string()),
            kind: SysErrorKind::Nix,
        }
    }
}

impl From<std::io::Error> for SysError {
    fn from(e: std::io::Error) -> Self {
        Self::from_io_error(e)
    }
}

impl From<nix::errno::Errno> for SysError {
    fn from(e: nix::errno::Errno) -> Self {
        Self::from_nix_errno(e)
    }
}

#[macro_export]
macro_rules! bail_libc {
    ($libc_code:expr) => {
        return Err(SysError::new($libc_code))
    };
}

pub type SysResult<T> = std::result::Result<T, SysError>;
