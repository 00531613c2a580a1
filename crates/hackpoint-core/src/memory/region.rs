//! Page protection and region descriptors shared by all memory backends.

use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};

/// Page protection of a memory region
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, IntoStaticStr,
)]
pub enum Protection {
    #[default]
    #[strum(serialize = "---")]
    NoAccess,
    #[strum(serialize = "r--")]
    Read,
    #[strum(serialize = "rw-")]
    ReadWrite,
    #[strum(serialize = "--x")]
    Execute,
    #[strum(serialize = "r-x")]
    ExecuteRead,
    #[strum(serialize = "rwx")]
    ExecuteReadWrite,
}

impl Protection {
    pub fn is_readable(self) -> bool {
        matches!(
            self,
            Self::Read | Self::ReadWrite | Self::ExecuteRead | Self::ExecuteReadWrite
        )
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Self::ReadWrite | Self::ExecuteReadWrite)
    }

    pub fn is_executable(self) -> bool {
        matches!(
            self,
            Self::Execute | Self::ExecuteRead | Self::ExecuteReadWrite
        )
    }

    /// The protection granted while patching a region with this protection.
    ///
    /// Executable pages stay executable so that other threads running in the
    /// same page keep working while the write is in progress.
    pub fn writable(self) -> Self {
        if self.is_executable() {
            Self::ExecuteReadWrite
        } else {
            Self::ReadWrite
        }
    }
}

/// A contiguous range of pages with uniform protection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u32,
    pub size: usize,
    pub protection: Protection,
}

impl MemoryRegion {
    pub fn end(&self) -> u64 {
        self.base as u64 + self.size as u64
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.base && (address as u64) < self.end()
    }

    /// Whether `len` bytes starting at `address` are inside this region and accessible
    pub fn covers(&self, address: u32, len: usize) -> bool {
        self.protection != Protection::NoAccess
            && self.contains(address)
            && address as u64 + len as u64 <= self.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writable_keeps_execute() {
        assert_eq!(Protection::ExecuteRead.writable(), Protection::ExecuteReadWrite);
        assert_eq!(Protection::Execute.writable(), Protection::ExecuteReadWrite);
        assert_eq!(Protection::Read.writable(), Protection::ReadWrite);
        assert_eq!(Protection::NoAccess.writable(), Protection::ReadWrite);
    }

    #[test]
    fn test_region_covers() {
        let region = MemoryRegion {
            base: 0x1000,
            size: 0x1000,
            protection: Protection::ExecuteRead,
        };
        assert!(region.covers(0x1000, 0x1000));
        assert!(region.covers(0x1FFF, 1));
        assert!(!region.covers(0x1FFF, 2));
        assert!(!region.covers(0x0FFF, 1));

        let guarded = MemoryRegion {
            protection: Protection::NoAccess,
            ..region
        };
        assert!(!guarded.covers(0x1000, 1));
    }

    #[test]
    fn test_protection_display() {
        assert_eq!(Protection::ExecuteReadWrite.to_string(), "rwx");
        assert_eq!(Protection::Read.to_string(), "r--");
    }
}
