use crate::error::{Error, Result};

use super::region::{MemoryRegion, Protection};

/// Read access to the address space being patched
pub trait ReadMemory {
    fn read_bytes(&self, address: u32, size: usize) -> Result<Vec<u8>>;

    /// Base address of the main module, used for `Rx` relative addresses
    fn module_base(&self) -> u32;

    fn read_u8(&self, address: u32) -> Result<u8> {
        let bytes = self.read_bytes(address, 1)?;
        Ok(bytes[0])
    }

    fn read_u16(&self, address: u32) -> Result<u16> {
        let bytes = self.read_bytes(address, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&self, address: u32) -> Result<u32> {
        let bytes = self.read_bytes(address, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_f32(&self, address: u32) -> Result<f32> {
        self.read_u32(address).map(f32::from_bits)
    }

    /// Resolve an exported function by module and name
    fn resolve_export(&self, _module: &str, _function: &str) -> Option<u32> {
        None
    }
}

/// Full access to the address space: queries, protection changes, writes and allocation
pub trait ProcessMemory: ReadMemory + Send + Sync {
    /// Describe the region containing `address`
    fn query(&self, address: u32) -> Result<MemoryRegion>;

    /// Change the protection of the pages spanning `[address, address + size)`.
    /// Returns the previous protection.
    fn protect(&self, address: u32, size: usize, protection: Protection) -> Result<Protection>;

    /// Raw write; callers go through [`super::patch_region`] to get protection handling
    fn write_bytes(&self, address: u32, bytes: &[u8]) -> Result<()>;

    /// Reserve and commit a new region
    fn allocate(&self, size: usize, protection: Protection) -> Result<u32>;

    /// Make freshly written code visible to the instruction fetcher
    fn flush_instructions(&self, _address: u32, _size: usize) -> Result<()> {
        Ok(())
    }

    /// Address of the native breakpoint dispatcher in this address space
    fn dispatcher_address(&self) -> u32;

    /// Check that `len` bytes at `address` are mapped and accessible
    fn check_region(&self, address: u32, len: usize) -> bool {
        self.query(address)
            .map(|region| region.covers(address, len))
            .unwrap_or(false)
    }
}

pub(crate) fn read_failed(address: u32, message: impl Into<String>) -> Error {
    Error::MemoryReadFailed {
        address,
        message: message.into(),
    }
}
