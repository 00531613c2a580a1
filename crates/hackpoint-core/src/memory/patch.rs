use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::reader::ProcessMemory;

/// Write `new` at `address`, temporarily granting write access.
///
/// When `expected` is given, the current bytes must match it exactly or nothing
/// is written. The original protection is restored on every path after it was
/// changed.
pub fn patch_region(
    memory: &dyn ProcessMemory,
    address: u32,
    expected: Option<&[u8]>,
    new: &[u8],
) -> Result<()> {
    let check_len = expected.map_or(0, <[u8]>::len).max(new.len());
    let region = memory.query(address)?;
    if !region.covers(address, check_len) {
        return Err(Error::RegionUnavailable {
            address,
            len: check_len,
        });
    }

    let old = memory.protect(address, check_len, region.protection.writable())?;
    let result = compare_and_write(memory, address, expected, new);
    if let Err(e) = memory.protect(address, check_len, old) {
        warn!("Could not restore protection at {:#010x}: {}", address, e);
    }
    result?;

    if old.is_executable() {
        memory.flush_instructions(address, new.len())?;
    }
    debug!("Patched {} bytes at {:#010x}", new.len(), address);
    Ok(())
}

fn compare_and_write(
    memory: &dyn ProcessMemory,
    address: u32,
    expected: Option<&[u8]>,
    new: &[u8],
) -> Result<()> {
    if let Some(expected) = expected {
        let current = memory.read_bytes(address, expected.len())?;
        if current != expected {
            return Err(Error::ExpectedBytesMismatch { address });
        }
    }
    memory.write_bytes(address, new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Protection, ReadMemory, SimulatedMemory};

    fn memory() -> SimulatedMemory {
        SimulatedMemory::builder()
            .map(0x401000, vec![0x55, 0x8B, 0xEC, 0x83, 0xEC, 0x10], Protection::ExecuteRead)
            .build()
    }

    #[test]
    fn test_patch_restores_protection() {
        let mem = memory();
        patch_region(&mem, 0x401000, None, &[0xC3]).unwrap();
        assert_eq!(mem.read_u8(0x401000).unwrap(), 0xC3);
        assert_eq!(mem.query(0x401000).unwrap().protection, Protection::ExecuteRead);
    }

    #[test]
    fn test_patch_with_matching_expected() {
        let mem = memory();
        patch_region(&mem, 0x401001, Some(&[0x8B, 0xEC]), &[0x90, 0x90]).unwrap();
        assert_eq!(
            mem.read_bytes(0x401000, 4).unwrap(),
            vec![0x55, 0x90, 0x90, 0x83]
        );
    }

    #[test]
    fn test_expected_mismatch_leaves_memory_unchanged() {
        let mem = memory();
        let err = patch_region(&mem, 0x401000, Some(&[0x90, 0x90]), &[0xCC, 0xCC]).unwrap_err();
        assert!(matches!(err, Error::ExpectedBytesMismatch { address: 0x401000 }));
        assert_eq!(mem.read_bytes(0x401000, 2).unwrap(), vec![0x55, 0x8B]);
        assert_eq!(mem.query(0x401000).unwrap().protection, Protection::ExecuteRead);
        assert_eq!(mem.write_count(), 0);
    }

    #[test]
    fn test_patch_past_region_end_is_rejected() {
        let mem = memory();
        let err = patch_region(&mem, 0x401004, None, &[0; 4]).unwrap_err();
        assert!(matches!(err, Error::RegionUnavailable { len: 4, .. }));
        assert_eq!(mem.write_count(), 0);
    }

    #[test]
    fn test_patch_unmapped_address_fails() {
        let mem = memory();
        assert!(patch_region(&mem, 0x10, None, &[0]).is_err());
    }
}
