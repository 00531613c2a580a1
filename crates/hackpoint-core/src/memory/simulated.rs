//! In-memory address space used by tests and by the CLI dry-run mode.
//!
//! Regions keep a single protection each; `protect` on any sub-range changes
//! the protection of the whole containing region. Writes to regions without
//! write access fail the same way they would in a real process, so the
//! protection handling of the patch primitive is exercised too.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};

use super::reader::{ProcessMemory, ReadMemory, read_failed};
use super::region::{MemoryRegion, Protection};

/// First address handed out by `allocate`
pub const SIMULATED_ALLOCATION_BASE: u32 = 0x1000_0000;
/// Placeholder address of the breakpoint dispatcher
pub const SIMULATED_DISPATCHER: u32 = 0x7FF0_0000;

const PAGE_SIZE: usize = 0x1000;

#[derive(Debug)]
struct Region {
    data: Vec<u8>,
    protection: Protection,
}

#[derive(Debug, Default)]
struct Space {
    regions: BTreeMap<u32, Region>,
    next_allocation: u32,
}

impl Space {
    fn find(&self, address: u32) -> Option<(u32, &Region)> {
        let (&base, region) = self.regions.range(..=address).next_back()?;
        let end = base as u64 + region.data.len() as u64;
        ((address as u64) < end).then_some((base, region))
    }

    fn find_mut(&mut self, address: u32) -> Option<(u32, &mut Region)> {
        let (&base, region) = self.regions.range_mut(..=address).next_back()?;
        let end = base as u64 + region.data.len() as u64;
        ((address as u64) < end).then_some((base, region))
    }
}

#[derive(Debug)]
pub struct SimulatedMemory {
    space: Mutex<Space>,
    module_base: u32,
    dispatcher: u32,
    exports: HashMap<(String, String), u32>,
    writes: AtomicUsize,
}

impl SimulatedMemory {
    pub fn builder() -> SimulatedMemoryBuilder {
        SimulatedMemoryBuilder::default()
    }

    /// Number of raw writes performed so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// All mapped regions, in address order
    pub fn regions(&self) -> Vec<MemoryRegion> {
        let space = self.lock();
        space
            .regions
            .iter()
            .map(|(&base, region)| MemoryRegion {
                base,
                size: region.data.len(),
                protection: region.protection,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Space> {
        // A poisoned lock only means a test panicked mid-write; the bytes are still usable.
        self.space.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ReadMemory for SimulatedMemory {
    fn read_bytes(&self, address: u32, size: usize) -> Result<Vec<u8>> {
        let space = self.lock();
        let (base, region) = space
            .find(address)
            .ok_or_else(|| read_failed(address, "address not mapped"))?;
        if region.protection == Protection::NoAccess {
            return Err(read_failed(address, "page is not accessible"));
        }
        let start = (address - base) as usize;
        let end = start
            .checked_add(size)
            .filter(|&end| end <= region.data.len())
            .ok_or_else(|| read_failed(address, "read crosses region end"))?;
        Ok(region.data[start..end].to_vec())
    }

    fn module_base(&self) -> u32 {
        self.module_base
    }

    fn resolve_export(&self, module: &str, function: &str) -> Option<u32> {
        self.exports
            .get(&(module.to_ascii_lowercase(), function.to_string()))
            .copied()
    }
}

impl ProcessMemory for SimulatedMemory {
    fn query(&self, address: u32) -> Result<MemoryRegion> {
        let space = self.lock();
        let (base, region) = space
            .find(address)
            .ok_or_else(|| read_failed(address, "address not mapped"))?;
        Ok(MemoryRegion {
            base,
            size: region.data.len(),
            protection: region.protection,
        })
    }

    fn protect(&self, address: u32, _size: usize, protection: Protection) -> Result<Protection> {
        let mut space = self.lock();
        let (_, region) = space.find_mut(address).ok_or(Error::ProtectFailed {
            address,
            message: "address not mapped".to_string(),
        })?;
        let old = region.protection;
        region.protection = protection;
        Ok(old)
    }

    fn write_bytes(&self, address: u32, bytes: &[u8]) -> Result<()> {
        let mut space = self.lock();
        let write_failed = |message: &str| Error::MemoryWriteFailed {
            address,
            message: message.to_string(),
        };
        let (base, region) = space
            .find_mut(address)
            .ok_or_else(|| write_failed("address not mapped"))?;
        if !region.protection.is_writable() {
            return Err(write_failed("page is not writable"));
        }
        let start = (address - base) as usize;
        let end = start + bytes.len();
        if end > region.data.len() {
            return Err(write_failed("write crosses region end"));
        }
        region.data[start..end].copy_from_slice(bytes);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn allocate(&self, size: usize, protection: Protection) -> Result<u32> {
        if size == 0 {
            return Err(Error::AllocationFailed {
                size,
                message: "zero-sized allocation".to_string(),
            });
        }
        let rounded = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let mut space = self.lock();
        let base = space.next_allocation;
        let next = (base as u64) + rounded as u64;
        if next > u32::MAX as u64 {
            return Err(Error::AllocationFailed {
                size,
                message: "address space exhausted".to_string(),
            });
        }
        space.next_allocation = next as u32;
        space.regions.insert(
            base,
            Region {
                data: vec![0; rounded],
                protection,
            },
        );
        Ok(base)
    }

    fn dispatcher_address(&self) -> u32 {
        self.dispatcher
    }
}

/// Builder for [`SimulatedMemory`]
#[derive(Debug)]
pub struct SimulatedMemoryBuilder {
    regions: BTreeMap<u32, Region>,
    module_base: u32,
    dispatcher: u32,
    exports: HashMap<(String, String), u32>,
}

impl Default for SimulatedMemoryBuilder {
    fn default() -> Self {
        Self {
            regions: BTreeMap::new(),
            module_base: 0x0040_0000,
            dispatcher: SIMULATED_DISPATCHER,
            exports: HashMap::new(),
        }
    }
}

impl SimulatedMemoryBuilder {
    pub fn module_base(mut self, base: u32) -> Self {
        self.module_base = base;
        self
    }

    pub fn dispatcher(mut self, address: u32) -> Self {
        self.dispatcher = address;
        self
    }

    /// Map `bytes` at `base` with the given protection
    pub fn map(mut self, base: u32, bytes: impl Into<Vec<u8>>, protection: Protection) -> Self {
        self.regions.insert(
            base,
            Region {
                data: bytes.into(),
                protection,
            },
        );
        self
    }

    /// Map `size` bytes of `fill` at `base`
    pub fn map_filled(self, base: u32, size: usize, fill: u8, protection: Protection) -> Self {
        self.map(base, vec![fill; size], protection)
    }

    pub fn export(mut self, module: &str, function: &str, address: u32) -> Self {
        self.exports.insert(
            (module.to_ascii_lowercase(), function.to_string()),
            address,
        );
        self
    }

    pub fn build(self) -> SimulatedMemory {
        SimulatedMemory {
            space: Mutex::new(Space {
                regions: self.regions,
                next_allocation: SIMULATED_ALLOCATION_BASE,
            }),
            module_base: self.module_base,
            dispatcher: self.dispatcher,
            exports: self.exports,
            writes: AtomicUsize::new(0),
        }
    }
}
