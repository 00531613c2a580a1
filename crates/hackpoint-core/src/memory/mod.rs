//! Access to the address space being patched.

#[cfg(all(windows, target_arch = "x86"))]
mod local;
mod patch;
mod reader;
mod region;
mod simulated;

#[cfg(all(windows, target_arch = "x86"))]
pub use local::LocalProcess;
pub use patch::patch_region;
pub use reader::{ProcessMemory, ReadMemory};
pub use region::{MemoryRegion, Protection};
pub use simulated::{
    SIMULATED_ALLOCATION_BASE, SIMULATED_DISPATCHER, SimulatedMemory, SimulatedMemoryBuilder,
};
