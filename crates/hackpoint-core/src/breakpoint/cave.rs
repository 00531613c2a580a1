//! Breakpoints named `codecave:<name>` call a code cave as their handler.
//!
//! The cave is called as `u32 __cdecl cave(CpuState *regs, void *config)`.
//! A nonzero return runs the relocated original instructions.

use tracing::debug;

use super::hit::BreakpointHit;
use super::{BreakpointHandler, Resume};

/// Handler that calls into a placed code cave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaveHandler {
    pub cave: u32,
}

impl CaveHandler {
    pub fn new(cave: u32) -> Self {
        Self { cave }
    }

    fn resume(returned: u32) -> Resume {
        if returned != 0 {
            Resume::Cave
        } else {
            Resume::Override
        }
    }
}

impl BreakpointHandler for CaveHandler {
    #[cfg(all(windows, target_arch = "x86"))]
    fn call(&self, hit: &mut BreakpointHit<'_>) -> Resume {
        type CaveFn = unsafe extern "C" fn(*mut crate::cpu::CpuState, *const std::ffi::c_void) -> u32;

        // SAFETY: the address is a cave placed and made executable by this
        // engine in the current process, called with the documented signature.
        let returned = unsafe {
            let cave: CaveFn = std::mem::transmute(self.cave as usize);
            cave(&mut *hit.regs, std::ptr::null())
        };
        debug!("{}: cave {:#010x} returned {}", hit.name, self.cave, returned);
        Self::resume(returned)
    }

    #[cfg(not(all(windows, target_arch = "x86")))]
    fn call(&self, hit: &mut BreakpointHit<'_>) -> Resume {
        debug!("{}: cave {:#010x} is not callable on this host", hit.name, self.cave);
        hit.default_resume()
    }
}
