use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tracing::{error, trace};

use crate::cpu::{CPU_STATE_SIZE, CpuState};
use crate::memory::ProcessMemory;
use crate::options::OptionStore;
use crate::registry::AddressRegistry;

use super::hit::BreakpointHit;
use super::{BreakpointHandler, CALL_LEN, Resume};

/// Read-only state shared by every hit of one table
pub(crate) struct HitContext {
    pub registry: Arc<AddressRegistry>,
    pub options: Arc<OptionStore>,
    pub memory: Arc<dyn ProcessMemory>,
}

pub(crate) struct TableEntry {
    pub address: u32,
    pub slot: u32,
    pub name: String,
    pub config: Value,
    pub handler: Arc<dyn BreakpointHandler>,
    armed: AtomicBool,
}

impl TableEntry {
    pub fn new(
        address: u32,
        slot: u32,
        name: String,
        config: Value,
        handler: Arc<dyn BreakpointHandler>,
    ) -> Self {
        Self {
            address,
            slot,
            name,
            config,
            handler,
            armed: AtomicBool::new(false),
        }
    }
}

/// Breakpoints installed by one apply run, keyed by address.
///
/// Tables are leaked: the entry stub refers to them for as long as the
/// process lives.
pub struct BreakpointTable {
    entries: Vec<TableEntry>,
    context: HitContext,
}

impl BreakpointTable {
    pub(crate) fn new(mut entries: Vec<TableEntry>, context: HitContext) -> Self {
        entries.sort_by_key(|entry| entry.address);
        Self { entries, context }
    }

    fn entry(&self, address: u32) -> Option<&TableEntry> {
        self.entries
            .binary_search_by_key(&address, |entry| entry.address)
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Start calling the handler for the breakpoint at `address`
    pub(crate) fn arm(&self, address: u32) -> bool {
        match self.entry(address) {
            Some(entry) => {
                entry.armed.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, address: u32) -> bool {
        self.entry(address)
            .is_some_and(|entry| entry.armed.load(Ordering::Acquire))
    }

    /// Relocated slot of the breakpoint at `address`
    pub fn slot(&self, address: u32) -> Option<u32> {
        self.entry(address).map(|entry| entry.slot)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value pushed by the entry stub to find this table again
    pub(crate) fn handle(&'static self) -> u32 {
        self as *const Self as usize as u32
    }

    /// Handle one hit. `regs.retaddr` identifies the breakpoint and is
    /// rewritten to the relocated slot unless the handler overrides it.
    ///
    /// Returns `None` if no breakpoint of this table is at the call site.
    pub fn fire(&self, regs: &mut CpuState) -> Option<Resume> {
        let address = regs.retaddr.wrapping_sub(CALL_LEN as u32);
        let Some(entry) = self.entry(address) else {
            error!("No breakpoint at {:#010x}", address);
            return None;
        };

        let resume = if entry.armed.load(Ordering::Acquire) {
            trace!("Breakpoint {} hit at {:#010x}", entry.name, address);
            let mut hit = BreakpointHit::new(&entry.name, address, regs, &entry.config, &self.context);
            entry.handler.call(&mut hit)
        } else {
            Resume::Cave
        };
        if resume == Resume::Cave {
            regs.retaddr = entry.slot;
        }
        Some(resume)
    }
}

impl std::fmt::Debug for BreakpointTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(
                self.entries
                    .iter()
                    .map(|entry| (format!("{:#010x}", entry.address), &entry.name)),
            )
            .finish()
    }
}

/// Signed change of `esp` made by a handler
#[cfg_attr(not(all(windows, target_arch = "x86")), allow(dead_code))]
pub(crate) fn esp_delta(before: u32, after: u32) -> isize {
    after.wrapping_sub(before) as i32 as isize
}

/// Move the register block at `offset` in `stack` by `delta` bytes so it
/// follows a changed `esp`. The old and new blocks may overlap.
///
/// Returns the new offset, or `None` if either block is outside `stack`.
#[cfg_attr(not(all(windows, target_arch = "x86")), allow(dead_code))]
pub(crate) fn shift_block(stack: &mut [u8], offset: usize, delta: isize) -> Option<usize> {
    let moved = offset.checked_add_signed(delta)?;
    let fits = |at: usize| at.checked_add(CPU_STATE_SIZE).is_some_and(|end| end <= stack.len());
    if !fits(offset) || !fits(moved) {
        return None;
    }
    stack.copy_within(offset..offset + CPU_STATE_SIZE, moved);
    Some(moved)
}

/// Called by the entry stub with the table it was built for and the block
/// of registers it pushed. Returns where that block now lives.
#[cfg(all(windows, target_arch = "x86"))]
extern "C" fn dispatch(table: *const BreakpointTable, regs: *mut CpuState) -> *mut CpuState {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    // SAFETY: the stub passes a leaked table and the block it just pushed on
    // the current thread's stack.
    let (table, state) = unsafe { (&*table, &mut *regs) };
    let esp = state.esp;
    let address = state.retaddr.wrapping_sub(CALL_LEN as u32);

    if catch_unwind(AssertUnwindSafe(|| table.fire(state))).is_err() {
        error!("Breakpoint handler at {:#010x} panicked", address);
        if let Some(slot) = table.slot(address) {
            state.retaddr = slot;
        }
    }

    let delta = esp_delta(esp, state.esp);
    if delta == 0 {
        return regs;
    }
    let distance = delta.unsigned_abs();
    let (start, offset) = if delta < 0 {
        (regs.wrapping_byte_sub(distance), distance)
    } else {
        (regs, 0)
    };
    // SAFETY: the handler moved esp within its own stack, so the span
    // covering the old and new blocks lies in that stack.
    let stack = unsafe {
        std::slice::from_raw_parts_mut(start.cast::<u8>(), CPU_STATE_SIZE + distance)
    };
    match shift_block(stack, offset, delta) {
        Some(moved) => start.wrapping_byte_add(moved),
        None => regs,
    }
}

/// Address of the dispatcher called by the entry stub
#[cfg(all(windows, target_arch = "x86"))]
pub fn native_dispatcher() -> u32 {
    dispatch as usize as u32
}
