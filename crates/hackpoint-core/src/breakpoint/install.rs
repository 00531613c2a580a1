use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use strum::Display;
use tracing::{debug, error, info, warn};

use crate::binhack::compile;
use crate::engine::StageReport;
use crate::error::{Error, Result};
use crate::expr::Scope;
use crate::memory::{ProcessMemory, Protection, patch_region};
use crate::options::OptionStore;
use crate::registry::AddressRegistry;

use super::asm::{INT3, STUB_SIZE, entry_stub, redirect, relocated_slot};
use super::dispatch::{BreakpointTable, HitContext, TableEntry};
use super::{Breakpoint, BreakpointHandler, SLOT_SIZE, check_cavesize, count_breakpoint_sites};

/// Progress of one breakpoint address through installation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, Serialize)]
pub enum BreakpointState {
    Pending,
    /// Cave size and source bytes checked, slot space counted
    CaveReserved,
    /// Original bytes copied into the slot
    Relocated,
    /// `call stub` written at the address
    RedirectInstalled,
    /// Handler is called on hits
    Armed,
}

/// One (breakpoint, address) pair after installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakpointSite {
    pub name: String,
    pub address: u32,
    pub slot: Option<u32>,
    /// Last state reached; anything short of `Armed` failed
    pub state: BreakpointState,
}

/// Result of installing one batch
#[derive(Debug, Default)]
pub struct InstalledBreakpoints {
    pub table: Option<&'static BreakpointTable>,
    /// Entry stubs followed by the slots
    pub region: Option<(u32, usize)>,
    /// Number of entry stubs at the start of `region`, one per distinct `stack_clear`
    pub stubs: usize,
    pub sites: Vec<BreakpointSite>,
}

struct Site<'b> {
    breakpoint: &'b Breakpoint,
    handler: Arc<dyn BreakpointHandler>,
    address: u32,
    /// Entry stub this site calls
    stub: u32,
    slot: Option<u32>,
    state: BreakpointState,
}

impl Site<'_> {
    fn overlaps(&self, address: u32, len: usize) -> bool {
        let start = u64::from(self.address);
        let other = u64::from(address);
        other < start + self.breakpoint.cavesize as u64 && start < other + len as u64
    }

    fn summary(&self) -> BreakpointSite {
        BreakpointSite {
            name: self.breakpoint.name.clone(),
            address: self.address,
            slot: self.slot,
            state: self.state,
        }
    }
}

/// Install `breakpoints`.
///
/// `resolve_handler` returns the handler of a breakpoint, or `None` to skip
/// it; an error from it aborts the whole batch. Every other failure only
/// skips the breakpoint or address concerned.
pub fn install_breakpoints<F>(
    memory: &Arc<dyn ProcessMemory>,
    breakpoints: &[Breakpoint],
    registry: Arc<AddressRegistry>,
    options: Arc<OptionStore>,
    mut resolve_handler: F,
) -> Result<(StageReport, InstalledBreakpoints)>
where
    F: FnMut(&Breakpoint) -> Result<Option<Arc<dyn BreakpointHandler>>>,
{
    let total = count_breakpoint_sites(breakpoints);
    let mut report = StageReport {
        total,
        ..Default::default()
    };
    let mut installed = InstalledBreakpoints::default();
    if total == 0 {
        info!("No breakpoints to set up.");
        return Ok((report, installed));
    }

    let mem = memory.as_ref();
    let scope = Scope::new(&registry, &options).with_memory(mem);
    info!("Setting up breakpoints...");

    let mut sites: Vec<Site<'_>> = Vec::new();
    let mut index = 0;
    for bp in breakpoints {
        if bp.ignore {
            debug!("Breakpoint {} ignored", bp.name);
            report.ignored += 1;
            continue;
        }
        if let Err(e) = check_cavesize(bp.cavesize) {
            error!("({}/{}) {}: {}", index + 1, total, bp.name, e);
            index += bp.addresses.len();
            report.failed += bp.addresses.len();
            continue;
        }
        let Some(handler) = resolve_handler(bp)? else {
            index += bp.addresses.len();
            report.failed += bp.addresses.len();
            continue;
        };

        for address in &bp.addresses {
            index += 1;
            let address = match address.resolve(&scope) {
                Ok(0) => {
                    warn!("({}/{}) {}: address resolved to zero, skipping", index, total, bp.name);
                    report.failed += 1;
                    continue;
                }
                Ok(address) => address,
                Err(e) => {
                    error!("({}/{}) {}: {}", index, total, bp.name, e);
                    report.failed += 1;
                    continue;
                }
            };
            if let Some(other) = sites.iter().find(|s| s.overlaps(address, bp.cavesize)) {
                warn!(
                    "({}/{}) {:#010x} {}... overlaps breakpoint {}, skipping",
                    index, total, address, bp.name, other.breakpoint.name
                );
                report.failed += 1;
                continue;
            }
            if !mem.check_region(address, bp.cavesize) {
                warn!(
                    "({}/{}) {:#010x} {}... not enough source bytes, skipping",
                    index, total, address, bp.name
                );
                report.failed += 1;
                continue;
            }
            info!("({}/{}) {:#010x} {}... OK", index, total, address, bp.name);
            sites.push(Site {
                breakpoint: bp,
                handler: handler.clone(),
                address,
                stub: 0,
                slot: None,
                state: BreakpointState::CaveReserved,
            });
        }
    }

    if sites.is_empty() {
        info!("No valid breakpoints to render.");
        return Ok((report, installed));
    }

    let stack_clears: Vec<u16> = sites
        .iter()
        .map(|site| site.breakpoint.stack_clear)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let stubs_size = stack_clears.len() * STUB_SIZE;
    let size = stubs_size + sites.len() * SLOT_SIZE;
    let base = match mem.allocate(size, Protection::ReadWrite) {
        Ok(base) => base,
        Err(e) => {
            error!("Could not allocate breakpoint slots: {}", e);
            report.failed += sites.len();
            installed.sites = sites.iter().map(Site::summary).collect();
            return Ok((report, installed));
        }
    };
    installed.region = Some((base, size));
    installed.stubs = stack_clears.len();
    info!("Rendering breakpoints... (slots at {:#010x})", base);

    let mut image = vec![INT3; size];
    for (i, site) in sites.iter_mut().enumerate() {
        let stub = stack_clears
            .iter()
            .position(|&clear| clear == site.breakpoint.stack_clear)
            .unwrap_or_default();
        site.stub = base.wrapping_add((stub * STUB_SIZE) as u32);
        let offset = stubs_size + i * SLOT_SIZE;
        let slot = base.wrapping_add(offset as u32);
        match mem.read_bytes(site.address, site.breakpoint.cavesize) {
            Ok(original) => {
                image[offset..offset + SLOT_SIZE]
                    .copy_from_slice(&relocated_slot(&original, site.address, slot));
                site.slot = Some(slot);
                site.state = BreakpointState::Relocated;
            }
            Err(e) => error!("{} at {:#010x}: {}", site.breakpoint.name, site.address, e),
        }
    }

    let entries = sites
        .iter()
        .filter_map(|site| {
            Some(TableEntry::new(
                site.address,
                site.slot?,
                site.breakpoint.name.clone(),
                site.breakpoint.config.clone(),
                site.handler.clone(),
            ))
        })
        .collect();
    let context = HitContext {
        registry: registry.clone(),
        options: options.clone(),
        memory: memory.clone(),
    };
    let table: &'static BreakpointTable = Box::leak(Box::new(BreakpointTable::new(entries, context)));
    installed.table = Some(table);

    for (i, &stack_clear) in stack_clears.iter().enumerate() {
        let offset = i * STUB_SIZE;
        let stub = base.wrapping_add(offset as u32);
        image[offset..offset + STUB_SIZE].copy_from_slice(&entry_stub(
            stub,
            table.handle(),
            mem.dispatcher_address(),
            stack_clear,
        ));
    }
    if let Err(e) = write_slots(mem, base, &image) {
        error!("Could not write breakpoint slots: {}", e);
        report.failed += sites.len();
        installed.sites = sites.iter().map(Site::summary).collect();
        return Ok((report, installed));
    }

    for site in sites.iter_mut().filter(|site| site.state == BreakpointState::Relocated) {
        match install_redirect(mem, site, &scope) {
            Ok(()) => {
                site.state = BreakpointState::RedirectInstalled;
                if table.arm(site.address) {
                    site.state = BreakpointState::Armed;
                }
                debug!("{} armed at {:#010x}", site.breakpoint.name, site.address);
            }
            Err(Error::ExpectedBytesMismatch { .. }) => warn!(
                "{} at {:#010x}: expected bytes not matched, skipping",
                site.breakpoint.name, site.address
            ),
            Err(e) => error!("{} at {:#010x}: {}", site.breakpoint.name, site.address, e),
        }
    }

    for site in &sites {
        if site.state == BreakpointState::Armed {
            report.applied += 1;
        } else {
            report.failed += 1;
        }
    }
    installed.sites = sites.iter().map(Site::summary).collect();
    Ok((report, installed))
}

fn write_slots(memory: &dyn ProcessMemory, base: u32, image: &[u8]) -> Result<()> {
    patch_region(memory, base, None, image)?;
    memory.protect(base, image.len(), Protection::ExecuteRead)?;
    memory.flush_instructions(base, image.len())
}

fn install_redirect(memory: &dyn ProcessMemory, site: &Site<'_>, scope: &Scope<'_>) -> Result<()> {
    let bp = site.breakpoint;
    let expected = bp.expected.as_deref().and_then(|text| {
        let code = match compile(text) {
            Ok(code) => code,
            Err(e) => {
                warn!("{}: invalid expected string, skipping verification: {}", bp.name, e);
                return None;
            }
        };
        if code.size(scope.options) != bp.cavesize {
            warn!(
                "{}: expected code is not {} bytes, skipping verification",
                bp.name, bp.cavesize
            );
            return None;
        }
        match code.render(site.address, scope) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("{}: invalid expected string, skipping verification: {}", bp.name, e);
                None
            }
        }
    });
    let bytes = redirect(site.address, site.stub, bp.cavesize);
    patch_region(memory, site.address, expected.as_deref(), &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::asm::{CALL_REL32, JMP_REL32, NOP};
    use crate::breakpoint::{BreakpointHit, Resume};
    use crate::cpu::CpuState;
    use crate::memory::{ReadMemory, SIMULATED_DISPATCHER, SimulatedMemory};
    use serde_json::json;

    const CODE: u32 = 0x0040_1000;

    fn memory() -> Arc<SimulatedMemory> {
        let mut code = vec![0x90; 0x40];
        code[..6].copy_from_slice(&[0x55, 0x8B, 0xEC, 0x83, 0xEC, 0x10]);
        Arc::new(
            SimulatedMemory::builder()
                .map(CODE, code, Protection::ExecuteRead)
                .build(),
        )
    }

    fn breakpoint(name: &str, value: serde_json::Value) -> Breakpoint {
        Breakpoint::from_json(name, &value).unwrap()
    }

    fn install(
        mem: &Arc<SimulatedMemory>,
        breakpoints: &[Breakpoint],
    ) -> (StageReport, InstalledBreakpoints) {
        let shared: Arc<dyn ProcessMemory> = mem.clone();
        let handler: Arc<dyn BreakpointHandler> = Arc::new(|hit: &mut BreakpointHit<'_>| {
            hit.regs.eax = 0xC0FFEE;
            Resume::Cave
        });
        install_breakpoints(
            &shared,
            breakpoints,
            Arc::new(AddressRegistry::new()),
            Arc::new(OptionStore::new()),
            |_| Ok(Some(handler.clone())),
        )
        .unwrap()
    }

    fn rel_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn test_install_and_fire() {
        let mem = memory();
        let bps = vec![breakpoint("test", json!({ "addr": "0x401000", "cavesize": 6 }))];
        let (report, installed) = install(&mem, &bps);
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 0);

        let site = &installed.sites[0];
        assert_eq!(site.state, BreakpointState::Armed);
        let slot = site.slot.unwrap();
        let (base, size) = installed.region.unwrap();
        assert_eq!(installed.stubs, 1);
        assert_eq!(size, STUB_SIZE + SLOT_SIZE);
        assert_eq!(slot, base + STUB_SIZE as u32);
        assert_eq!(mem.query(base).unwrap().protection, Protection::ExecuteRead);

        let patched = mem.read_bytes(CODE, 6).unwrap();
        assert_eq!(patched[0], CALL_REL32);
        assert_eq!(rel_at(&patched, 1).wrapping_add(CODE + 5), base);
        assert_eq!(patched[5], NOP);
        assert_eq!(mem.query(CODE).unwrap().protection, Protection::ExecuteRead);

        let stub = mem.read_bytes(base, STUB_SIZE).unwrap();
        assert_eq!(rel_at(&stub, 9).wrapping_add(base + 13), SIMULATED_DISPATCHER);

        let relocated = mem.read_bytes(slot, SLOT_SIZE).unwrap();
        assert_eq!(&relocated[..6], &[0x55, 0x8B, 0xEC, 0x83, 0xEC, 0x10]);
        assert_eq!(relocated[6], JMP_REL32);
        assert_eq!(rel_at(&relocated, 7).wrapping_add(slot + 11), CODE + 6);

        let table = installed.table.unwrap();
        let mut regs = CpuState {
            retaddr: CODE + 5,
            ..Default::default()
        };
        assert_eq!(table.fire(&mut regs), Some(Resume::Cave));
        assert_eq!(regs.eax, 0xC0FFEE);
        assert_eq!(regs.retaddr, slot);
    }

    #[test]
    fn test_small_cavesize_is_rejected_without_writes() {
        let mem = memory();
        let bps = vec![breakpoint("tiny", json!({ "addr": "0x401000", "cavesize": 4 }))];
        let (report, installed) = install(&mem, &bps);
        assert_eq!(report.failed, 1);
        assert_eq!(report.applied, 0);
        assert!(installed.table.is_none());
        assert_eq!(mem.write_count(), 0);
        assert_eq!(mem.read_u8(CODE).unwrap(), 0x55);
    }

    #[test]
    fn test_expected_mismatch_leaves_code_untouched() {
        let mem = memory();
        let bps = vec![
            breakpoint(
                "mismatch",
                json!({ "addr": "0x401000", "cavesize": 6, "expected": "90 90 90 90 90 90" }),
            ),
            breakpoint(
                "match",
                json!({ "addr": "0x401010", "cavesize": 5, "expected": "90 90 90 90 90" }),
            ),
        ];
        let (report, installed) = install(&mem, &bps);
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(
            mem.read_bytes(CODE, 6).unwrap(),
            vec![0x55, 0x8B, 0xEC, 0x83, 0xEC, 0x10]
        );
        assert_eq!(installed.sites[0].state, BreakpointState::Relocated);
        assert_eq!(installed.sites[1].state, BreakpointState::Armed);
        assert!(!installed.table.unwrap().is_armed(CODE));
        assert_eq!(mem.read_u8(0x0040_1010).unwrap(), CALL_REL32);
    }

    #[test]
    fn test_expected_of_other_size_is_not_verified() {
        let mem = memory();
        let bps = vec![breakpoint(
            "short",
            json!({ "addr": "0x401000", "cavesize": 6, "expected": "CC" }),
        )];
        let (report, _) = install(&mem, &bps);
        assert_eq!(report.applied, 1);
        assert_eq!(mem.read_u8(CODE).unwrap(), CALL_REL32);
    }

    #[test]
    fn test_bad_addresses_are_skipped() {
        let mem = memory();
        let bps = vec![
            breakpoint(
                "multi",
                json!({ "addr": ["0x401000", 0, "0x401003", "0x40103E", "<nowhere>"], "cavesize": 5 }),
            ),
            breakpoint("ignored", json!({ "addr": "0x401020", "cavesize": 5, "ignore": true })),
        ];
        let (report, installed) = install(&mem, &bps);
        assert_eq!(report.total, 5);
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 4);
        assert_eq!(report.ignored, 1);
        assert_eq!(installed.sites.len(), 1);
        assert_eq!(mem.read_u8(0x0040_1020).unwrap(), 0x90);
    }

    #[test]
    fn test_missing_handler() {
        let mem = memory();
        let shared: Arc<dyn ProcessMemory> = mem.clone();
        let bps = vec![breakpoint("test", json!({ "addr": "0x401000", "cavesize": 5 }))];

        let (report, _) = install_breakpoints(
            &shared,
            &bps,
            Arc::new(AddressRegistry::new()),
            Arc::new(OptionStore::new()),
            |_| Ok(None),
        )
        .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(mem.write_count(), 0);

        let result = install_breakpoints(
            &shared,
            &bps,
            Arc::new(AddressRegistry::new()),
            Arc::new(OptionStore::new()),
            |bp| Err(Error::Aborted(bp.handler_name())),
        );
        assert!(matches!(result, Err(Error::Aborted(name)) if name == "BP_test"));
    }

    #[test]
    fn test_one_stub_per_stack_clear_size() {
        let mem = memory();
        let bps = vec![
            breakpoint("plain", json!({ "addr": "0x401000", "cavesize": 6 })),
            breakpoint(
                "stdcall",
                json!({ "addr": ["0x401010", "0x401020"], "cavesize": 5, "stack_clear_size": 8 }),
            ),
        ];
        let (report, installed) = install(&mem, &bps);
        assert_eq!(report.applied, 3);
        assert_eq!(installed.stubs, 2);

        let (base, size) = installed.region.unwrap();
        assert_eq!(size, 2 * STUB_SIZE + 3 * SLOT_SIZE);
        assert_eq!(installed.sites[0].slot, Some(base + 2 * STUB_SIZE as u32));

        let plain = mem.read_bytes(base, STUB_SIZE).unwrap();
        assert_eq!(plain[17], 0xC3);
        let popping = base + STUB_SIZE as u32;
        let stub = mem.read_bytes(popping, STUB_SIZE).unwrap();
        assert_eq!(&stub[17..20], &[0xC2, 0x08, 0x00]);
        assert_eq!(rel_at(&stub, 9).wrapping_add(popping + 13), SIMULATED_DISPATCHER);

        let call = mem.read_bytes(CODE, 5).unwrap();
        assert_eq!(rel_at(&call, 1).wrapping_add(CODE + 5), base);
        for address in [0x0040_1010u32, 0x0040_1020] {
            let call = mem.read_bytes(address, 5).unwrap();
            assert_eq!(call[0], CALL_REL32);
            assert_eq!(rel_at(&call, 1).wrapping_add(address + 5), popping);
        }
    }
}
