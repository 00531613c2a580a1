//! Applying a whole configuration to one address space.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::binhack::apply_binhacks;
use crate::breakpoint::{
    Breakpoint, BreakpointHandler, CaveHandler, HandlerRegistry, InstalledBreakpoints, STUB_SIZE,
    SLOT_SIZE, install_breakpoints,
};
use crate::codecave::{PlacedCave, apply_codecaves};
use crate::config::HackConfig;
use crate::error::{Error, Result};
use crate::expr::Scope;
use crate::memory::ProcessMemory;
use crate::prompt::{Prompter, SymbolPolicy};
use crate::registry::{AddressRegistry, CAVE_PREFIX};

/// Outcome of one stage. `total` counts (entry, address) instances; ignored
/// entries are counted separately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub total: usize,
    pub applied: usize,
    pub failed: usize,
    pub ignored: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub codecaves: StageReport,
    pub binhacks: StageReport,
    pub breakpoints: StageReport,
}

impl ApplyReport {
    pub fn applied(&self) -> usize {
        self.codecaves.applied + self.binhacks.applied + self.breakpoints.applied
    }

    pub fn failed(&self) -> usize {
        self.codecaves.failed + self.binhacks.failed + self.breakpoints.failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    CodeCave,
    BreakpointStub,
    BreakpointSlot,
}

/// Named location of an address inside memory the engine allocated
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeLocation {
    pub kind: LocationKind,
    pub name: String,
    pub base: u32,
    pub offset: u32,
}

impl std::fmt::Display for CodeLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            LocationKind::CodeCave => write!(f, "codecave:{}+{:#x}", self.name, self.offset),
            LocationKind::BreakpointStub => write!(f, "breakpoint stub+{:#x}", self.offset),
            LocationKind::BreakpointSlot => {
                write!(f, "breakpoint {} (original code)+{:#x}", self.name, self.offset)
            }
        }
    }
}

/// Owns the named address registry and handler table, and applies
/// configurations in order: options, code caves, binhacks, breakpoints.
pub struct Engine {
    memory: Arc<dyn ProcessMemory>,
    registry: AddressRegistry,
    handlers: HandlerRegistry,
    policy: SymbolPolicy,
    prompter: Option<Box<dyn Prompter>>,
    caves: Vec<PlacedCave>,
    breakpoints: Vec<InstalledBreakpoints>,
}

impl Engine {
    pub fn new(memory: Arc<dyn ProcessMemory>) -> Self {
        Self {
            memory,
            registry: AddressRegistry::new(),
            handlers: HandlerRegistry::new(),
            policy: SymbolPolicy::default(),
            prompter: None,
            caves: Vec::new(),
            breakpoints: Vec::new(),
        }
    }

    pub fn memory(&self) -> &Arc<dyn ProcessMemory> {
        &self.memory
    }

    pub fn registry(&self) -> &AddressRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut AddressRegistry {
        &mut self.registry
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn handlers_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.handlers
    }

    pub fn set_symbol_policy(&mut self, policy: SymbolPolicy) {
        self.policy = policy;
    }

    pub fn set_prompter(&mut self, prompter: impl Prompter + 'static) {
        self.prompter = Some(Box::new(prompter));
    }

    /// Caves placed by every run so far
    pub fn caves(&self) -> &[PlacedCave] {
        &self.caves
    }

    /// Breakpoint batches installed by every run so far
    pub fn breakpoints(&self) -> &[InstalledBreakpoints] {
        &self.breakpoints
    }

    /// Apply `config`. Entries that fail are logged and counted; only an
    /// abort requested through the prompter ends the run with an error.
    pub fn apply(&mut self, config: &HackConfig) -> Result<ApplyReport> {
        info!("Applying hackpoints...");
        let options = Arc::new(config.options.clone());
        let memory = self.memory.as_ref();

        let (codecaves, _, placed) =
            apply_codecaves(memory, &config.codecaves, &mut self.registry, &options);
        self.caves.extend(placed);

        let scope = Scope::new(&self.registry, &options).with_memory(memory);
        let binhacks = apply_binhacks(memory, &config.binhacks, &scope);

        let registry = Arc::new(self.registry.clone());
        let (breakpoints, installed) = install_breakpoints(
            &self.memory,
            &config.breakpoints,
            registry,
            options,
            |bp| self.handler_for(bp),
        )?;
        if installed.table.is_some() {
            self.breakpoints.push(installed);
        }

        let report = ApplyReport {
            codecaves,
            binhacks,
            breakpoints,
        };
        if report.failed() == 0 {
            info!("Applied {} hackpoints", report.applied());
        } else {
            warn!(
                "Applied {} hackpoints, {} failed",
                report.applied(),
                report.failed()
            );
        }
        Ok(report)
    }

    fn handler_for(&self, bp: &Breakpoint) -> Result<Option<Arc<dyn BreakpointHandler>>> {
        let name = bp.handler_name();
        let handler = match bp.cave_name() {
            Some(cave) => self
                .registry
                .get(&format!("{CAVE_PREFIX}{cave}"))
                .map(|address| Arc::new(CaveHandler::new(address)) as Arc<dyn BreakpointHandler>),
            None => self.handlers.get(&name),
        };
        if handler.is_some() {
            return Ok(handler);
        }
        error!("{}", Error::HandlerNotFound(name.clone()));
        match (self.policy, &self.prompter) {
            (SymbolPolicy::Prompt, Some(prompter)) if !prompter.continue_without(&name) => {
                Err(Error::Aborted(format!("breakpoint function '{name}' not found")))
            }
            _ => Ok(None),
        }
    }

    /// Name the cave or breakpoint slot containing `address`, for crash reports
    pub fn locate(&self, address: u32) -> Option<CodeLocation> {
        let within = |base: u32, size: usize| {
            address >= base && u64::from(address) < u64::from(base) + size as u64
        };

        if let Some(cave) = self.caves.iter().find(|cave| within(cave.address, cave.padded)) {
            return Some(CodeLocation {
                kind: LocationKind::CodeCave,
                name: cave.name.clone(),
                base: cave.address,
                offset: address - cave.address,
            });
        }

        for batch in &self.breakpoints {
            let Some((base, _)) = batch.region else {
                continue;
            };
            if within(base, batch.stubs * STUB_SIZE) {
                return Some(CodeLocation {
                    kind: LocationKind::BreakpointStub,
                    name: String::new(),
                    base,
                    offset: address - base,
                });
            }
            let site = batch.sites.iter().find_map(|site| {
                let slot = site.slot?;
                within(slot, SLOT_SIZE).then_some((site, slot))
            });
            if let Some((site, slot)) = site {
                return Some(CodeLocation {
                    kind: LocationKind::BreakpointSlot,
                    name: site.name.clone(),
                    base: slot,
                    offset: address - slot,
                });
            }
        }
        None
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry.len())
            .field("handlers", &self.handlers)
            .field("policy", &self.policy)
            .field("caves", &self.caves.len())
            .field("breakpoints", &self.breakpoints.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::{BreakpointHit, BreakpointState, Resume};
    use crate::cpu::CpuState;
    use crate::memory::{Protection, ReadMemory, SimulatedMemory};
    use serde_json::json;

    const CODE: u32 = 0x0040_1000;

    fn memory() -> Arc<SimulatedMemory> {
        Arc::new(
            SimulatedMemory::builder()
                .map_filled(CODE, 0x100, 0x90, Protection::ExecuteRead)
                .build(),
        )
    }

    fn config() -> HackConfig {
        HackConfig::from_value(&json!({
            "options": { "lives": { "type": "u32", "val": 9 } },
            "codecaves": {
                "set_lives": "B8 <option:lives> C3"
            },
            "binhacks": {
                "call_cave": { "addr": "Rx1000", "code": "E8 [cave:set_lives]" }
            },
            "breakpoints": {
                "lives_read": { "addr": "0x401040", "cavesize": 5, "value": "<option:lives> * 2" }
            }
        }))
        .unwrap()
    }

    struct Refuse;

    impl Prompter for Refuse {
        fn continue_without(&self, _: &str) -> bool {
            false
        }
    }

    #[test]
    fn test_apply_runs_every_stage() {
        let mem = memory();
        let mut engine = Engine::new(mem.clone());
        engine
            .handlers_mut()
            .register("BP_lives_read", |hit: &mut BreakpointHit<'_>| {
                hit.regs.eax = hit.immediate("value").unwrap_or_default();
                Resume::Cave
            });

        let report = engine.apply(&config()).unwrap();
        assert_eq!(report.codecaves.applied, 1);
        assert_eq!(report.binhacks.applied, 1);
        assert_eq!(report.breakpoints.applied, 1);
        assert_eq!(report.failed(), 0);

        let cave = engine.registry().get("cave:set_lives").unwrap();
        assert_eq!(mem.read_bytes(cave, 6).unwrap(), vec![0xB8, 9, 0, 0, 0, 0xC3]);
        let rel = mem.read_u32(CODE + 1).unwrap();
        assert_eq!(rel.wrapping_add(CODE + 5), cave);

        let batch = &engine.breakpoints()[0];
        assert_eq!(batch.sites[0].state, BreakpointState::Armed);
        let mut regs = CpuState {
            retaddr: 0x0040_1045,
            ..Default::default()
        };
        assert_eq!(batch.table.unwrap().fire(&mut regs), Some(Resume::Cave));
        assert_eq!(regs.eax, 18);
    }

    #[test]
    fn test_missing_handler_policies() {
        let mem = memory();
        let mut engine = Engine::new(mem.clone());
        let report = engine.apply(&config()).unwrap();
        assert_eq!(report.breakpoints.failed, 1);
        assert_eq!(report.binhacks.applied, 1);

        let mut engine = Engine::new(memory());
        engine.set_symbol_policy(SymbolPolicy::Prompt);
        engine.set_prompter(Refuse);
        let err = engine.apply(&config()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_locate() {
        let mem = memory();
        let mut engine = Engine::new(mem.clone());
        engine
            .handlers_mut()
            .register("BP_lives_read", |_: &mut BreakpointHit<'_>| Resume::Cave);
        engine.apply(&config()).unwrap();

        let cave = engine.registry().get("cave:set_lives").unwrap();
        let location = engine.locate(cave + 5).unwrap();
        assert_eq!(location.kind, LocationKind::CodeCave);
        assert_eq!(location.to_string(), "codecave:set_lives+0x5");

        let slot = engine.breakpoints()[0].sites[0].slot.unwrap();
        let location = engine.locate(slot + 2).unwrap();
        assert_eq!(location.kind, LocationKind::BreakpointSlot);
        assert_eq!(location.name, "lives_read");
        assert_eq!(location.offset, 2);

        let (base, _) = engine.breakpoints()[0].region.unwrap();
        assert_eq!(engine.locate(base).unwrap().kind, LocationKind::BreakpointStub);
        assert!(engine.locate(CODE).is_none());
    }

    #[test]
    fn test_codecave_breakpoints_call_their_cave() {
        let mem = memory();
        let mut engine = Engine::new(mem.clone());
        let config = HackConfig::from_value(&json!({
            "codecaves": { "on_hit": "B8 01000000 C3" },
            "breakpoints": {
                "codecave:on_hit": { "addr": "0x401040", "cavesize": 5 },
                "codecave:nowhere": { "addr": "0x401060", "cavesize": 5 }
            }
        }))
        .unwrap();

        let report = engine.apply(&config).unwrap();
        assert_eq!(report.codecaves.applied, 1);
        assert_eq!(report.breakpoints.applied, 1);
        assert_eq!(report.breakpoints.failed, 1);
        assert_eq!(mem.read_u8(0x0040_1060).unwrap(), 0x90);

        let batch = &engine.breakpoints()[0];
        let site = batch.sites.iter().find(|site| site.address == 0x0040_1040).unwrap();
        assert_eq!(site.name, "codecave:on_hit");
        assert_eq!(site.state, BreakpointState::Armed);
    }

    #[test]
    fn test_locate_every_stub() {
        let mem = memory();
        let mut engine = Engine::new(mem.clone());
        engine
            .handlers_mut()
            .register("BP_hit", |_: &mut BreakpointHit<'_>| Resume::Cave);
        let config = HackConfig::from_value(&json!({
            "breakpoints": {
                "hit#1": { "addr": "0x401040", "cavesize": 5 },
                "hit#2": { "addr": "0x401060", "cavesize": 5, "stack_clear_size": 4 }
            }
        }))
        .unwrap();
        engine.apply(&config).unwrap();

        let batch = &engine.breakpoints()[0];
        assert_eq!(batch.stubs, 2);
        let (base, _) = batch.region.unwrap();
        let second = engine.locate(base + STUB_SIZE as u32 + 3).unwrap();
        assert_eq!(second.kind, LocationKind::BreakpointStub);
        let slot = engine.locate(base + 2 * STUB_SIZE as u32).unwrap();
        assert_eq!(slot.kind, LocationKind::BreakpointSlot);
    }
}
