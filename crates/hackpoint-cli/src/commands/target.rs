//! The simulated process shared by all commands.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use hackpoint_core::{
    AddressRegistry, BreakpointHit, Engine, HackConfig, Protection, SimulatedMemory,
};
use tracing::{debug, info};

use crate::TargetArgs;

/// Map the image described by `args`
pub fn build_memory(args: &TargetArgs) -> Result<Arc<SimulatedMemory>> {
    let image = match &args.image {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("Failed to read image {}", path.display()))?,
        None => vec![0x90; args.image_size as usize],
    };
    debug!("Mapping {} bytes at {:#010x}", image.len(), args.base);
    Ok(Arc::new(
        SimulatedMemory::builder()
            .module_base(args.base)
            .map(args.base, image, Protection::ExecuteRead)
            .build(),
    ))
}

pub fn load_config(path: Option<&Path>) -> Result<HackConfig> {
    match path {
        Some(path) => HackConfig::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display())),
        None => Ok(HackConfig::default()),
    }
}

pub fn register_symbols(registry: &mut AddressRegistry, args: &TargetArgs) {
    for (name, address) in &args.symbols {
        registry.register(name.clone(), *address);
    }
}

/// Engine over `memory` with the command line symbols registered
pub fn build_engine(memory: &Arc<SimulatedMemory>, args: &TargetArgs) -> Engine {
    let mut engine = Engine::new(memory.clone());
    register_symbols(engine.registry_mut(), args);
    engine
}

/// Register a handler that only logs hits for every breakpoint in `config`
pub fn register_stub_handlers(engine: &mut Engine, config: &HackConfig) {
    for bp in &config.breakpoints {
        let name = bp.handler_name();
        if engine.handlers().contains(&name) {
            continue;
        }
        engine
            .handlers_mut()
            .register(name, |hit: &mut BreakpointHit<'_>| {
                info!("{} hit at {:#010x}: {:?}", hit.name, hit.address, hit.regs);
                hit.default_resume()
            });
    }
}

/// Apply `config` with stub handlers, for commands that only need the result
pub fn apply_quietly(
    memory: &Arc<SimulatedMemory>,
    args: &TargetArgs,
    config: &HackConfig,
) -> Result<Engine> {
    let mut engine = build_engine(memory, args);
    if !config.is_empty() {
        register_stub_handlers(&mut engine, config);
        engine.apply(config)?;
    }
    Ok(engine)
}

#[cfg(test)]
pub fn test_target() -> TargetArgs {
    TargetArgs {
        image: None,
        base: 0x400000,
        image_size: 0x1000,
        symbols: vec![("th_func".to_string(), 0x402000)],
    }
}
