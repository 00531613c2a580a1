//! Render command implementation.

use std::path::Path;

use anyhow::{Result, bail};
use hackpoint_core::{Scope, compile};

use super::hex_utils::{format_hex_address, hexdump_lines};
use super::target::{apply_quietly, build_memory, load_config};
use crate::TargetArgs;

/// Render `code` at `at`, after applying `config`
pub fn render_code(
    code: &str,
    at: u32,
    config: Option<&Path>,
    target: &TargetArgs,
) -> Result<Vec<u8>> {
    let memory = build_memory(target)?;
    let config = load_config(config)?;
    let engine = apply_quietly(&memory, target, &config)?;

    let compiled = compile(code)?;
    let scope = Scope::new(engine.registry(), &config.options).with_memory(memory.as_ref());
    let bytes = compiled.render(at, &scope)?;
    let size = compiled.size(&config.options);
    if bytes.len() != size {
        bail!("Rendered {} bytes but computed {}", bytes.len(), size);
    }
    Ok(bytes)
}

/// Run the render command
pub fn run(code: &str, at: u32, config: Option<&Path>, target: &TargetArgs) -> Result<()> {
    let bytes = render_code(code, at, config, target)?;
    println!("{} bytes at {}:", bytes.len(), format_hex_address(at));
    println!();
    for line in hexdump_lines(at, &bytes, false) {
        println!("{}", line);
    }
    Ok(())
}
