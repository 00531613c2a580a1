//! Hexdump command implementation.
//!
//! Displays bytes of the simulated target, optionally after applying a
//! configuration, in traditional hexdump format.
//!
//! # Output Format
//!
//! ```text
//! 0x00401000: E9 FB EF BF 0F 90 90 90  90 90 90 90 90 90 90 90  |................|
//! ```

use std::path::Path;

use anyhow::Result;
use hackpoint_core::ReadMemory;

use super::hex_utils::{format_hex_address, hexdump_lines};
use super::target::{apply_quietly, build_memory, load_config};
use crate::TargetArgs;

/// Run the hexdump command
pub fn run(
    address: u32,
    size: usize,
    ascii: bool,
    config: Option<&Path>,
    target: &TargetArgs,
) -> Result<()> {
    let memory = build_memory(target)?;
    let config = load_config(config)?;
    let engine = apply_quietly(&memory, target, &config)?;

    let bytes = memory.read_bytes(address, size)?;

    match engine.locate(address) {
        Some(location) => println!(
            "Hexdump at {} ({}, {} bytes):",
            format_hex_address(address),
            location,
            size
        ),
        None => println!("Hexdump at {} ({} bytes):", format_hex_address(address), size),
    }
    println!();
    for line in hexdump_lines(address, &bytes, ascii) {
        println!("{}", line);
    }

    Ok(())
}
