//! Offset command implementation.

use anyhow::Result;

use super::hex_utils::{format_hex_address, parse_hex_address};

/// rel32 operand of a 5-byte `call`/`jmp` at `from` reaching `to`
pub fn branch_displacement(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from.wrapping_add(5))
}

/// Run the offset command
pub fn run(from: &str, to: &str) -> Result<()> {
    let from_addr = parse_hex_address(from)?;
    let to_addr = parse_hex_address(to)?;

    let diff = from_addr.abs_diff(to_addr);
    let sign = if to_addr >= from_addr { "" } else { "-" };

    println!("From: {}", format_hex_address(from_addr));
    println!("To:   {}", format_hex_address(to_addr));
    println!();
    println!("Offset: {}{} (0x{:X})", sign, diff, diff);
    let rel = branch_displacement(from_addr, to_addr);
    println!(
        "rel32:  0x{:08X} (E8/E9 {})",
        rel,
        rel.to_le_bytes()
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    );

    Ok(())
}
