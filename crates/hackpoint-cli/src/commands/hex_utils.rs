//! Address parsing and hexdump formatting utilities.

use anyhow::{Result, anyhow};

/// Parse a 32-bit hex address string (with or without 0x prefix).
pub fn parse_hex_address(s: &str) -> Result<u32> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|e| anyhow!("Invalid hex address '{}': {}", s, e))
}

/// Parse `name=0x1234`
pub fn parse_assignment(s: &str) -> Result<(String, u32)> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("Expected name=value, got '{}'", s))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("Empty name in '{}'", s));
    }
    Ok((name.to_string(), parse_hex_address(value)?))
}

/// Format an address as a zero-padded hex string with 0x prefix.
pub fn format_hex_address(addr: u32) -> String {
    format!("0x{:08X}", addr)
}

/// Hexdump lines for `bytes` located at `address`:
///
/// ```text
/// 0x00401000: 48 65 6C 6C 6F 20 57 6F  72 6C 64 00 00 00 00 00  |Hello World.....|
/// ```
pub fn hexdump_lines(address: u32, bytes: &[u8], ascii: bool) -> Vec<String> {
    bytes
        .chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            let mut line = format!("{}: ", format_hex_address(address.wrapping_add(i as u32 * 16)));

            for j in 0..16 {
                if j == 8 {
                    line.push(' ');
                }
                match chunk.get(j) {
                    Some(byte) => line.push_str(&format!("{:02X} ", byte)),
                    None => line.push_str("   "),
                }
            }

            if ascii {
                line.push_str(" |");
                for byte in chunk {
                    if (0x20..0x7F).contains(byte) {
                        line.push(*byte as char);
                    } else {
                        line.push('.');
                    }
                }
                for _ in chunk.len()..16 {
                    line.push(' ');
                }
                line.push('|');
            }
            line.trim_end().to_string()
        })
        .collect()
}
