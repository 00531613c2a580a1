//! Machine code emitted for breakpoints. Every function here is pure: it
//! only computes bytes for addresses chosen by the installer.

use super::{CALL_LEN, SLOT_SIZE};

pub const CALL_REL32: u8 = 0xE8;
pub const JMP_REL32: u8 = 0xE9;
pub const NOP: u8 = 0x90;
pub const INT3: u8 = 0xCC;
pub const RET: u8 = 0xC3;
pub const RET_IMM16: u8 = 0xC2;

/// Size reserved for the shared entry stub
pub const STUB_SIZE: usize = 32;

/// Displacement of a rel32 branch whose next instruction is at `next`
pub fn rel32(next: u32, target: u32) -> u32 {
    target.wrapping_sub(next)
}

/// Shared entry stub, placed at `stub`:
///
/// ```text
/// pushad
/// pushfd
/// push esp            ; CpuState*
/// push <table>
/// call <dispatcher>   ; returns the (possibly moved) CpuState*
/// mov esp, eax
/// popfd
/// popad
/// ret <stack_clear>   ; to CpuState::retaddr
/// ```
///
/// A nonzero `stack_clear` ends the stub with `ret imm16`, popping that many
/// bytes of arguments.
pub fn entry_stub(stub: u32, table: u32, dispatcher: u32, stack_clear: u16) -> [u8; STUB_SIZE] {
    let mut bytes = [INT3; STUB_SIZE];
    bytes[..4].copy_from_slice(&[0x60, 0x9C, 0x54, 0x68]);
    bytes[4..8].copy_from_slice(&table.to_le_bytes());
    bytes[8] = CALL_REL32;
    let call_next = stub.wrapping_add(13);
    bytes[9..13].copy_from_slice(&rel32(call_next, dispatcher).to_le_bytes());
    bytes[13..17].copy_from_slice(&[0x89, 0xC4, 0x9D, 0x61]);
    if stack_clear == 0 {
        bytes[17] = RET;
    } else {
        bytes[17] = RET_IMM16;
        bytes[18..20].copy_from_slice(&stack_clear.to_le_bytes());
    }
    bytes
}

/// Relocated copy of the `original` bytes taken from `address`, to be placed
/// at `slot`. A leading relative call or jump is retargeted, and the slot
/// ends with a jump back to the first instruction after the stolen bytes.
pub fn relocated_slot(original: &[u8], address: u32, slot: u32) -> [u8; SLOT_SIZE] {
    let cavesize = original.len();
    let mut bytes = [INT3; SLOT_SIZE];
    bytes[..cavesize].copy_from_slice(original);

    if cavesize >= CALL_LEN && matches!(original[0], CALL_REL32 | JMP_REL32) {
        let old = u32::from_le_bytes([original[1], original[2], original[3], original[4]]);
        let fixed = old.wrapping_add(address.wrapping_sub(slot));
        bytes[1..5].copy_from_slice(&fixed.to_le_bytes());
    }

    let jump_next = slot.wrapping_add((cavesize + CALL_LEN) as u32);
    let back = address.wrapping_add(cavesize as u32);
    bytes[cavesize] = JMP_REL32;
    bytes[cavesize + 1..cavesize + CALL_LEN].copy_from_slice(&rel32(jump_next, back).to_le_bytes());
    bytes
}

/// `call stub` written over the first `cavesize` bytes at `address`,
/// padded with NOPs
pub fn redirect(address: u32, stub: u32, cavesize: usize) -> Vec<u8> {
    let mut bytes = vec![NOP; cavesize.max(CALL_LEN)];
    bytes[0] = CALL_REL32;
    let next = address.wrapping_add(CALL_LEN as u32);
    bytes[1..CALL_LEN].copy_from_slice(&rel32(next, stub).to_le_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn test_entry_stub_layout() {
        let stub = entry_stub(0x1000_0000, 0xDEAD_BEEF, 0x7FF0_0000, 0);
        assert_eq!(&stub[..4], &[0x60, 0x9C, 0x54, 0x68]);
        assert_eq!(rel_at(&stub, 4), 0xDEAD_BEEF);
        assert_eq!(stub[8], CALL_REL32);
        assert_eq!(rel_at(&stub, 9).wrapping_add(0x1000_000D), 0x7FF0_0000);
        assert_eq!(&stub[13..18], &[0x89, 0xC4, 0x9D, 0x61, RET]);
        assert!(stub[18..].iter().all(|&b| b == INT3));
    }

    #[test]
    fn test_entry_stub_pops_arguments() {
        let plain = entry_stub(0x1000_0000, 0xDEAD_BEEF, 0x7FF0_0000, 0);
        let stub = entry_stub(0x1000_0000, 0xDEAD_BEEF, 0x7FF0_0000, 0x0C);
        assert_eq!(&stub[..17], &plain[..17]);
        assert_eq!(&stub[17..20], &[RET_IMM16, 0x0C, 0x00]);
        assert!(stub[20..].iter().all(|&b| b == INT3));

        let stub = entry_stub(0x1000_0000, 0, 0, 0x1234);
        assert_eq!(&stub[17..20], &[RET_IMM16, 0x34, 0x12]);
    }

    #[test]
    fn test_relocated_slot_jumps_back() {
        let original = [0x55, 0x8B, 0xEC, 0x83, 0xEC, 0x10];
        let slot = relocated_slot(&original, 0x0040_1000, 0x1000_0020);
        assert_eq!(&slot[..6], &original);
        assert_eq!(slot[6], JMP_REL32);
        assert_eq!(rel_at(&slot, 7).wrapping_add(0x1000_0020 + 11), 0x0040_1006);
        assert!(slot[11..].iter().all(|&b| b == INT3));
    }

    #[test]
    fn test_relocated_slot_fixes_leading_call() {
        // call 0x00402000 from 0x00401000
        let target = 0x0040_2000u32;
        let mut original = vec![CALL_REL32];
        original.extend_from_slice(&rel32(0x0040_1005, target).to_le_bytes());
        let slot_address = 0x1000_0020;
        let slot = relocated_slot(&original, 0x0040_1000, slot_address);
        assert_eq!(slot[0], CALL_REL32);
        assert_eq!(rel_at(&slot, 1).wrapping_add(slot_address + 5), target);
    }

    #[test]
    fn test_relocated_slot_leaves_other_instructions() {
        let original = [0xB8, 0x01, 0x00, 0x00, 0x00];
        let slot = relocated_slot(&original, 0x0040_1000, 0x1000_0020);
        assert_eq!(&slot[..5], &original);
    }

    #[test]
    fn test_largest_cave_fits_slot() {
        let original = [NOP; SLOT_SIZE - CALL_LEN];
        let slot = relocated_slot(&original, 0x0040_1000, 0x1000_0020);
        assert_eq!(slot[SLOT_SIZE - CALL_LEN], JMP_REL32);
    }

    #[test]
    fn test_redirect_is_nop_padded() {
        let bytes = redirect(0x0040_1000, 0x1000_0000, 7);
        assert_eq!(bytes.len(), 7);
        assert_eq!(bytes[0], CALL_REL32);
        assert_eq!(rel_at(&bytes, 1).wrapping_add(0x0040_1005), 0x1000_0000);
        assert_eq!(&bytes[5..], &[NOP, NOP]);
    }
}
