//! Guest memory-access reconstruction.
//!
//! When memory recording is enabled, every matching instruction carries a
//! pre- or post-position break; at that point the engine reconstructs the
//! instruction's effective addresses from the decoded operands and the
//! materialized guest registers, reads the touched values (the guest runs
//! in our own address space) and appends records to the block's shadow
//! buffer. Reads are recorded before the instruction executes, writes
//! after.

use remora_types::Word;
use remora_x86::{DecodedInst, MemOperand, Register};

use crate::callback::{MemoryAccess, MemoryAccessFlags, MemoryAccessType};
use crate::state::GPRState;

/// Effective address of one memory operand under `gpr`.
fn effective_address(op: &MemOperand, gpr: &GPRState) -> Word {
    if op.base == Register::RIP {
        // iced reports RIP-relative operands with the absolute target in
        // the displacement.
        return op.displacement;
    }
    let base = match op.base {
        Register::None => 0,
        reg => gpr.read_reg(reg),
    };
    let index = match op.index {
        Register::None => 0,
        reg => gpr.read_reg(reg),
    };
    base.wrapping_add(index.wrapping_mul(op.scale as Word))
        .wrapping_add(op.displacement)
}

/// Read the accessed value when it fits a machine word.
fn read_value(addr: Word, size: usize) -> (Word, MemoryAccessFlags) {
    // SAFETY: the guest is about to access (or just accessed) this address
    // in our own address space; a fault here would equally fault the guest.
    unsafe {
        match size {
            1 => ((addr as *const u8).read_unaligned() as Word, MemoryAccessFlags::empty()),
            2 => ((addr as *const u16).read_unaligned() as Word, MemoryAccessFlags::empty()),
            4 => ((addr as *const u32).read_unaligned() as Word, MemoryAccessFlags::empty()),
            8 => ((addr as *const u64).read_unaligned() as Word, MemoryAccessFlags::empty()),
            _ => (0, MemoryAccessFlags::UNKNOWN_VALUE),
        }
    }
}

/// Reconstruct the accesses of `decoded` in the directions `wanted`.
///
/// A read-write operand produces one record per permitted direction, so a
/// combined mask sees both sides of the access.
pub fn compute_accesses(
    decoded: &DecodedInst,
    gpr: &GPRState,
    wanted: MemoryAccessType,
) -> Vec<MemoryAccess> {
    let inst_address = decoded.address() as Word;
    let mut accesses = Vec::new();
    for op in remora_x86::memory_operands(&decoded.instr) {
        if op.size == 0 {
            continue;
        }
        let read = wanted.contains(MemoryAccessType::MEMORY_READ) && op.access.may_read();
        let write = wanted.contains(MemoryAccessType::MEMORY_WRITE) && op.access.may_write();
        if !read && !write {
            continue;
        }
        let access_address = effective_address(&op, gpr);
        let (value, flags) = read_value(access_address, op.size);
        if read {
            accesses.push(MemoryAccess {
                inst_address,
                access_address,
                size: op.size,
                kind: MemoryAccessType::MEMORY_READ,
                value,
                flags,
            });
        }
        if write {
            accesses.push(MemoryAccess {
                inst_address,
                access_address,
                size: op.size,
                kind: MemoryAccessType::MEMORY_WRITE,
                value,
                flags,
            });
        }
    }
    accesses
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reconstructs_base_index_scale_addresses() {
        // mov rax, [rdi + rsi*4 + 8]
        let d = remora_x86::decode(&[0x48, 0x8B, 0x44, 0xB7, 0x08], 0x1000).unwrap();
        let buf = vec![0u8; 64];
        let gpr = GPRState {
            rdi: buf.as_ptr() as Word,
            rsi: 2,
            ..GPRState::default()
        };
        let accesses = compute_accesses(&d, &gpr, MemoryAccessType::MEMORY_READ);
        assert_eq!(accesses.len(), 1);
        assert_eq!(accesses[0].access_address, buf.as_ptr() as Word + 16);
        assert_eq!(accesses[0].size, 8);
        assert_eq!(accesses[0].kind, MemoryAccessType::MEMORY_READ);
    }

    #[test]
    fn reads_the_accessed_value() {
        // mov eax, [rdi]
        let d = remora_x86::decode(&[0x8B, 0x07], 0x1000).unwrap();
        let buf = 0xDEAD_BEEFu32.to_le_bytes();
        let gpr = GPRState {
            rdi: buf.as_ptr() as Word,
            ..GPRState::default()
        };
        let accesses = compute_accesses(&d, &gpr, MemoryAccessType::MEMORY_READ);
        assert_eq!(accesses[0].value, 0xDEAD_BEEF);
        assert_eq!(accesses[0].flags, MemoryAccessFlags::empty());
    }

    #[test]
    fn read_write_operand_reports_both_directions() {
        // inc qword [rdi]
        let d = remora_x86::decode(&[0x48, 0xFF, 0x07], 0x1000).unwrap();
        let buf = 7u64.to_le_bytes();
        let gpr = GPRState {
            rdi: buf.as_ptr() as Word,
            ..GPRState::default()
        };
        let accesses = compute_accesses(&d, &gpr, MemoryAccessType::MEMORY_READ_WRITE);
        assert_eq!(accesses.len(), 2);
        assert_eq!(accesses[0].kind, MemoryAccessType::MEMORY_READ);
        assert_eq!(accesses[1].kind, MemoryAccessType::MEMORY_WRITE);
        assert_eq!(accesses[0].access_address, accesses[1].access_address);
        assert_eq!(accesses[0].size, 8);
    }

    #[test]
    fn write_direction_is_filtered() {
        // mov [rdi], rax
        let d = remora_x86::decode(&[0x48, 0x89, 0x07], 0x1000).unwrap();
        let buf = [0u8; 8];
        let gpr = GPRState {
            rdi: buf.as_ptr() as Word,
            ..GPRState::default()
        };
        assert_eq!(
            compute_accesses(&d, &gpr, MemoryAccessType::MEMORY_READ).len(),
            0
        );
        assert_eq!(
            compute_accesses(&d, &gpr, MemoryAccessType::MEMORY_WRITE).len(),
            1
        );
    }
}
