//! Predicates over a decoded instruction, composable with boolean
//! connectives.

use remora_types::{Range, Word};
use remora_x86::DecodedInst;

/// A predicate evaluated against the instruction being instrumented.
#[derive(Debug, Clone)]
pub enum PatchCondition {
    /// Always matches.
    True,
    /// Mnemonic comparison, case-insensitive, with an optional trailing
    /// `*` wildcard (`"J*"` matches every jump mnemonic).
    MnemonicIs(String),
    /// The instruction starts exactly at this address.
    AddressIs(Word),
    /// The instruction starts inside `[start, end)`.
    InstructionInRange(Range<Word>),
    /// The instruction may read memory.
    DoesReadAccess,
    /// The instruction may write memory.
    DoesWriteAccess,
    And(Vec<PatchCondition>),
    Or(Vec<PatchCondition>),
    Not(Box<PatchCondition>),
}

impl PatchCondition {
    pub fn test(&self, decoded: &DecodedInst) -> bool {
        match self {
            PatchCondition::True => true,
            PatchCondition::MnemonicIs(pattern) => {
                mnemonic_matches(pattern, &remora_x86::mnemonic_name(decoded.mnemonic()))
            }
            PatchCondition::AddressIs(addr) => decoded.address() as Word == *addr,
            PatchCondition::InstructionInRange(range) => {
                range.contains(decoded.address() as Word)
            }
            PatchCondition::DoesReadAccess => remora_x86::may_read_memory(&decoded.instr),
            PatchCondition::DoesWriteAccess => remora_x86::may_write_memory(&decoded.instr),
            PatchCondition::And(conds) => conds.iter().all(|c| c.test(decoded)),
            PatchCondition::Or(conds) => conds.iter().any(|c| c.test(decoded)),
            PatchCondition::Not(cond) => !cond.test(decoded),
        }
    }
}

fn mnemonic_matches(pattern: &str, mnemonic: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => mnemonic
            .to_uppercase()
            .starts_with(&prefix.to_uppercase()),
        None => mnemonic.eq_ignore_ascii_case(pattern),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8], ip: u64) -> DecodedInst {
        remora_x86::decode(bytes, ip).unwrap()
    }

    #[test]
    fn mnemonic_patterns() {
        let mov = decode(&[0x48, 0xC7, 0xC0, 0x2A, 0x00, 0x00, 0x00], 0x1000);
        assert!(PatchCondition::MnemonicIs("mov".into()).test(&mov));
        assert!(PatchCondition::MnemonicIs("MOV".into()).test(&mov));
        assert!(PatchCondition::MnemonicIs("M*".into()).test(&mov));
        assert!(!PatchCondition::MnemonicIs("MOVS".into()).test(&mov));

        let jne = decode(&[0x75, 0x02], 0x1000);
        assert!(PatchCondition::MnemonicIs("J*".into()).test(&jne));
    }

    #[test]
    fn address_predicates() {
        let nop = decode(&[0x90], 0x1234);
        assert!(PatchCondition::AddressIs(0x1234).test(&nop));
        assert!(!PatchCondition::AddressIs(0x1235).test(&nop));
        assert!(PatchCondition::InstructionInRange(Range::new(0x1000, 0x2000)).test(&nop));
        assert!(!PatchCondition::InstructionInRange(Range::new(0x2000, 0x3000)).test(&nop));
    }

    #[test]
    fn access_predicates_and_connectives() {
        // mov [rdi], rax
        let store = decode(&[0x48, 0x89, 0x07], 0x1000);
        assert!(PatchCondition::DoesWriteAccess.test(&store));
        assert!(!PatchCondition::DoesReadAccess.test(&store));
        assert!(PatchCondition::Or(vec![
            PatchCondition::DoesReadAccess,
            PatchCondition::DoesWriteAccess
        ])
        .test(&store));
        assert!(PatchCondition::And(vec![
            PatchCondition::DoesWriteAccess,
            PatchCondition::Not(Box::new(PatchCondition::DoesReadAccess)),
        ])
        .test(&store));
    }
}
