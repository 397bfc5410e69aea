//! Shared primitive types for the remora workspace.
//!
//! Everything here is a plain value type: the word-sized guest address
//! ([`Word`]), half-open [`Range`]s and coalescing [`RangeSet`]s over them,
//! and the [`MemoryMap`] records produced by the maps reader.

mod range;

pub use range::{Range, RangeSet};

/// Unsigned machine word. All guest and host addresses are `Word`s.
#[cfg(target_pointer_width = "64")]
pub type Word = u64;
/// Unsigned machine word. All guest and host addresses are `Word`s.
#[cfg(target_pointer_width = "32")]
pub type Word = u32;

bitflags::bitflags! {
    /// Page permissions of a mapped region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permission: u8 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.contains(Self::READ) { 'r' } else { '-' },
            if self.contains(Self::WRITE) { 'w' } else { '-' },
            if self.contains(Self::EXEC) { 'x' } else { '-' },
        )
    }
}

/// One mapped region of a process address space.
///
/// Produced by the maps reader and immutable thereafter. `name` is the
/// basename (or full path, when requested) of the backing file, empty for
/// anonymous mappings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMap {
    pub range: Range<Word>,
    pub permission: Permission,
    pub name: String,
}

impl MemoryMap {
    pub fn new(range: Range<Word>, permission: Permission, name: impl Into<String>) -> Self {
        Self {
            range,
            permission,
            name: name.into(),
        }
    }

    pub fn is_executable(&self) -> bool {
        self.permission.contains(Permission::EXEC)
    }
}
