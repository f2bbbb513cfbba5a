//! The dynamic table (`.dynamic` section): an ordered list of (tag, value)
//! pairs consumed by the dynamic linker.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use typed_builder::TypedBuilder;

use crate::codec::{self, FromReader, HasWrittenSize, Reader, ToWriter};
use crate::error::Result;

#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[non_exhaustive]
/// The recognized dynamic table entry tags.
///
/// This is not the full ELF `DT_*` enumeration: only the tags the
/// instrumentation engine's remapping phase (phase 6) and parser need to
/// recognize by name are given variants. Unrecognized tags parse as
/// [`DynamicEntry::tag_raw`] without failing.
pub enum DynamicEntryType {
    /// Marks the end of the dynamic array.
    Null = 0,
    /// Name of a needed library.
    Needed = 1,
    /// Size in bytes of the PLT relocation entries.
    PltRelSz = 2,
    /// Address of the procedure linkage table or GOT.
    PltGot = 3,
    /// Address of the symbol hash table.
    Hash = 4,
    /// Address of the string table.
    StrTab = 5,
    /// Address of the symbol table.
    SymTab = 6,
    /// Address of the relocation table with explicit addends.
    Rela = 7,
    /// Total size in bytes of the `Rela` relocation table.
    RelaSz = 8,
    /// Size in bytes of one `Rela` entry.
    RelaEnt = 9,
    /// Size in bytes of the string table.
    StrSz = 10,
    /// Size in bytes of one symbol table entry.
    SymEnt = 11,
    /// Address of the initialization function.
    Init = 12,
    /// Address of the termination function.
    Fini = 13,
    /// Name of the shared object.
    SoName = 14,
    /// Library search path (deprecated).
    RPath = 15,
    /// Indicates symbols defined by this object may override definitions in
    /// executables that use it.
    Symbolic = 16,
    /// Address of the relocation table without explicit addends.
    Rel = 17,
    /// Total size in bytes of the `Rel` relocation table.
    RelSz = 18,
    /// Size in bytes of one `Rel` entry.
    RelEnt = 19,
    /// Type of relocation entry used in the PLT relocation table; either
    /// `Rel` or `Rela`.
    PltRel = 20,
    /// Used for debugging; unspecified contents.
    Debug = 21,
    /// Indicates relocations in this object may reference a statically
    /// allocated GOT/PLT that is not writable at runtime.
    TextRel = 22,
    /// Address of the relocations associated with the PLT.
    JmpRel = 23,
    /// Process all relocations before execution begins.
    BindNow = 24,
    /// Array of initialization functions.
    InitArray = 25,
    /// Array of termination functions.
    FiniArray = 26,
    /// Size in bytes of the array of initialization functions.
    InitArraySz = 27,
    /// Size in bytes of the array of termination functions.
    FiniArraySz = 28,
    /// Library search path.
    RunPath = 29,
    /// Dynamic table flags.
    Flags = 30,
    /// Array of functions invoked before all other initialization functions.
    PreInitArray = 32,
    /// Size in bytes of the array of pre-initialization functions.
    PreInitArraySz = 33,
    /// Address of the `SHT_SYMTAB_SHNDX` section.
    SymTabShndx = 34,
    /// GNU-specific dynamic table flags.
    GnuFlags1 = 0x6ffffdf9,
    /// Address of the GNU version definition table.
    VerDef = 0x6ffffffc,
    /// Number of entries in the GNU version definition table.
    VerDefNum = 0x6ffffffd,
    /// Address of the GNU version requirements table.
    VerNeed = 0x6ffffffe,
    /// Number of entries in the GNU version requirements table.
    VerNeedNum = 0x6fffffff,
    /// Address of the GNU symbol versions table.
    VerSym = 0x6ffffff0,
    /// Address of the GNU hash table.
    GnuHash = 0x6ffffef5,
}

/// The wire-format size of one dynamic table entry.
pub const DYNAMIC_ENTRY_CANONICAL_SIZE: usize = 16;

/// A single `(tag, value)` dynamic table entry.
///
/// Entries whose tag is not one of [`DynamicEntryType`]'s recognized values
/// still decode successfully: `tag_raw` always holds the literal on-disk
/// tag, and `tag` is populated only when it is recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TypedBuilder)]
pub struct DynamicEntry {
    /// Literal on-disk tag value.
    pub tag_raw: i64,
    /// Recognized interpretation of `tag_raw`, if any.
    #[builder(default)]
    pub tag: Option<DynamicEntryType>,
    /// The entry's value; interpretation depends on `tag_raw`.
    pub value: u64,
}

impl DynamicEntry {
    /// Build an entry, inferring `tag` from `tag_raw` automatically.
    pub fn new(tag_raw: i64, value: u64) -> Self {
        Self {
            tag_raw,
            tag: DynamicEntryType::from_i64(tag_raw),
            value,
        }
    }
}

impl HasWrittenSize for DynamicEntry {
    const SIZE: usize = DYNAMIC_ENTRY_CANONICAL_SIZE;
}

impl DynamicEntry {
    /// Decode a dynamic entry whose on-disk stride is `entry_size`.
    pub fn from_reader_with_stride(reader: &mut Reader<'_>, entry_size: usize) -> Result<Self> {
        let tag_raw = reader.read_i64()?;
        let value = reader.read_u64()?;
        if entry_size > Self::SIZE {
            reader.read_bytes(entry_size - Self::SIZE)?;
        }
        Ok(Self::new(tag_raw, value))
    }

    /// Serialize with a given on-disk stride, zero-padding any excess.
    pub fn to_writer_with_stride(&self, buf: &mut Vec<u8>, entry_size: usize) {
        let start = buf.len();
        codec::write_i64(buf, self.tag_raw);
        codec::write_u64(buf, self.value);
        let written = buf.len() - start;
        if entry_size > written {
            buf.resize(buf.len() + (entry_size - written), 0);
        }
    }
}

impl FromReader for DynamicEntry {
    fn from_reader(reader: &mut Reader<'_>) -> Result<Self> {
        Self::from_reader_with_stride(reader, Self::SIZE)
    }
}

impl ToWriter for DynamicEntry {
    fn to_writer(&self, buf: &mut Vec<u8>) {
        self.to_writer_with_stride(buf, Self::SIZE);
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let entry = DynamicEntry::new(DynamicEntryType::StrTab as i64, 0x2000);
        let mut buf = Vec::new();
        entry.to_writer(&mut buf);
        assert_eq!(buf.len(), DynamicEntry::SIZE);
        let mut reader = Reader::new(&buf);
        let read_back = DynamicEntry::from_reader(&mut reader).unwrap();
        assert_eq!(read_back.tag_raw, DynamicEntryType::StrTab as i64);
        assert_eq!(read_back.tag, Some(DynamicEntryType::StrTab));
        assert_eq!(read_back.value, 0x2000);
    }

    #[test]
    fn test_unrecognized_tag_still_decodes() {
        let entry = DynamicEntry::new(0x1234_5678, 1);
        let mut buf = Vec::new();
        entry.to_writer(&mut buf);
        let mut reader = Reader::new(&buf);
        let read_back = DynamicEntry::from_reader(&mut reader).unwrap();
        assert_eq!(read_back.tag_raw, 0x1234_5678);
        assert_eq!(read_back.tag, None);
    }
}
