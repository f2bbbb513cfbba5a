//! Section header table entries: named, typed regions described by the
//! section header table.

use bitflags::bitflags;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use typed_builder::TypedBuilder;

use crate::codec::{self, FromReader, HasWrittenSize, Reader, ToWriter};
use crate::error::{Error, ErrorContext, Result};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[non_exhaustive]
/// The section's contents and semantics (`sh_type`).
pub enum SectionType {
    /// Marks the section header as inactive; it has no associated section.
    NullUndefined = 0,
    /// Holds information defined by the program, whose format and meaning
    /// are determined solely by the program.
    ProgBits = 1,
    /// Holds a symbol table for link editing.
    SymbolTable = 2,
    /// The section holds a string table.
    StringTable = 3,
    /// Holds relocation entries with explicit addends (`Elf64_Rela`).
    RelocationExplicit = 4,
    /// Holds a symbol hash table.
    Hash = 5,
    /// Holds information for dynamic linking.
    Dynamic = 6,
    /// Holds information that marks the file in some way (notes).
    Note = 7,
    /// Occupies no space in the file but otherwise resembles `ProgBits`.
    NoBits = 8,
    /// Holds relocation entries without explicit addends (`Elf64_Rel`).
    RelocationImplicit = 9,
    /// Reserved, unspecified semantics.
    SectionHeaderLibrary = 10,
    /// Holds a minimal symbol table for dynamic linking.
    DynamicSymbol = 11,
    /// Array of pointers to initialization functions.
    InitializerArray = 14,
    /// Array of pointers to termination functions.
    FinalizerArray = 15,
    /// Array of pointers to pre-initialization functions.
    PreInitializerArray = 16,
    /// Defines a section group.
    Group = 17,
    /// Extended section indices for an associated symbol table.
    SymbolTableSectionHeaderIndex = 18,
    /// RELR relative relocations.
    RelR = 19,
    /// GNU attributes section.
    GnuAttributes = 0x6ffffff5,
    /// GNU hash table, a faster alternative to `Hash`.
    GnuHash = 0x6ffffff6,
    /// GNU library list.
    GnuLibList = 0x6ffffff7,
    /// GNU version definitions.
    GnuVerdef = 0x6ffffffd,
    /// GNU version requirements.
    GnuVerneed = 0x6ffffffe,
    /// GNU symbol versions.
    GnuVersym = 0x6fffffff,
    /// x86_64-specific unwind information.
    X86_64Unwind = 0x70000001,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    /// Section attribute bit-flags (`sh_flags`).
    pub struct SectionFlags: u64 {
        /// The section contains data that should be writable during process execution.
        const WRITE = 0x1;
        /// The section occupies memory during process execution.
        const ALLOC = 0x2;
        /// Contains executable machine instructions.
        const EXECUTABLE_INSTRUCTIONS = 0x4;
        /// The data in the section may be merged to eliminate duplication.
        const MERGE = 0x10;
        /// The data elements consist of null-terminated character strings.
        const STRINGS = 0x20;
        /// The `info` field holds a section header table index.
        const INFO_LINK = 0x40;
        /// Adds special ordering requirements for link editors.
        const LINK_ORDER = 0x80;
        /// Requires special OS-specific processing.
        const OS_NON_CONFORMING = 0x100;
        /// This section is a member of a section group.
        const GROUP = 0x200;
        /// This section holds Thread-Local Storage.
        const THREAD_LOCAL_STORAGE = 0x400;
        /// Identifies a section containing compressed data.
        const COMPRESSED = 0x800;
        /// GNU extension: section must be retained, even if otherwise unused.
        const GNU_RETAIN = 0x200000;
    }
}

/// The wire-format-canonical size of a section header entry, before stride
/// padding.
pub const SECTION_HEADER_CANONICAL_SIZE: usize = 64;

/// A single section header.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct SectionHeader {
    /// Byte offset into the section-name string table.
    pub name_string_table_offset: u32,
    /// Literal on-disk `sh_type` value. Section contents and semantics;
    /// recognized values are available via [`SectionHeader::r#type`], but an
    /// unrecognized `sh_type` (a reserved or processor-specific value this
    /// crate doesn't name) is not malformed ELF and must still round-trip.
    pub type_raw: u32,
    /// Attribute bit-flags.
    pub flags: SectionFlags,
    /// Address at which the section's first byte should reside in memory,
    /// or 0 if the section is not loaded.
    pub virtual_address: u64,
    /// Byte offset from the beginning of the file to the first byte of the
    /// section (conceptual placement for `NoBits`).
    pub file_offset: u64,
    /// Section size in bytes (file size, except for `NoBits`).
    pub size: u64,
    /// A section header table index whose interpretation depends on
    /// `type`: for `Dynamic`, the associated string table; for `Hash`, the
    /// associated symbol table; for `RelocationExplicit`/`RelocationImplicit`,
    /// the associated symbol table; for `SymbolTable`/`DynamicSymbol`, the
    /// associated string table; for `Group`, the associated symbol table.
    pub link: u32,
    /// Extra information whose interpretation depends on `type`: for
    /// relocation sections, the section the relocations apply to; for
    /// symbol tables, one greater than the index of the last local symbol.
    pub info: u32,
    /// Required alignment; a power of two, or 0/1 for no constraint.
    pub alignment: u64,
    /// Size in bytes of one entry, for sections holding a table of
    /// fixed-size entries; 0 otherwise.
    pub entry_size: u64,
}

impl HasWrittenSize for SectionHeader {
    const SIZE: usize = SECTION_HEADER_CANONICAL_SIZE;
}

impl SectionHeader {
    /// The recognized interpretation of `type_raw`, if it names one of
    /// [`SectionType`]'s discriminants. `None` for reserved, vendor, or
    /// otherwise unrecognized `sh_type` values; that is not an error.
    pub fn r#type(&self) -> Option<SectionType> {
        SectionType::from_u32(self.type_raw)
    }

    /// Decode a section header entry whose on-disk stride is `entry_size`.
    pub fn from_reader_with_stride(reader: &mut Reader<'_>, entry_size: usize) -> Result<Self> {
        let start = reader.offset();
        if entry_size < Self::SIZE {
            return Err(Error::Corrupted {
                context: ErrorContext::at(start),
                reason: "section header entry size smaller than canonical layout",
            });
        }
        let name_string_table_offset = reader.read_u32()?;
        let type_raw = reader.read_u32()?;
        let flags_value = reader.read_u64()?;
        let flags = SectionFlags::from_bits_truncate(flags_value);
        let virtual_address = reader.read_u64()?;
        let file_offset = reader.read_u64()?;
        let size = reader.read_u64()?;
        let link = reader.read_u32()?;
        let info = reader.read_u32()?;
        let alignment = reader.read_u64()?;
        let entry_size_field = reader.read_u64()?;
        let padding = entry_size - Self::SIZE;
        if padding > 0 {
            reader.read_bytes(padding)?;
        }
        Ok(Self::builder()
            .name_string_table_offset(name_string_table_offset)
            .type_raw(type_raw)
            .flags(flags)
            .virtual_address(virtual_address)
            .file_offset(file_offset)
            .size(size)
            .link(link)
            .info(info)
            .alignment(alignment)
            .entry_size(entry_size_field)
            .build())
    }

    /// Serialize with a given on-disk stride, zero-padding any excess.
    pub fn to_writer_with_stride(&self, buf: &mut Vec<u8>, entry_size: usize) {
        let start = buf.len();
        codec::write_u32(buf, self.name_string_table_offset);
        codec::write_u32(buf, self.type_raw);
        codec::write_u64(buf, self.flags.bits());
        codec::write_u64(buf, self.virtual_address);
        codec::write_u64(buf, self.file_offset);
        codec::write_u64(buf, self.size);
        codec::write_u32(buf, self.link);
        codec::write_u32(buf, self.info);
        codec::write_u64(buf, self.alignment);
        codec::write_u64(buf, self.entry_size);
        let written = buf.len() - start;
        if entry_size > written {
            buf.resize(buf.len() + (entry_size - written), 0);
        }
    }
}

impl FromReader for SectionHeader {
    fn from_reader(reader: &mut Reader<'_>) -> Result<Self> {
        Self::from_reader_with_stride(reader, Self::SIZE)
    }
}

impl ToWriter for SectionHeader {
    fn to_writer(&self, buf: &mut Vec<u8>) {
        self.to_writer_with_stride(buf, Self::SIZE);
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> SectionHeader {
        SectionHeader::builder()
            .name_string_table_offset(1)
            .type_raw(SectionType::ProgBits as u32)
            .flags(SectionFlags::ALLOC | SectionFlags::EXECUTABLE_INSTRUCTIONS)
            .virtual_address(0x1000)
            .file_offset(0x1000)
            .size(0x200)
            .link(0)
            .info(0)
            .alignment(16)
            .entry_size(0)
            .build()
    }

    #[test]
    fn test_roundtrip_canonical() {
        let header = sample();
        let mut buf = Vec::new();
        header.to_writer(&mut buf);
        assert_eq!(buf.len(), SectionHeader::SIZE);
        let mut reader = Reader::new(&buf);
        assert_eq!(SectionHeader::from_reader(&mut reader).unwrap(), header);
    }

    #[test]
    fn test_gnu_hash_type_value() {
        assert_eq!(SectionType::GnuHash as u32, 0x6ffffff6);
        assert_eq!(SectionType::GnuVerdef as u32, 0x6ffffffd);
        assert_eq!(SectionType::GnuVerneed as u32, 0x6ffffffe);
        assert_eq!(SectionType::GnuVersym as u32, 0x6fffffff);
    }

    #[test]
    fn test_stride_padding() {
        let header = sample();
        let mut buf = Vec::new();
        header.to_writer_with_stride(&mut buf, 72);
        assert_eq!(buf.len(), 72);
        assert!(buf[64..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_recognized_type_accessor() {
        assert_eq!(sample().r#type(), Some(SectionType::ProgBits));
    }

    #[test]
    fn test_unrecognized_type_still_decodes() {
        let mut header = sample();
        header.type_raw = 0x1234_5678;
        let mut buf = Vec::new();
        header.to_writer(&mut buf);
        let mut reader = Reader::new(&buf);
        let read_back = SectionHeader::from_reader(&mut reader).unwrap();
        assert_eq!(read_back.type_raw, 0x1234_5678);
        assert_eq!(read_back.r#type(), None);
    }
}
