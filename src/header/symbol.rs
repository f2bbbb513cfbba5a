//! Symbol table entries, shared by `.symtab` and `.dynsym`.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use typed_builder::TypedBuilder;

use crate::codec::{self, FromReader, HasWrittenSize, Reader, ToWriter};
use crate::error::Result;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[non_exhaustive]
/// The symbol's binding attribute, occupying the high 4 bits of `st_info`.
pub enum SymbolBind {
    /// Not visible outside the defining object file.
    Local = 0,
    /// Visible to all object files being combined.
    Global = 1,
    /// Like `Global`, but with lower precedence.
    Weak = 2,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[non_exhaustive]
/// The symbol's type, occupying the low 4 bits of `st_info`.
pub enum SymbolType {
    /// Type not specified.
    NoType = 0,
    /// Associated with a data object.
    Object = 1,
    /// Associated with a function or executable code.
    Func = 2,
    /// Associated with a section.
    Section = 3,
    /// Associated with the name of the source file.
    File = 4,
    /// An uninitialized common block.
    Common = 5,
    /// Thread-local storage object.
    TLS = 6,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[non_exhaustive]
/// The symbol's visibility, occupying the low 2 bits of `st_other`.
pub enum SymbolVisibility {
    /// Visibility governed by binding.
    Default = 0,
    /// Not exported to other executables or shared objects.
    Internal = 1,
    /// Not preemptible at link time.
    Hidden = 2,
    /// Visible, not preemptible.
    Protected = 3,
}

/// Decoded `st_info`: a symbol's binding and type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolInfo {
    /// Binding attribute.
    pub bind: Option<SymbolBind>,
    /// Symbol type.
    pub r#type: Option<SymbolType>,
    /// Literal on-disk byte.
    pub raw: u8,
}

impl SymbolInfo {
    /// Decode `st_info` from its packed byte.
    pub fn from_byte(raw: u8) -> Self {
        Self {
            bind: SymbolBind::from_u8(raw >> 4),
            r#type: SymbolType::from_u8(raw & 0xf),
            raw,
        }
    }

    /// Construct from a binding and type, deriving the packed byte.
    pub fn new(bind: SymbolBind, r#type: SymbolType) -> Self {
        let raw = ((bind as u8) << 4) | (r#type as u8 & 0xf);
        Self {
            bind: Some(bind),
            r#type: Some(r#type),
            raw,
        }
    }
}

/// The wire-format size of one symbol table entry.
pub const SYMBOL_TABLE_ENTRY_CANONICAL_SIZE: usize = 24;

/// A single symbol table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TypedBuilder)]
pub struct SymbolTableEntry {
    /// Byte offset into the associated string table naming this symbol.
    pub name_string_table_offset: u32,
    /// Packed binding and type.
    pub info: SymbolInfo,
    /// Reserved; holds the symbol's visibility in its low 2 bits.
    pub other: u8,
    /// Section header table index the symbol is defined in relation to.
    pub section_header_index: u16,
    /// Symbol value: an address, offset, or other interpretation depending
    /// on context.
    pub value: u64,
    /// Size of the object the symbol refers to, or 0 if unknown/none.
    pub size: u64,
}

impl SymbolTableEntry {
    /// The symbol's visibility, decoded from `other`.
    pub fn visibility(&self) -> Option<SymbolVisibility> {
        SymbolVisibility::from_u8(self.other & 0x3)
    }
}

impl HasWrittenSize for SymbolTableEntry {
    const SIZE: usize = SYMBOL_TABLE_ENTRY_CANONICAL_SIZE;
}

impl FromReader for SymbolTableEntry {
    fn from_reader(reader: &mut Reader<'_>) -> Result<Self> {
        let name_string_table_offset = reader.read_u32()?;
        let info = SymbolInfo::from_byte(reader.read_u8()?);
        let other = reader.read_u8()?;
        let section_header_index = reader.read_u16()?;
        let value = reader.read_u64()?;
        let size = reader.read_u64()?;
        Ok(Self::builder()
            .name_string_table_offset(name_string_table_offset)
            .info(info)
            .other(other)
            .section_header_index(section_header_index)
            .value(value)
            .size(size)
            .build())
    }
}

impl ToWriter for SymbolTableEntry {
    fn to_writer(&self, buf: &mut Vec<u8>) {
        codec::write_u32(buf, self.name_string_table_offset);
        buf.push(self.info.raw);
        buf.push(self.other);
        codec::write_u16(buf, self.section_header_index);
        codec::write_u64(buf, self.value);
        codec::write_u64(buf, self.size);
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> SymbolTableEntry {
        SymbolTableEntry::builder()
            .name_string_table_offset(5)
            .info(SymbolInfo::new(SymbolBind::Global, SymbolType::Func))
            .other(0)
            .section_header_index(1)
            .value(0x1000)
            .size(0x20)
            .build()
    }

    #[test]
    fn test_roundtrip() {
        let entry = sample();
        let mut buf = Vec::new();
        entry.to_writer(&mut buf);
        assert_eq!(buf.len(), SymbolTableEntry::SIZE);
        let mut reader = Reader::new(&buf);
        let read_back = SymbolTableEntry::from_reader(&mut reader).unwrap();
        assert_eq!(read_back, entry);
        assert_eq!(read_back.info.bind, Some(SymbolBind::Global));
        assert_eq!(read_back.info.r#type, Some(SymbolType::Func));
    }

    #[test]
    fn test_visibility_decoding() {
        let mut entry = sample();
        entry.other = SymbolVisibility::Hidden as u8;
        assert_eq!(entry.visibility(), Some(SymbolVisibility::Hidden));
    }

    #[test]
    fn test_info_packing() {
        let info = SymbolInfo::new(SymbolBind::Weak, SymbolType::Object);
        assert_eq!(info.raw, (2 << 4) | 1);
        let decoded = SymbolInfo::from_byte(info.raw);
        assert_eq!(decoded.bind, Some(SymbolBind::Weak));
        assert_eq!(decoded.r#type, Some(SymbolType::Object));
    }
}
