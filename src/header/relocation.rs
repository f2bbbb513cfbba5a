//! Relocation table entries: without (`Rel`) and with (`Rela`) explicit
//! addends.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use typed_builder::TypedBuilder;

use crate::codec::{self, FromReader, HasWrittenSize, Reader, ToWriter};
use crate::error::Result;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[non_exhaustive]
/// x86_64 relocation types, numbered per the standard x86_64 psABI.
///
/// Only the types the instrumentation engine needs to recognize while
/// patching symbol-relative addends are given names; unrecognized values
/// still round-trip via `RelocationInfo::type_raw`.
pub enum RelocationTypeX86_64 {
    /// No relocation.
    None = 0,
    /// Direct 64-bit.
    Direct64 = 1,
    /// PC-relative 32-bit.
    Pc32 = 2,
    /// 32-bit GOT entry.
    Got32 = 3,
    /// 32-bit PLT address.
    Plt32 = 4,
    /// Copy symbol at runtime.
    Copy = 5,
    /// Create a GOT entry.
    GlobDat = 6,
    /// Create a PLT entry.
    JumpSlot = 7,
    /// Adjust by program base.
    Relative = 8,
    /// 32-bit signed PC-relative offset to the GOT.
    GotPc = 9,
    /// Direct 32-bit zero-extended.
    Direct32 = 10,
    /// Direct 32-bit sign-extended.
    Direct32Signed = 11,
    /// Direct 16-bit zero-extended.
    Direct16 = 12,
    /// 16-bit sign-extended PC-relative.
    Pc16 = 13,
    /// Direct 8-bit sign-extended.
    Direct8 = 14,
    /// 8-bit sign-extended PC-relative.
    Pc8 = 15,
    /// 64-bit thread-local storage, general dynamic model.
    DtpMod64 = 16,
    /// 64-bit thread-local storage, general dynamic model offset.
    DtpOff64 = 17,
    /// 64-bit thread-local storage, initial exec model.
    TpOff64 = 18,
    /// thread-local storage, general dynamic model call.
    TlsGd = 19,
    /// 64-bit relative offset to the `IRELATIVE` resolver.
    Irelative = 37,
}

/// The wire-format size of a relocation entry without an explicit addend.
pub const RELOCATION_ENTRY_CANONICAL_SIZE: usize = 16;
/// The wire-format size of a relocation entry with an explicit addend.
pub const RELOCATION_ADDEND_ENTRY_CANONICAL_SIZE: usize = 24;

/// Decoded `r_info`: the symbol table index and relocation type packed into
/// one 64-bit field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationInfo {
    /// Index into the associated symbol table.
    pub symbol_index: u32,
    /// Recognized x86_64 relocation type, if any.
    pub r#type: Option<RelocationTypeX86_64>,
    /// Literal on-disk type value.
    pub type_raw: u32,
}

impl RelocationInfo {
    /// Decode `r_info` from its packed 64-bit form.
    pub fn from_u64(raw: u64) -> Self {
        let symbol_index = (raw >> 32) as u32;
        let type_raw = (raw & 0xffff_ffff) as u32;
        Self {
            symbol_index,
            r#type: RelocationTypeX86_64::from_u32(type_raw),
            type_raw,
        }
    }

    /// Construct from a symbol index and relocation type.
    pub fn new(symbol_index: u32, r#type: RelocationTypeX86_64) -> Self {
        Self {
            symbol_index,
            r#type: Some(r#type),
            type_raw: r#type as u32,
        }
    }

    /// Repack into the wire-format 64-bit `r_info` value.
    pub fn to_u64(&self) -> u64 {
        ((self.symbol_index as u64) << 32) | self.type_raw as u64
    }
}

/// A relocation entry without an explicit addend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TypedBuilder)]
pub struct RelocationEntry {
    /// Location at which to apply the relocation.
    pub offset: u64,
    /// Packed symbol index and relocation type.
    pub info: RelocationInfo,
}

impl HasWrittenSize for RelocationEntry {
    const SIZE: usize = RELOCATION_ENTRY_CANONICAL_SIZE;
}

impl FromReader for RelocationEntry {
    fn from_reader(reader: &mut Reader<'_>) -> Result<Self> {
        let offset = reader.read_u64()?;
        let info = RelocationInfo::from_u64(reader.read_u64()?);
        Ok(Self::builder().offset(offset).info(info).build())
    }
}

impl ToWriter for RelocationEntry {
    fn to_writer(&self, buf: &mut Vec<u8>) {
        codec::write_u64(buf, self.offset);
        codec::write_u64(buf, self.info.to_u64());
    }
}

/// A relocation entry with an explicit addend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TypedBuilder)]
pub struct RelocationAddendEntry {
    /// Location at which to apply the relocation.
    pub offset: u64,
    /// Packed symbol index and relocation type.
    pub info: RelocationInfo,
    /// Constant addend used in computing the relocated value.
    pub addend: i64,
}

impl RelocationAddendEntry {
    /// Whether this entry's addend references `address`, the common case
    /// being a symbol-relative pointer stored directly in the table.
    pub fn addend_equals(&self, address: u64) -> bool {
        self.addend == address as i64
    }
}

impl HasWrittenSize for RelocationAddendEntry {
    const SIZE: usize = RELOCATION_ADDEND_ENTRY_CANONICAL_SIZE;
}

impl FromReader for RelocationAddendEntry {
    fn from_reader(reader: &mut Reader<'_>) -> Result<Self> {
        let offset = reader.read_u64()?;
        let info = RelocationInfo::from_u64(reader.read_u64()?);
        let addend = reader.read_i64()?;
        Ok(Self::builder()
            .offset(offset)
            .info(info)
            .addend(addend)
            .build())
    }
}

impl ToWriter for RelocationAddendEntry {
    fn to_writer(&self, buf: &mut Vec<u8>) {
        codec::write_u64(buf, self.offset);
        codec::write_u64(buf, self.info.to_u64());
        codec::write_i64(buf, self.addend);
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rel_roundtrip() {
        let entry = RelocationEntry::builder()
            .offset(0x2000)
            .info(RelocationInfo::new(3, RelocationTypeX86_64::Relative))
            .build();
        let mut buf = Vec::new();
        entry.to_writer(&mut buf);
        assert_eq!(buf.len(), RelocationEntry::SIZE);
        let mut reader = Reader::new(&buf);
        let read_back = RelocationEntry::from_reader(&mut reader).unwrap();
        assert_eq!(read_back, entry);
        assert_eq!(read_back.info.r#type, Some(RelocationTypeX86_64::Relative));
    }

    #[test]
    fn test_rela_roundtrip() {
        let entry = RelocationAddendEntry::builder()
            .offset(0x3000)
            .info(RelocationInfo::new(0, RelocationTypeX86_64::Irelative))
            .addend(0x401000)
            .build();
        let mut buf = Vec::new();
        entry.to_writer(&mut buf);
        assert_eq!(buf.len(), RelocationAddendEntry::SIZE);
        let mut reader = Reader::new(&buf);
        let read_back = RelocationAddendEntry::from_reader(&mut reader).unwrap();
        assert_eq!(read_back, entry);
        assert!(read_back.addend_equals(0x401000));
    }

    #[test]
    fn test_unrecognized_type_preserved() {
        let info = RelocationInfo::from_u64((7u64 << 32) | 0x9999);
        assert_eq!(info.symbol_index, 7);
        assert_eq!(info.r#type, None);
        assert_eq!(info.type_raw, 0x9999);
        assert_eq!(info.to_u64(), (7u64 << 32) | 0x9999);
    }
}
