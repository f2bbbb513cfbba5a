//! The chunk model: an ordered, contiguous, gap-filling decomposition of an
//! ELF file into semantically-typed regions.
//!
//! Every chunk exposes [`Chunk::byte_length`] and [`Chunk::write_into`]; the
//! instrumentation engine operates almost entirely in terms of these two
//! operations plus per-variant structural access.

use crate::codec::ToWriter;
use crate::error::{Error, ErrorContext, Result};
use crate::header::dynamic::DynamicEntry;
use crate::header::header::ElfHeader;
use crate::header::program::ProgramHeader;
use crate::header::relocation::{RelocationAddendEntry, RelocationEntry};
use crate::header::section::SectionHeader;
use crate::header::symbol::SymbolTableEntry;

/// A contiguous, semantically-tagged region of an ELF file.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    /// The 64-byte ELF header.
    Header(ElfHeader),
    /// The program header (segment) table.
    ProgramHeaderTable {
        /// Decoded entries, in file order.
        entries: Vec<ProgramHeader>,
        /// Per-entry on-disk stride.
        entry_stride: usize,
    },
    /// The section header table.
    SectionHeaderTable {
        /// Decoded entries, in file order.
        entries: Vec<SectionHeader>,
        /// Per-entry on-disk stride.
        entry_stride: usize,
    },
    /// The `.dynamic` table.
    DynamicTable {
        /// Decoded entries, in file order.
        entries: Vec<DynamicEntry>,
        /// Per-entry on-disk stride.
        entry_stride: usize,
        /// Bytes past the last whole entry, inside the section's size.
        trailing_padding: usize,
    },
    /// A symbol table (`.symtab` or `.dynsym`).
    SymbolTable {
        /// Decoded entries, in file order.
        entries: Vec<SymbolTableEntry>,
        /// Per-entry on-disk stride.
        entry_stride: usize,
        /// Bytes past the last whole entry, inside the section's size.
        trailing_padding: usize,
    },
    /// A NUL-delimited string table.
    StringTable {
        /// Raw table bytes.
        data: Vec<u8>,
    },
    /// A relocation table without explicit addends.
    RelocationTable {
        /// Decoded entries, in file order.
        entries: Vec<RelocationEntry>,
        /// Per-entry on-disk stride.
        entry_stride: usize,
        /// Bytes past the last whole entry, inside the section's size.
        trailing_padding: usize,
    },
    /// A relocation table with explicit addends.
    RelocationAddendTable {
        /// Decoded entries, in file order.
        entries: Vec<RelocationAddendEntry>,
        /// Per-entry on-disk stride.
        entry_stride: usize,
        /// Bytes past the last whole entry, inside the section's size.
        trailing_padding: usize,
    },
    /// An ELF notes section, opaque beyond its outer framing.
    Notes {
        /// Raw section bytes.
        data: Vec<u8>,
    },
    /// A GNU version-definition section, opaque.
    Verdef {
        /// Raw section bytes.
        data: Vec<u8>,
    },
    /// A GNU version-needs section, opaque.
    Verneed {
        /// Raw section bytes.
        data: Vec<u8>,
    },
    /// A section whose contents are opaque to this crate.
    RawSection {
        /// Raw section bytes.
        data: Vec<u8>,
    },
    /// Uninterpreted bytes: inter-region padding, or allocation slack.
    Dummy {
        /// Raw bytes.
        data: Vec<u8>,
    },
}

impl Chunk {
    /// A short, stable name for this chunk's kind, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Chunk::Header(_) => "Header",
            Chunk::ProgramHeaderTable { .. } => "ProgramHeaderTable",
            Chunk::SectionHeaderTable { .. } => "SectionHeaderTable",
            Chunk::DynamicTable { .. } => "DynamicTable",
            Chunk::SymbolTable { .. } => "SymbolTable",
            Chunk::StringTable { .. } => "StringTable",
            Chunk::RelocationTable { .. } => "RelocationTable",
            Chunk::RelocationAddendTable { .. } => "RelocationAddendTable",
            Chunk::Notes { .. } => "Notes",
            Chunk::Verdef { .. } => "Verdef",
            Chunk::Verneed { .. } => "Verneed",
            Chunk::RawSection { .. } => "RawSection",
            Chunk::Dummy { .. } => "Dummy",
        }
    }

    /// The exact number of bytes [`Chunk::write_into`] will append.
    pub fn byte_length(&self) -> usize {
        match self {
            Chunk::Header(_) => ElfHeader::SIZE,
            Chunk::ProgramHeaderTable {
                entries,
                entry_stride,
            } => entries.len() * entry_stride,
            Chunk::SectionHeaderTable {
                entries,
                entry_stride,
            } => entries.len() * entry_stride,
            Chunk::DynamicTable {
                entries,
                entry_stride,
                trailing_padding,
            } => entries.len() * entry_stride + trailing_padding,
            Chunk::SymbolTable {
                entries,
                entry_stride,
                trailing_padding,
            } => entries.len() * entry_stride + trailing_padding,
            Chunk::StringTable { data } => data.len(),
            Chunk::RelocationTable {
                entries,
                entry_stride,
                trailing_padding,
            } => entries.len() * entry_stride + trailing_padding,
            Chunk::RelocationAddendTable {
                entries,
                entry_stride,
                trailing_padding,
            } => entries.len() * entry_stride + trailing_padding,
            Chunk::Notes { data } => data.len(),
            Chunk::Verdef { data } => data.len(),
            Chunk::Verneed { data } => data.len(),
            Chunk::RawSection { data } => data.len(),
            Chunk::Dummy { data } => data.len(),
        }
    }

    /// Append this chunk's wire-format bytes to `buf`.
    pub fn write_into(&self, buf: &mut Vec<u8>) {
        match self {
            Chunk::Header(header) => header.to_writer(buf),
            Chunk::ProgramHeaderTable {
                entries,
                entry_stride,
            } => {
                for entry in entries {
                    entry.to_writer_with_stride(buf, *entry_stride);
                }
            }
            Chunk::SectionHeaderTable {
                entries,
                entry_stride,
            } => {
                for entry in entries {
                    entry.to_writer_with_stride(buf, *entry_stride);
                }
            }
            Chunk::DynamicTable {
                entries,
                entry_stride,
                trailing_padding,
            } => {
                for entry in entries {
                    entry.to_writer_with_stride(buf, *entry_stride);
                }
                buf.resize(buf.len() + trailing_padding, 0);
            }
            Chunk::SymbolTable {
                entries,
                entry_stride,
                trailing_padding,
            } => {
                for entry in entries {
                    let start = buf.len();
                    entry.to_writer(buf);
                    let written = buf.len() - start;
                    if *entry_stride > written {
                        buf.resize(buf.len() + (entry_stride - written), 0);
                    }
                }
                buf.resize(buf.len() + trailing_padding, 0);
            }
            Chunk::StringTable { data } => buf.extend_from_slice(data),
            Chunk::RelocationTable {
                entries,
                entry_stride,
                trailing_padding,
            } => {
                for entry in entries {
                    let start = buf.len();
                    entry.to_writer(buf);
                    let written = buf.len() - start;
                    if *entry_stride > written {
                        buf.resize(buf.len() + (entry_stride - written), 0);
                    }
                }
                buf.resize(buf.len() + trailing_padding, 0);
            }
            Chunk::RelocationAddendTable {
                entries,
                entry_stride,
                trailing_padding,
            } => {
                for entry in entries {
                    let start = buf.len();
                    entry.to_writer(buf);
                    let written = buf.len() - start;
                    if *entry_stride > written {
                        buf.resize(buf.len() + (entry_stride - written), 0);
                    }
                }
                buf.resize(buf.len() + trailing_padding, 0);
            }
            Chunk::Notes { data }
            | Chunk::Verdef { data }
            | Chunk::Verneed { data }
            | Chunk::RawSection { data }
            | Chunk::Dummy { data } => buf.extend_from_slice(data),
        }
    }

    /// A mutable view of this chunk's raw bytes, for the variants that hold
    /// one (`Dummy`, `RawSection`, `Notes`, `Verdef`, `Verneed`,
    /// `StringTable`).
    pub fn data_mut(&mut self) -> Option<&mut Vec<u8>> {
        match self {
            Chunk::StringTable { data }
            | Chunk::Notes { data }
            | Chunk::Verdef { data }
            | Chunk::Verneed { data }
            | Chunk::RawSection { data }
            | Chunk::Dummy { data } => Some(data),
            _ => None,
        }
    }

    /// An immutable view of this chunk's raw bytes, for the variants that
    /// hold one.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Chunk::StringTable { data }
            | Chunk::Notes { data }
            | Chunk::Verdef { data }
            | Chunk::Verneed { data }
            | Chunk::RawSection { data }
            | Chunk::Dummy { data } => Some(data),
            _ => None,
        }
    }

    /// Whether this chunk is a `Dummy`.
    pub fn is_dummy(&self) -> bool {
        matches!(self, Chunk::Dummy { .. })
    }

    /// Construct a `Dummy` chunk of `size` zero bytes.
    pub fn dummy(size: usize) -> Self {
        Chunk::Dummy {
            data: vec![0u8; size],
        }
    }

    /// Require that this chunk is a `RawSection`, returning its data.
    pub fn expect_raw_section_mut(&mut self, offset: usize) -> Result<&mut Vec<u8>> {
        match self {
            Chunk::RawSection { data } => Ok(data),
            _ => Err(Error::WrongChunkKind {
                context: ErrorContext::at(offset),
                reason: "expected a RawSection chunk",
            }),
        }
    }

    /// Whether this chunk corresponds 1:1 to a section header whose type is
    /// not `NoBits` (every such section occupies exactly one chunk; the
    /// section header table, program header table, ELF header, and gaps do
    /// not).
    pub fn is_section_content(&self) -> bool {
        matches!(
            self,
            Chunk::DynamicTable { .. }
                | Chunk::SymbolTable { .. }
                | Chunk::StringTable { .. }
                | Chunk::RelocationTable { .. }
                | Chunk::RelocationAddendTable { .. }
                | Chunk::Notes { .. }
                | Chunk::Verdef { .. }
                | Chunk::Verneed { .. }
                | Chunk::RawSection { .. }
        )
    }

    /// The `Header` chunk, or a [`Error::UnsupportedLayout`] if this isn't one.
    pub fn expect_header(&self) -> Result<&ElfHeader> {
        match self {
            Chunk::Header(header) => Ok(header),
            _ => Err(Error::UnsupportedLayout {
                reason: "expected the Header chunk",
            }),
        }
    }

    /// Mutable access to the `Header` chunk.
    pub fn expect_header_mut(&mut self) -> Result<&mut ElfHeader> {
        match self {
            Chunk::Header(header) => Ok(header),
            _ => Err(Error::UnsupportedLayout {
                reason: "expected the Header chunk",
            }),
        }
    }

    /// Read-only access to a `ProgramHeaderTable` chunk's entries and stride.
    pub fn expect_program_header_table(&self) -> Result<(&[ProgramHeader], usize)> {
        match self {
            Chunk::ProgramHeaderTable {
                entries,
                entry_stride,
            } => Ok((entries, *entry_stride)),
            _ => Err(Error::UnsupportedLayout {
                reason: "expected the ProgramHeaderTable chunk",
            }),
        }
    }

    /// Mutable access to a `ProgramHeaderTable` chunk's entries.
    pub fn expect_program_header_table_mut(&mut self) -> Result<&mut Vec<ProgramHeader>> {
        match self {
            Chunk::ProgramHeaderTable { entries, .. } => Ok(entries),
            _ => Err(Error::UnsupportedLayout {
                reason: "expected the ProgramHeaderTable chunk",
            }),
        }
    }

    /// Read-only access to the `SectionHeaderTable` chunk's entries and stride.
    pub fn expect_section_header_table(&self) -> Result<(&[SectionHeader], usize)> {
        match self {
            Chunk::SectionHeaderTable {
                entries,
                entry_stride,
            } => Ok((entries, *entry_stride)),
            _ => Err(Error::UnsupportedLayout {
                reason: "expected the SectionHeaderTable chunk",
            }),
        }
    }

    /// Mutable access to the `SectionHeaderTable` chunk's entries.
    pub fn expect_section_header_table_mut(&mut self) -> Result<&mut Vec<SectionHeader>> {
        match self {
            Chunk::SectionHeaderTable { entries, .. } => Ok(entries),
            _ => Err(Error::UnsupportedLayout {
                reason: "expected the SectionHeaderTable chunk",
            }),
        }
    }

    /// Mutable access to a `DynamicTable` chunk's entries.
    pub fn expect_dynamic_table_mut(&mut self, offset: usize) -> Result<&mut Vec<DynamicEntry>> {
        match self {
            Chunk::DynamicTable { entries, .. } => Ok(entries),
            _ => Err(Error::WrongChunkKind {
                context: ErrorContext::at(offset),
                reason: "expected a DynamicTable chunk",
            }),
        }
    }

    /// Mutable access to a `SymbolTable` chunk's entries, stride, and
    /// trailing padding.
    pub fn expect_symbol_table_mut(
        &mut self,
        offset: usize,
    ) -> Result<(&mut Vec<SymbolTableEntry>, usize, &mut usize)> {
        match self {
            Chunk::SymbolTable {
                entries,
                entry_stride,
                trailing_padding,
            } => Ok((entries, *entry_stride, trailing_padding)),
            _ => Err(Error::WrongChunkKind {
                context: ErrorContext::at(offset),
                reason: "expected a SymbolTable chunk",
            }),
        }
    }

    /// Mutable access to a `StringTable` chunk's raw data.
    pub fn expect_string_table_mut(&mut self, offset: usize) -> Result<&mut Vec<u8>> {
        match self {
            Chunk::StringTable { data } => Ok(data),
            _ => Err(Error::WrongChunkKind {
                context: ErrorContext::at(offset),
                reason: "expected a StringTable chunk",
            }),
        }
    }

    /// Mutable access to a `RelocationAddendTable` chunk's entries.
    pub fn expect_relocation_addend_table_mut(
        &mut self,
    ) -> Option<&mut Vec<RelocationAddendEntry>> {
        match self {
            Chunk::RelocationAddendTable { entries, .. } => Some(entries),
            _ => None,
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod test {
    use super::*;
    use crate::header::header::{ElfMachine, ElfType, ElfVersion};
    use crate::header::identification::{
        ElfClass, ElfDataEncoding, ElfIdentifier, ElfIdentifierVersion, ElfOsAbi,
    };

    fn sample_header() -> ElfHeader {
        ElfHeader::builder()
            .identifier(
                ElfIdentifier::builder()
                    .class(ElfClass::Elf64)
                    .data_encoding(ElfDataEncoding::LittleEndian)
                    .version_raw(ElfIdentifierVersion::Current as u8)
                    .os_abi_raw(ElfOsAbi::NoneSystemV as u8)
                    .abi_version(0)
                    .build(),
            )
            .type_raw(ElfType::Executable as u16)
            .machine_raw(ElfMachine::X86_64 as u16)
            .version_raw(ElfVersion::Current as u32)
            .entrypoint(0)
            .program_header_table_file_offset(0)
            .section_header_table_file_offset(64)
            .flags(0)
            .header_size(64)
            .program_header_table_entry_size(56)
            .program_header_table_entry_count(0)
            .section_header_table_entry_size(64)
            .section_header_table_entry_count(0)
            .section_header_string_table_index(0)
            .build()
    }

    #[test]
    fn test_header_chunk_byte_length() {
        let chunk = Chunk::Header(sample_header());
        assert_eq!(chunk.byte_length(), 64);
        let mut buf = Vec::new();
        chunk.write_into(&mut buf);
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn test_dummy_chunk_roundtrip() {
        let chunk = Chunk::dummy(12);
        assert_eq!(chunk.byte_length(), 12);
        assert!(chunk.is_dummy());
        let mut buf = Vec::new();
        chunk.write_into(&mut buf);
        assert_eq!(buf, vec![0u8; 12]);
    }

    #[test]
    fn test_string_table_chunk() {
        let chunk = Chunk::StringTable {
            data: b"\0.foo\0".to_vec(),
        };
        assert_eq!(chunk.byte_length(), 6);
        assert_eq!(chunk.data(), Some(&b"\0.foo\0"[..]));
    }
}
