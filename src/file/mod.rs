//! `ElfFile`: owns the chunk sequence produced by the parser and offers
//! read-only offset/address lookups over it. The instrumentation engine
//! (`crate::instrument`) adds the mutating operations as further `impl
//! ElfFile` blocks in its own module.

use std::fs;
use std::path::Path;

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::header::header::ElfHeader;
use crate::header::program::ProgramHeader;
use crate::header::section::SectionHeader;
use crate::parser;

/// An in-memory ELF64 little-endian file: an ordered, contiguous sequence
/// of [`Chunk`]s plus derived handles to the distinguished singleton
/// chunks (the header, and the program/section header tables).
#[derive(Debug, Clone, PartialEq)]
pub struct ElfFile {
    pub(crate) chunks: Vec<Chunk>,
}

impl ElfFile {
    /// Parse a complete ELF64-LE byte buffer.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            chunks: parser::parse(bytes)?,
        })
    }

    /// Parse the file at `path`.
    pub fn load_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::parse(&bytes)
    }

    /// Serialize the file by concatenating every chunk's bytes in order.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.byte_length());
        for chunk in &self.chunks {
            chunk.write_into(&mut buf);
        }
        buf
    }

    /// Serialize and write the result to `path`.
    pub fn store_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.serialize())?;
        Ok(())
    }

    /// The ordered chunk sequence.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Total serialized length: the sum of every chunk's `byte_length`.
    pub fn byte_length(&self) -> usize {
        self.chunks.iter().map(Chunk::byte_length).sum()
    }

    /// Locate the chunk containing `offset`, returning its index and base
    /// (start) file offset. Returns `None` if `offset` is past the end of
    /// the file.
    pub fn chunk_at_file_offset(&self, offset: usize) -> Option<(usize, usize)> {
        let mut cursor = 0usize;
        for (index, chunk) in self.chunks.iter().enumerate() {
            let len = chunk.byte_length();
            if offset < cursor + len {
                return Some((index, cursor));
            }
            cursor += len;
        }
        None
    }

    /// The ELF header (chunk index 0, per invariant I2).
    pub fn header(&self) -> Result<&ElfHeader> {
        self.chunks
            .first()
            .ok_or(Error::UnsupportedLayout {
                reason: "file has no chunks",
            })?
            .expect_header()
    }

    /// Mutable access to the ELF header.
    pub fn header_mut(&mut self) -> Result<&mut ElfHeader> {
        self.chunks
            .first_mut()
            .ok_or(Error::UnsupportedLayout {
                reason: "file has no chunks",
            })?
            .expect_header_mut()
    }

    /// Chunk index of the program header table, if one is present (per I2,
    /// immediately after the header when present).
    pub fn program_header_table_chunk_index(&self) -> Option<usize> {
        self.chunks
            .iter()
            .position(|c| matches!(c, Chunk::ProgramHeaderTable { .. }))
    }

    /// Chunk index of the section header table (per I2, present exactly
    /// once).
    pub fn section_header_table_chunk_index(&self) -> Result<usize> {
        self.chunks
            .iter()
            .position(|c| matches!(c, Chunk::SectionHeaderTable { .. }))
            .ok_or(Error::UnsupportedLayout {
                reason: "no SectionHeaderTable chunk",
            })
    }

    /// Chunk index of the `.dynamic` table, if this file has one.
    pub fn dynamic_table_chunk_index(&self) -> Option<usize> {
        self.chunks
            .iter()
            .position(|c| matches!(c, Chunk::DynamicTable { .. }))
    }

    /// All program header (segment) entries, in file order.
    pub fn program_headers(&self) -> &[ProgramHeader] {
        match self.program_header_table_chunk_index() {
            Some(index) => match self.chunks[index].expect_program_header_table() {
                Ok((entries, _)) => entries,
                Err(_) => &[],
            },
            None => &[],
        }
    }

    /// All section header entries, in file order.
    pub fn section_headers(&self) -> Result<&[SectionHeader]> {
        let index = self.section_header_table_chunk_index()?;
        let (entries, _) = self.chunks[index].expect_section_header_table()?;
        Ok(entries)
    }

    /// Resolve a virtual address to a file offset by scanning program
    /// headers for the first segment whose memory range contains `addr`.
    pub fn file_offset_of_virtual_address(&self, addr: u64) -> Option<u64> {
        self.program_headers().iter().find_map(|p| {
            if addr >= p.virtual_memory_address && addr < p.virtual_memory_address + p.file_size {
                Some(p.file_offset + (addr - p.virtual_memory_address))
            } else {
                None
            }
        })
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::ToWriter;
    use crate::header::header::{ElfMachine, ElfType, ElfVersion};
    use crate::header::identification::{
        ElfClass, ElfDataEncoding, ElfIdentifier, ElfIdentifierVersion, ElfOsAbi,
    };

    fn minimal_header_bytes() -> Vec<u8> {
        let header = ElfHeader::builder()
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
            .build();
        let mut buf = Vec::new();
        header.to_writer(&mut buf);
        buf
    }

    #[test]
    fn test_parse_roundtrip() {
        let bytes = minimal_header_bytes();
        let file = ElfFile::parse(&bytes).unwrap();
        assert_eq!(file.serialize(), bytes);
        assert_eq!(file.byte_length(), bytes.len());
    }

    #[test]
    fn test_chunk_at_file_offset() {
        // Built by hand rather than through `parse` so there is a non-empty
        // chunk following the header to look up; an all-zero-entry section
        // header table has byte_length 0 and can't sit at a lookup-able
        // offset of its own.
        let file = ElfFile {
            chunks: vec![
                Chunk::Header(ElfHeader::builder()
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
                    .build()),
                Chunk::Dummy { data: vec![0u8; 64] },
            ],
        };
        let (index, base) = file.chunk_at_file_offset(0).unwrap();
        assert_eq!(index, 0);
        assert_eq!(base, 0);
        let (index, base) = file.chunk_at_file_offset(64).unwrap();
        assert_eq!(index, 1);
        assert_eq!(base, 64);
        assert!(file.chunk_at_file_offset(128).is_none());
    }

    #[test]
    fn test_section_header_table_lookup() {
        let bytes = minimal_header_bytes();
        let file = ElfFile::parse(&bytes).unwrap();
        assert_eq!(file.section_header_table_chunk_index().unwrap(), 1);
        assert!(file.section_headers().unwrap().is_empty());
    }
}
