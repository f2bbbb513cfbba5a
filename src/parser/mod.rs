//! Decodes a complete ELF64 little-endian byte buffer into an ordered chunk
//! list plus handles to the distinguished singleton chunks.

use std::collections::HashMap;

use crate::chunk::Chunk;
use crate::codec::{FromReader, Reader};
use crate::error::{Error, ErrorContext, Result};
use crate::header::dynamic::{DynamicEntry, DynamicEntryType};
use crate::header::header::ElfHeader;
use crate::header::program::ProgramHeader;
use crate::header::relocation::{RelocationAddendEntry, RelocationEntry};
use crate::header::section::{SectionHeader, SectionType};
use crate::header::symbol::SymbolTableEntry;

/// A parsed region of section-like content at a known file offset, prior to
/// gap-filling.
struct Parsed {
    file_offset: usize,
    chunk: Chunk,
}

/// Parse a complete ELF64-LE byte buffer into an ordered [`Chunk`] list.
///
/// Returns the chunk list in file order, contiguous and gap-filled with
/// `Dummy` chunks, per the contiguity invariant chunk consumers rely on.
pub fn parse(bytes: &[u8]) -> Result<Vec<Chunk>> {
    let mut reader = Reader::new(bytes);
    let header = ElfHeader::from_reader(&mut reader)?;

    let mut parsed: Vec<Parsed> = Vec::new();

    if header.program_header_table_file_offset != 0 {
        let offset = header.program_header_table_file_offset as usize;
        let mut reader = Reader::at(bytes, offset);
        let mut entries = Vec::with_capacity(header.program_header_table_entry_count as usize);
        for _ in 0..header.program_header_table_entry_count {
            entries.push(ProgramHeader::from_reader_with_stride(
                &mut reader,
                header.program_header_table_entry_size as usize,
            )?);
        }
        parsed.push(Parsed {
            file_offset: offset,
            chunk: Chunk::ProgramHeaderTable {
                entries,
                entry_stride: header.program_header_table_entry_size as usize,
            },
        });
    }

    let section_header_table_offset = header.section_header_table_file_offset as usize;
    let mut section_headers = Vec::with_capacity(header.section_header_table_entry_count as usize);
    {
        let mut reader = Reader::at(bytes, section_header_table_offset);
        for _ in 0..header.section_header_table_entry_count {
            section_headers.push(SectionHeader::from_reader_with_stride(
                &mut reader,
                header.section_header_table_entry_size as usize,
            )?);
        }
    }
    parsed.push(Parsed {
        file_offset: section_header_table_offset,
        chunk: Chunk::SectionHeaderTable {
            entries: section_headers.clone(),
            entry_stride: header.section_header_table_entry_size as usize,
        },
    });

    let mut handled = vec![false; section_headers.len()];

    let mut dynamic_map: HashMap<i64, Vec<u64>> = HashMap::new();
    let mut dynamic_section_index = None;
    for (index, section) in section_headers.iter().enumerate() {
        if handled[index] {
            continue;
        }
        if section.r#type() == Some(SectionType::Dynamic) {
            let offset = section.file_offset as usize;
            let mut reader = Reader::at(bytes, offset);
            let stride = if section.entry_size > 0 {
                section.entry_size as usize
            } else {
                16
            };
            let count = section.size as usize / stride.max(1);
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let entry = DynamicEntry::from_reader_with_stride(&mut reader, stride)?;
                dynamic_map.entry(entry.tag_raw).or_default().push(entry.value);
                entries.push(entry);
            }
            let trailing = section.size as usize - entries.len() * stride;
            parsed.push(Parsed {
                file_offset: offset,
                chunk: Chunk::DynamicTable {
                    entries,
                    entry_stride: stride,
                    trailing_padding: trailing,
                },
            });
            handled[index] = true;
            dynamic_section_index = Some(index);
            break;
        }
    }
    let _ = dynamic_section_index;

    let rela_entsize = dynamic_map
        .get(&(DynamicEntryType::RelaEnt as i64))
        .and_then(|v| v.first())
        .copied();
    let rela_sz = dynamic_map
        .get(&(DynamicEntryType::RelaSz as i64))
        .and_then(|v| v.first())
        .copied();
    let rel_entsize = dynamic_map
        .get(&(DynamicEntryType::RelEnt as i64))
        .and_then(|v| v.first())
        .copied();
    let rel_sz = dynamic_map
        .get(&(DynamicEntryType::RelSz as i64))
        .and_then(|v| v.first())
        .copied();
    let pltrel_sz = dynamic_map
        .get(&(DynamicEntryType::PltRelSz as i64))
        .and_then(|v| v.first())
        .copied();
    let pltrel_kind = dynamic_map
        .get(&(DynamicEntryType::PltRel as i64))
        .and_then(|v| v.first())
        .copied();

    for (tag, virtual_address) in [
        (DynamicEntryType::Rela as i64, dynamic_map.get(&(DynamicEntryType::Rela as i64))),
        (DynamicEntryType::Rel as i64, dynamic_map.get(&(DynamicEntryType::Rel as i64))),
        (
            DynamicEntryType::JmpRel as i64,
            dynamic_map.get(&(DynamicEntryType::JmpRel as i64)),
        ),
    ] {
        let Some(values) = virtual_address else { continue };
        let Some(&address) = values.first() else { continue };
        let Some(index) = section_headers
            .iter()
            .enumerate()
            .position(|(i, s)| !handled[i] && s.virtual_address == address)
        else {
            continue;
        };
        let section = &section_headers[index];
        let offset = section.file_offset as usize;

        let is_rela = if tag == DynamicEntryType::JmpRel as i64 {
            match pltrel_kind {
                Some(kind) if kind as i64 == DynamicEntryType::Rela as i64 => true,
                Some(kind) if kind as i64 == DynamicEntryType::Rel as i64 => false,
                _ => continue,
            }
        } else {
            tag == DynamicEntryType::Rela as i64
        };

        let total_size = if tag == DynamicEntryType::JmpRel as i64 {
            pltrel_sz.unwrap_or(section.size)
        } else if is_rela {
            rela_sz.unwrap_or(section.size)
        } else {
            rel_sz.unwrap_or(section.size)
        } as usize;

        if is_rela {
            let stride = rela_entsize.unwrap_or(RelocationAddendEntryDefaultStride::SIZE as u64) as usize;
            let mut reader = Reader::at(bytes, offset);
            let count = total_size / stride.max(1);
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                entries.push(RelocationAddendEntry::from_reader(&mut reader)?);
                if stride > RelocationAddendEntryDefaultStride::SIZE {
                    reader.seek(reader.offset() + (stride - RelocationAddendEntryDefaultStride::SIZE));
                }
            }
            let trailing = total_size.saturating_sub(entries.len() * stride);
            parsed.push(Parsed {
                file_offset: offset,
                chunk: Chunk::RelocationAddendTable {
                    entries,
                    entry_stride: stride,
                    trailing_padding: trailing,
                },
            });
        } else {
            let stride = rel_entsize.unwrap_or(RelocationEntryDefaultStride::SIZE as u64) as usize;
            let mut reader = Reader::at(bytes, offset);
            let count = total_size / stride.max(1);
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                entries.push(RelocationEntry::from_reader(&mut reader)?);
                if stride > RelocationEntryDefaultStride::SIZE {
                    reader.seek(reader.offset() + (stride - RelocationEntryDefaultStride::SIZE));
                }
            }
            let trailing = total_size.saturating_sub(entries.len() * stride);
            parsed.push(Parsed {
                file_offset: offset,
                chunk: Chunk::RelocationTable {
                    entries,
                    entry_stride: stride,
                    trailing_padding: trailing,
                },
            });
        }
        handled[index] = true;
    }

    for (index, section) in section_headers.iter().enumerate() {
        if handled[index] || section.r#type() == Some(SectionType::NoBits) {
            if section.r#type() == Some(SectionType::NoBits) {
                handled[index] = true;
            }
            continue;
        }
        let offset = section.file_offset as usize;
        let size = section.size as usize;
        let chunk = match section.r#type() {
            Some(SectionType::StringTable) => Chunk::StringTable {
                data: bytes
                    .get(offset..offset + size)
                    .ok_or(Error::Corrupted {
                        context: ErrorContext::at(offset),
                        reason: "string table exceeds file bounds",
                    })?
                    .to_vec(),
            },
            Some(SectionType::SymbolTable) | Some(SectionType::DynamicSymbol) => {
                let stride = if section.entry_size > 0 {
                    section.entry_size as usize
                } else {
                    SymbolTableEntry::SIZE
                };
                let mut reader = Reader::at(bytes, offset);
                let count = size / stride.max(1);
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(SymbolTableEntry::from_reader(&mut reader)?);
                    if stride > SymbolTableEntry::SIZE {
                        reader.seek(reader.offset() + (stride - SymbolTableEntry::SIZE));
                    }
                }
                let trailing = size.saturating_sub(entries.len() * stride);
                Chunk::SymbolTable {
                    entries,
                    entry_stride: stride,
                    trailing_padding: trailing,
                }
            }
            Some(SectionType::Note) => Chunk::Notes {
                data: slice_of(bytes, offset, size)?,
            },
            Some(SectionType::GnuVerdef) => Chunk::Verdef {
                data: slice_of(bytes, offset, size)?,
            },
            Some(SectionType::GnuVerneed) => Chunk::Verneed {
                data: slice_of(bytes, offset, size)?,
            },
            _ => Chunk::RawSection {
                data: slice_of(bytes, offset, size)?,
            },
        };
        parsed.push(Parsed {
            file_offset: offset,
            chunk,
        });
        handled[index] = true;
    }

    parsed.sort_by_key(|p| p.file_offset);

    let mut chunks = Vec::with_capacity(parsed.len() + 2);
    chunks.push(Chunk::Header(header));
    let mut cursor = ElfHeader::SIZE;
    for p in parsed {
        if p.file_offset < cursor {
            return Err(Error::Corrupted {
                context: ErrorContext::at(p.file_offset),
                reason: "overlapping chunks",
            });
        }
        if p.file_offset > cursor {
            chunks.push(Chunk::dummy(p.file_offset - cursor));
        }
        cursor = p.file_offset + p.chunk.byte_length();
        chunks.push(p.chunk);
    }
    if cursor < bytes.len() {
        chunks.push(Chunk::dummy(bytes.len() - cursor));
    }

    Ok(chunks)
}

fn slice_of(bytes: &[u8], offset: usize, size: usize) -> Result<Vec<u8>> {
    bytes
        .get(offset..offset + size)
        .map(|s| s.to_vec())
        .ok_or(Error::Corrupted {
            context: ErrorContext::at(offset),
            reason: "section content exceeds file bounds",
        })
}

struct RelocationEntryDefaultStride;
impl RelocationEntryDefaultStride {
    const SIZE: usize = crate::header::relocation::RELOCATION_ENTRY_CANONICAL_SIZE;
}
struct RelocationAddendEntryDefaultStride;
impl RelocationAddendEntryDefaultStride {
    const SIZE: usize = crate::header::relocation::RELOCATION_ADDEND_ENTRY_CANONICAL_SIZE;
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

    fn synthetic_header_bytes() -> Vec<u8> {
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
    fn test_parse_minimal_header_only_scenario() {
        let bytes = synthetic_header_bytes();
        assert_eq!(bytes.len(), 64);
        let chunks = parse(&bytes).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(matches!(chunks[0], Chunk::Header(_)));
        assert!(matches!(
            chunks[1],
            Chunk::SectionHeaderTable { ref entries, .. } if entries.is_empty()
        ));
        let mut out = Vec::new();
        for chunk in &chunks {
            chunk.write_into(&mut out);
        }
        assert_eq!(out, bytes);
    }

    #[test]
    fn test_parse_rejects_truncated_header() {
        let bytes = vec![0u8; 10];
        assert!(parse(&bytes).is_err());
    }
}
