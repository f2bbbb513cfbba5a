//! A section-allocator façade over the instrumentation engine in
//! `crate::instrument`: one call that turns "I want a new loaded section
//! with this name, address, and content" into the full sequence of table
//! growths the engine requires.

use typed_builder::TypedBuilder;

use crate::error::Result;
use crate::file::ElfFile;
use crate::header::program::{ProgramHeader, SegmentFlags, SegmentType};
use crate::header::section::{SectionFlags, SectionHeader, SectionType};

fn align_up(value: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Parameters for a new `PROGBITS` section, backed by its own `LOAD`
/// segment, that [`ElfFile::allocate_prog_bits_section`] creates.
#[derive(Debug, Clone, TypedBuilder)]
pub struct NewProgBitsSection {
    /// Section name, written into the section-name string table.
    pub name: String,
    /// Virtual address the backing segment (and section) is mapped at.
    pub address: u64,
    /// Size in bytes of the section's content.
    pub size: u64,
    /// Required alignment of the section's file offset.
    pub alignment: u64,
    /// Whether the backing segment is writable.
    #[builder(default = false)]
    pub writable: bool,
    /// Whether the backing segment is executable.
    #[builder(default = false)]
    pub executable: bool,
    /// Initial content. Zero-padded to `size` if shorter; must not exceed
    /// it.
    #[builder(default)]
    pub contents: Vec<u8>,
}

impl ElfFile {
    /// Allocate a new `PROGBITS` section backed by a new `LOAD` segment,
    /// per the section-allocator façade: grow the program header table,
    /// the section-name string table, and the section header table each by
    /// one slot; reserve file space for the section's content; create the
    /// section and its segment; and write the initial content.
    pub fn allocate_prog_bits_section(&mut self, config: NewProgBitsSection) -> Result<usize> {
        let phdr_index = self.program_header_table_chunk_index().ok_or(
            crate::error::Error::UnsupportedLayout {
                reason: "missing program header table",
            },
        )?;
        let (_, phdr_stride) = self.chunks()[phdr_index].expect_program_header_table()?;
        let phdr_end = self
            .program_headers()
            .len()
            .saturating_mul(phdr_stride)
            + self.header()?.program_header_table_file_offset as usize;
        self.allocate_file_memory(phdr_end, phdr_stride)?;

        let name_section_index = self.header()?.section_header_string_table_index as usize;
        let name_section = self
            .section_headers()?
            .get(name_section_index)
            .cloned()
            .ok_or(crate::error::Error::UnsupportedLayout {
                reason: "missing section name string table",
            })?;
        let name_table_end = name_section.file_offset as usize + name_section.size as usize;
        let needed_name_bytes = config.name.len() + 1;
        self.allocate_file_memory(name_table_end, needed_name_bytes)?;

        let sht_index = self.section_header_table_chunk_index()?;
        let (entries, sht_stride) = self.chunks()[sht_index].expect_section_header_table()?;
        let sht_end =
            self.header()?.section_header_table_file_offset as usize + entries.len() * sht_stride;
        self.allocate_file_memory(sht_end, sht_stride)?;

        let current_total = self.byte_length();
        let content_offset = align_up(current_total, config.alignment.max(1) as usize);
        self.allocate_file_memory(
            current_total,
            (content_offset - current_total) + config.size as usize,
        )?;

        let name_section_index = self.header()?.section_header_string_table_index as usize;
        let offsets = self.extend_string_table(name_section_index, &[&config.name])?;
        let name_offset = offsets[0];

        let mut flags = SectionFlags::ALLOC;
        if config.writable {
            flags |= SectionFlags::WRITE;
        }
        if config.executable {
            flags |= SectionFlags::EXECUTABLE_INSTRUCTIONS;
        }
        let new_header = SectionHeader::builder()
            .name_string_table_offset(name_offset as u32)
            .type_raw(SectionType::ProgBits as u32)
            .flags(flags)
            .virtual_address(config.address)
            .file_offset(content_offset as u64)
            .size(config.size)
            .link(0)
            .info(0)
            .alignment(config.alignment)
            .entry_size(0)
            .build();
        let section_index = self.create_section(new_header)?;

        let mut segment_flags = SegmentFlags::READABLE;
        if config.writable {
            segment_flags |= SegmentFlags::WRITABLE;
        }
        if config.executable {
            segment_flags |= SegmentFlags::EXECUTABLE;
        }
        let new_segment = ProgramHeader::builder()
            .type_raw(SegmentType::Load as u32)
            .flags(segment_flags)
            .file_offset(content_offset as u64)
            .virtual_memory_address(config.address)
            .physical_memory_address(config.address)
            .file_size(config.size)
            .memory_size(config.size)
            .alignment(config.alignment)
            .build();
        self.extend_program_header_table(new_segment)?;

        if !config.contents.is_empty() {
            let mut padded = config.contents;
            padded.resize(config.size as usize, 0);
            self.patch_raw_bytes_at_offset(content_offset, &padded)?;
        }

        Ok(section_index)
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod test {
    use super::*;
    use crate::chunk::Chunk;
    use crate::header::header::{ElfHeader, ElfMachine, ElfType, ElfVersion};
    use crate::header::identification::{
        ElfClass, ElfDataEncoding, ElfIdentifier, ElfIdentifierVersion, ElfOsAbi,
    };

    fn fixture() -> ElfFile {
        let name_table = Chunk::StringTable {
            data: b"\0.shstrtab\0".to_vec(),
        };
        let name_table_section = SectionHeader::builder()
            .name_string_table_offset(1)
            .type_raw(SectionType::StringTable as u32)
            .flags(SectionFlags::empty())
            .virtual_address(0)
            .file_offset(64)
            .size(name_table.byte_length() as u64)
            .link(0)
            .info(0)
            .alignment(1)
            .entry_size(0)
            .build();
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
            .program_header_table_file_offset(64)
            .section_header_table_file_offset(64 + 11 + 64)
            .flags(0)
            .header_size(64)
            .program_header_table_entry_size(56)
            .program_header_table_entry_count(0)
            .section_header_table_entry_size(64)
            .section_header_table_entry_count(1)
            .section_header_string_table_index(0)
            .build();
        ElfFile {
            chunks: vec![
                Chunk::Header(header),
                Chunk::ProgramHeaderTable {
                    entries: vec![],
                    entry_stride: 56,
                },
                name_table,
                Chunk::SectionHeaderTable {
                    entries: vec![name_table_section],
                    entry_stride: 64,
                },
            ],
        }
    }

    #[test]
    fn test_allocate_prog_bits_section_creates_loaded_executable_section() {
        let mut file = fixture();
        let config = NewProgBitsSection::builder()
            .name(".x".to_string())
            .address(0x30000)
            .size(1)
            .alignment(0x1000)
            .executable(true)
            .contents(vec![0xC3])
            .build();
        let index = file.allocate_prog_bits_section(config).unwrap();

        let section = &file.section_headers().unwrap()[index];
        assert_eq!(section.r#type(), Some(SectionType::ProgBits));
        assert_eq!(section.size, 1);
        assert!(section.flags.contains(SectionFlags::ALLOC));
        assert!(section.flags.contains(SectionFlags::EXECUTABLE_INSTRUCTIONS));
        assert!(!section.flags.contains(SectionFlags::WRITE));

        let content = file
            .get_raw_bytes_at_offset(section.file_offset as usize, 1)
            .unwrap();
        assert_eq!(content, vec![0xC3]);

        let segment = file
            .program_headers()
            .iter()
            .find(|p| p.virtual_memory_address == 0x30000)
            .unwrap();
        assert!(segment.flags.contains(SegmentFlags::READABLE));
        assert!(segment.flags.contains(SegmentFlags::EXECUTABLE));
        assert!(!segment.flags.contains(SegmentFlags::WRITABLE));
    }
}
