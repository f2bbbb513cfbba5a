//! Program header table entries: the segments the dynamic linker and kernel
//! loader map at runtime.

use bitflags::bitflags;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use typed_builder::TypedBuilder;

use crate::codec::{self, FromReader, HasWrittenSize, Reader, ToWriter};
use crate::error::{Error, ErrorContext, Result};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[non_exhaustive]
/// The kind of segment a program header describes (`p_type`).
pub enum SegmentType {
    /// Unused entry.
    Null = 0,
    /// Loadable segment.
    Load = 1,
    /// Dynamic linking information.
    Dynamic = 2,
    /// Path to an interpreter.
    Interp = 3,
    /// Auxiliary information (notes).
    Note = 4,
    /// Reserved, unspecified semantics.
    ShLib = 5,
    /// Entry for the program header table itself.
    ProgramHeaderTable = 6,
    /// Thread-local storage template.
    ThreadLocalStorage = 7,
    /// GNU stack executability marker.
    GnuStack = 0x6474e551,
    /// GNU read-only-after-relocation marker.
    GnuRelro = 0x6474e552,
    /// GNU property note.
    GnuProperty = 0x6474e553,
    /// GNU `.eh_frame_hdr` segment.
    GnuEhFrame = 0x6474e550,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    /// Segment access permission flags (`p_flags`).
    pub struct SegmentFlags: u32 {
        /// Segment is executable.
        const EXECUTABLE = 0x1;
        /// Segment is writable.
        const WRITABLE = 0x2;
        /// Segment is readable.
        const READABLE = 0x4;
    }
}

/// The wire-format-canonical size of a program header entry, before stride
/// padding.
pub const PROGRAM_HEADER_CANONICAL_SIZE: usize = 56;

/// A single program header (segment descriptor).
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct ProgramHeader {
    /// Literal on-disk `p_type` value. Recognized values are available via
    /// [`ProgramHeader::r#type`]; an unrecognized `p_type` (a reserved or
    /// processor-specific value this crate doesn't name) is not malformed
    /// ELF and must still round-trip.
    pub type_raw: u32,
    /// Access permission flags.
    pub flags: SegmentFlags,
    /// Offset of the segment's first byte in the file.
    pub file_offset: u64,
    /// Virtual address of the segment's first byte in memory.
    pub virtual_memory_address: u64,
    /// Physical address, relevant on systems where physical addressing is used.
    pub physical_memory_address: u64,
    /// Number of bytes in the file image of the segment.
    pub file_size: u64,
    /// Number of bytes in the memory image of the segment.
    pub memory_size: u64,
    /// Required alignment of the segment in memory and in the file; a power
    /// of two, or 0/1 for no constraint.
    pub alignment: u64,
}

impl HasWrittenSize for ProgramHeader {
    const SIZE: usize = PROGRAM_HEADER_CANONICAL_SIZE;
}

impl ProgramHeader {
    /// The recognized interpretation of `type_raw`, if it names one of
    /// [`SegmentType`]'s discriminants. `None` for reserved, vendor, or
    /// otherwise unrecognized `p_type` values; that is not an error.
    pub fn r#type(&self) -> Option<SegmentType> {
        SegmentType::from_u32(self.type_raw)
    }

    /// Decode a program header entry whose on-disk stride is `entry_size`
    /// (which may exceed the canonical 56 bytes; the excess is discarded).
    pub fn from_reader_with_stride(reader: &mut Reader<'_>, entry_size: usize) -> Result<Self> {
        let start = reader.offset();
        if entry_size < Self::SIZE {
            return Err(Error::Corrupted {
                context: ErrorContext::at(start),
                reason: "program header entry size smaller than canonical layout",
            });
        }
        let type_raw = reader.read_u32()?;
        let flags_value = reader.read_u32()?;
        let flags = SegmentFlags::from_bits_truncate(flags_value);
        let file_offset = reader.read_u64()?;
        let virtual_memory_address = reader.read_u64()?;
        let physical_memory_address = reader.read_u64()?;
        let file_size = reader.read_u64()?;
        let memory_size = reader.read_u64()?;
        let alignment = reader.read_u64()?;
        let padding = entry_size - Self::SIZE;
        if padding > 0 {
            reader.read_bytes(padding)?;
        }
        Ok(Self::builder()
            .type_raw(type_raw)
            .flags(flags)
            .file_offset(file_offset)
            .virtual_memory_address(virtual_memory_address)
            .physical_memory_address(physical_memory_address)
            .file_size(file_size)
            .memory_size(memory_size)
            .alignment(alignment)
            .build())
    }

    /// Serialize with a given on-disk stride, zero-padding any excess.
    pub fn to_writer_with_stride(&self, buf: &mut Vec<u8>, entry_size: usize) {
        let start = buf.len();
        codec::write_u32(buf, self.type_raw);
        codec::write_u32(buf, self.flags.bits());
        codec::write_u64(buf, self.file_offset);
        codec::write_u64(buf, self.virtual_memory_address);
        codec::write_u64(buf, self.physical_memory_address);
        codec::write_u64(buf, self.file_size);
        codec::write_u64(buf, self.memory_size);
        codec::write_u64(buf, self.alignment);
        let written = buf.len() - start;
        if entry_size > written {
            buf.resize(buf.len() + (entry_size - written), 0);
        }
    }
}

impl FromReader for ProgramHeader {
    fn from_reader(reader: &mut Reader<'_>) -> Result<Self> {
        Self::from_reader_with_stride(reader, Self::SIZE)
    }
}

impl ToWriter for ProgramHeader {
    fn to_writer(&self, buf: &mut Vec<u8>) {
        self.to_writer_with_stride(buf, Self::SIZE);
    }
}
