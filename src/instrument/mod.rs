//! The instrumentation engine: in-place growth of an [`ElfFile`]'s tables
//! and sections, realigning and remapping everything downstream of each
//! edit so the result stays a valid, loadable ELF file.
//!
//! [`ElfFile::allocate_file_memory`] is the core primitive; every other
//! operation here either consumes slack it leaves behind (the
//! `extend_*`/`create_section` family) or patches bytes directly
//! (`patch_raw_bytes_at_offset` and friends). Every public entry point calls
//! [`ElfFile::cleanup_dummy_chunks`] first, so callers never have to do that
//! bookkeeping themselves.

use std::collections::HashMap;

use crate::chunk::Chunk;
use crate::error::{Error, ErrorContext, Result};
use crate::file::ElfFile;
use crate::header::dynamic::DynamicEntryType;
use crate::header::header::ElfHeader;
use crate::header::program::SegmentType;
use crate::header::section::{SectionHeader, SectionType};
use crate::header::symbol::{SymbolBind, SymbolInfo, SymbolTableEntry, SymbolType, SymbolVisibility};

/// Fixed alignment the section header table is kept to; chosen once here
/// since the wire format does not declare one.
const SECTION_HEADER_TABLE_ALIGNMENT: u64 = 16;

fn shrink_dummy(chunk: &mut Chunk, amount: usize) {
    if let Some(data) = chunk.data_mut() {
        let new_len = data.len().saturating_sub(amount);
        data.truncate(new_len);
    }
}

fn grow_dummy(chunk: &mut Chunk, amount: usize) {
    if let Some(data) = chunk.data_mut() {
        data.resize(data.len() + amount, 0);
    }
}

impl ElfFile {
    /// Coalesce consecutive `Dummy` chunks into one and drop empty ones.
    /// Called at the start of every public instrumentation operation.
    pub fn cleanup_dummy_chunks(&mut self) {
        let mut merged: Vec<Chunk> = Vec::with_capacity(self.chunks.len());
        for chunk in self.chunks.drain(..) {
            if chunk.is_dummy() && chunk.byte_length() == 0 {
                continue;
            }
            if let Chunk::Dummy { data } = &chunk {
                if let Some(Chunk::Dummy { data: last_data }) = merged.last_mut() {
                    last_data.extend_from_slice(data);
                    continue;
                }
            }
            merged.push(chunk);
        }
        self.chunks = merged;
    }

    /// The layout precondition the engine's offset-based operations rely
    /// on: the program header table immediately follows the ELF header and
    /// sits at chunk index 1.
    fn check_instrumentable(&self) -> Result<()> {
        let header = self.header()?;
        match self.program_header_table_chunk_index() {
            Some(1) if header.program_header_table_file_offset == header.header_size as u64 => {
                Ok(())
            }
            _ => Err(Error::UnsupportedLayout {
                reason: "program header table must immediately follow the ELF header at chunk index 1",
            }),
        }
    }

    /// Insert `size` bytes of fresh [`Chunk::Dummy`] space at `offset`,
    /// realigning and remapping every chunk, segment, and section header
    /// downstream so the file stays internally consistent.
    ///
    /// `offset` must either land on an existing chunk boundary or inside a
    /// `Dummy` chunk; `size` must be nonzero.
    pub fn allocate_file_memory(&mut self, offset: usize, size: usize) -> Result<()> {
        self.cleanup_dummy_chunks();
        self.check_instrumentable()?;

        if size == 0 {
            return Err(Error::BadOffset { offset });
        }

        let header = self.header()?.clone();
        let phdr_index = self.program_header_table_chunk_index().ok_or(
            Error::UnsupportedLayout {
                reason: "missing program header table",
            },
        )?;
        let min_offset = header.header_size as usize + self.chunks[phdr_index].byte_length();
        if offset < min_offset || offset > self.byte_length() {
            return Err(Error::BadOffset { offset });
        }

        log::debug!("allocate_file_memory: offset={:#x} size={:#x}", offset, size);

        let insertion_index = self.phase1_insert(offset, size)?;
        log::trace!("phase 1 inserted dummy at chunk index {insertion_index}");

        let mut affected: Vec<(usize, SectionHeader)> = self
            .section_headers()?
            .iter()
            .enumerate()
            .filter(|(_, s)| s.type_raw != SectionType::NoBits as u32 && s.file_offset as usize >= offset)
            .map(|(i, s)| (i, s.clone()))
            .collect();
        affected.sort_by_key(|(_, s)| s.file_offset);

        let original_sht_offset = header.section_header_table_file_offset;

        let (section_deltas, sht_delta) =
            self.phase3_realign(insertion_index, offset, size, &affected, original_sht_offset)?;
        log::trace!(
            "phase 3 realigned {} sections, sht_delta={:?}",
            section_deltas.len(),
            sht_delta
        );

        let program_headers_before_phase4 = self.program_headers().to_vec();
        self.phase4_update_segments(&header, &section_deltas, sht_delta, original_sht_offset)?;
        self.phase5_update_section_headers(&program_headers_before_phase4, &section_deltas)?;
        self.phase6_patch_dynamic_table(&section_deltas)?;

        if let Some(delta) = sht_delta {
            if delta != 0 {
                let header = self.header_mut()?;
                header.section_header_table_file_offset =
                    (header.section_header_table_file_offset as i64 + delta) as u64;
            }
        }

        self.cleanup_dummy_chunks();
        Ok(())
    }

    /// Phase 1: split or create a chunk so a fresh `size`-byte `Dummy` chunk
    /// begins at exactly `offset`. Returns the index of that new chunk.
    fn phase1_insert(&mut self, offset: usize, size: usize) -> Result<usize> {
        let mut cursor = 0usize;
        for i in 0..self.chunks.len() {
            let len = self.chunks[i].byte_length();
            if offset == cursor {
                self.chunks.insert(i, Chunk::dummy(size));
                return Ok(i);
            }
            if offset > cursor && offset < cursor + len {
                if !self.chunks[i].is_dummy() {
                    return Err(Error::BadOffset { offset });
                }
                let local = offset - cursor;
                let data = self.chunks[i]
                    .data()
                    .ok_or(Error::BadOffset { offset })?
                    .to_vec();
                let left = data[..local].to_vec();
                let right = data[local..].to_vec();
                let mut replacement = Vec::with_capacity(3);
                let mut inserted_index = i;
                if !left.is_empty() {
                    replacement.push(Chunk::Dummy { data: left });
                    inserted_index += 1;
                }
                replacement.push(Chunk::dummy(size));
                if !right.is_empty() {
                    replacement.push(Chunk::Dummy { data: right });
                }
                self.chunks.splice(i..=i, replacement);
                return Ok(inserted_index);
            }
            cursor += len;
        }
        if offset == cursor {
            self.chunks.push(Chunk::dummy(size));
            return Ok(self.chunks.len() - 1);
        }
        Err(Error::BadOffset { offset })
    }

    /// Phase 3: walk every chunk downstream of the insertion point in file
    /// order, shrinking or growing `Dummy` chunks (and inserting new ones
    /// where alignment demands it) to absorb `size` bytes of shift while
    /// keeping the section header table and every affected section's
    /// content aligned. Returns each affected section's index mapped to its
    /// net offset delta, plus the section header table's delta if it moved.
    fn phase3_realign(
        &mut self,
        insertion_index: usize,
        offset: usize,
        size: usize,
        affected: &[(usize, SectionHeader)],
        original_sht_offset: u64,
    ) -> Result<(HashMap<usize, i64>, Option<i64>)> {
        let mut section_deltas: HashMap<usize, i64> = HashMap::new();
        let mut sht_delta: Option<i64> = None;
        let mut affected_iter = affected.iter().peekable();

        let mut idx = insertion_index + 1;
        let mut current_offset = offset + size;
        let mut remaining_shift: i64 = size as i64;

        while idx < self.chunks.len() {
            if self.chunks[idx].is_dummy() {
                while idx + 1 < self.chunks.len() && self.chunks[idx + 1].is_dummy() {
                    let next = self.chunks.remove(idx + 1);
                    if let Chunk::Dummy { data: next_data } = next {
                        if let Chunk::Dummy { data } = &mut self.chunks[idx] {
                            data.extend_from_slice(&next_data);
                        }
                    }
                }
            }

            let is_relevant_next = idx + 1 < self.chunks.len() && {
                let next = &self.chunks[idx + 1];
                matches!(next, Chunk::SectionHeaderTable { .. }) || next.is_section_content()
            };

            if self.chunks[idx].is_dummy() && is_relevant_next {
                let is_sht = matches!(self.chunks[idx + 1], Chunk::SectionHeaderTable { .. });
                let alignment = if is_sht {
                    SECTION_HEADER_TABLE_ALIGNMENT
                } else {
                    let (_, section) = *affected_iter.peek().ok_or(Error::UnsupportedLayout {
                        reason: "section content chunk with no matching section header",
                    })?;
                    if section.alignment == 0 {
                        1
                    } else {
                        section.alignment
                    }
                };

                if remaining_shift > 0 {
                    let dummy_len = self.chunks[idx].byte_length() as u64;
                    let candidate_pos = current_offset as u64 + dummy_len;
                    let err = candidate_pos % alignment;
                    if err <= dummy_len {
                        let mut shrink_total = err;
                        let mut remaining_dummy = dummy_len - err;
                        while remaining_shift > 0 && alignment <= remaining_dummy {
                            shrink_total += alignment;
                            remaining_dummy -= alignment;
                            remaining_shift -= alignment as i64;
                        }
                        shrink_dummy(&mut self.chunks[idx], shrink_total as usize);
                    } else {
                        let grow = alignment - err;
                        grow_dummy(&mut self.chunks[idx], grow as usize);
                        remaining_shift += grow as i64;
                    }
                }

                let new_pos = current_offset + self.chunks[idx].byte_length();
                if is_sht {
                    sht_delta = Some(new_pos as i64 - original_sht_offset as i64);
                } else if let Some((section_index, section)) = affected_iter.next() {
                    section_deltas
                        .insert(*section_index, new_pos as i64 - section.file_offset as i64);
                }
                current_offset = new_pos + self.chunks[idx + 1].byte_length();
                idx += 2;
                continue;
            }

            if !self.chunks[idx].is_dummy() {
                let is_sht = matches!(self.chunks[idx], Chunk::SectionHeaderTable { .. });
                let is_section = self.chunks[idx].is_section_content();
                if (is_sht || is_section) && remaining_shift > 0 {
                    let alignment = if is_sht {
                        SECTION_HEADER_TABLE_ALIGNMENT
                    } else {
                        let (_, section) =
                            *affected_iter.peek().ok_or(Error::UnsupportedLayout {
                                reason: "section content chunk with no matching section header",
                            })?;
                        if section.alignment == 0 {
                            1
                        } else {
                            section.alignment
                        }
                    };
                    let err = current_offset as u64 % alignment;
                    if err != 0 {
                        let grow = alignment - err;
                        self.chunks.insert(idx, Chunk::dummy(grow as usize));
                        remaining_shift += grow as i64;
                        continue;
                    }
                }
                if is_sht {
                    sht_delta = Some(current_offset as i64 - original_sht_offset as i64);
                } else if is_section {
                    if let Some((section_index, section)) = affected_iter.next() {
                        section_deltas.insert(
                            *section_index,
                            current_offset as i64 - section.file_offset as i64,
                        );
                    }
                }
            }

            current_offset += self.chunks[idx].byte_length();
            idx += 1;
        }

        Ok((section_deltas, sht_delta))
    }

    /// Phase 4: propagate offset deltas to every segment that contains a
    /// moved item. A segment's `file_offset`/virtual addresses shift by the
    /// delta of the first moved item it contains; its sizes grow or shrink
    /// by the delta of the last. `LOAD` segments never have their addresses
    /// changed, only their file offsets and sizes.
    fn phase4_update_segments(
        &mut self,
        original_header: &ElfHeader,
        section_deltas: &HashMap<usize, i64>,
        sht_delta: Option<i64>,
        original_sht_offset: u64,
    ) -> Result<()> {
        struct Item {
            offset: u64,
            delta: i64,
        }

        let original_sections: Vec<(u64, i64)> = self
            .section_headers()?
            .iter()
            .enumerate()
            .filter(|(_, s)| s.type_raw != SectionType::NoBits as u32)
            .map(|(i, s)| (s.file_offset, section_deltas.get(&i).copied().unwrap_or(0)))
            .collect();

        let mut items: Vec<Item> = Vec::with_capacity(original_sections.len() + 3);
        items.push(Item {
            offset: 0,
            delta: 0,
        });
        items.push(Item {
            offset: original_header.program_header_table_file_offset,
            delta: 0,
        });
        items.push(Item {
            offset: original_sht_offset,
            delta: sht_delta.unwrap_or(0),
        });
        for (offset, delta) in original_sections {
            items.push(Item { offset, delta });
        }
        items.sort_by_key(|i| i.offset);

        let phdr_index = self.program_header_table_chunk_index().ok_or(
            Error::UnsupportedLayout {
                reason: "missing program header table",
            },
        )?;
        let entries = self.chunks[phdr_index].expect_program_header_table_mut()?;
        for p in entries.iter_mut() {
            let start = p.file_offset;
            let end = p.file_offset + p.file_size;
            let mut first: Option<&Item> = None;
            let mut last: Option<&Item> = None;
            for item in &items {
                if item.offset >= start && item.offset < end {
                    if first.is_none() {
                        first = Some(item);
                    }
                    last = Some(item);
                }
            }
            if let Some(first_item) = first {
                if first_item.delta != 0 {
                    p.file_offset = (p.file_offset as i64 + first_item.delta) as u64;
                    if p.type_raw != SegmentType::Load as u32 {
                        p.virtual_memory_address =
                            (p.virtual_memory_address as i64 + first_item.delta) as u64;
                        p.physical_memory_address =
                            (p.physical_memory_address as i64 + first_item.delta) as u64;
                    }
                }
            }
            if let (Some(first_item), Some(last_item)) = (first, last) {
                if last_item.offset != first_item.offset && last_item.delta != 0 {
                    p.file_size = (p.file_size as i64 + last_item.delta) as u64;
                    p.memory_size = (p.memory_size as i64 + last_item.delta) as u64;
                }
            }
        }
        Ok(())
    }

    /// Phase 5: apply each section's delta to its header's `file_offset`,
    /// additionally shifting `virtual_address` when the section lies inside
    /// a non-`LOAD` segment (the open question this crate resolves in
    /// favor of propagating address changes only where the section isn't
    /// already pinned by a `LOAD` mapping).
    ///
    /// `program_headers` must be the segment table as it stood *before*
    /// [`Self::phase4_update_segments`] ran: that phase shifts a segment's
    /// `file_offset` to its own post-move position, so testing a section's
    /// *original* offset against already-moved segment ranges would miss
    /// every segment whose range no longer covers where the section used to
    /// sit.
    fn phase5_update_section_headers(
        &mut self,
        program_headers: &[crate::header::program::ProgramHeader],
        section_deltas: &HashMap<usize, i64>,
    ) -> Result<()> {
        let index = self.section_header_table_chunk_index()?;
        let entries = self.chunks[index].expect_section_header_table_mut()?;
        for (i, delta) in section_deltas {
            if *delta == 0 {
                continue;
            }
            let Some(section) = entries.get_mut(*i) else {
                continue;
            };
            let original_offset = section.file_offset;
            section.file_offset = (section.file_offset as i64 + delta) as u64;
            let in_non_load_segment = program_headers.iter().any(|p| {
                p.type_raw != SegmentType::Load as u32
                    && original_offset >= p.file_offset
                    && original_offset < p.file_offset + p.file_size
            });
            if in_non_load_segment {
                section.virtual_address = (section.virtual_address as i64 + delta) as u64;
            }
        }
        Ok(())
    }

    /// Phase 6: patch `.dynamic` entries whose value is a file-relative
    /// address of a table that just moved (`DT_STRTAB`, `DT_SYMTAB`, and
    /// friends), using each entry's original location to find which
    /// section it pointed inside of.
    fn phase6_patch_dynamic_table(&mut self, section_deltas: &HashMap<usize, i64>) -> Result<()> {
        let Some(dyn_index) = self.dynamic_table_chunk_index() else {
            return Ok(());
        };

        const REMAPPED_TAGS: [DynamicEntryType; 9] = [
            DynamicEntryType::GnuHash,
            DynamicEntryType::StrTab,
            DynamicEntryType::SymTab,
            DynamicEntryType::JmpRel,
            DynamicEntryType::Rel,
            DynamicEntryType::Rela,
            DynamicEntryType::VerNeed,
            DynamicEntryType::VerSym,
            DynamicEntryType::VerDef,
        ];

        let ranges: Vec<(u64, u64, i64)> = self
            .section_headers()?
            .iter()
            .enumerate()
            .filter(|(_, s)| s.type_raw != SectionType::NoBits as u32)
            .map(|(i, s)| {
                let delta = section_deltas.get(&i).copied().unwrap_or(0);
                let original_offset = s.file_offset as i64 - delta;
                (original_offset as u64, s.size, delta)
            })
            .collect();

        let entries = self.chunks[dyn_index].expect_dynamic_table_mut(0)?;
        for entry in entries.iter_mut() {
            let Some(tag) = entry.tag else { continue };
            if !REMAPPED_TAGS.contains(&tag) {
                continue;
            }
            if let Some((_, _, delta)) = ranges
                .iter()
                .find(|(orig, size, _)| entry.value >= *orig && entry.value < orig + size)
            {
                entry.value = (entry.value as i64 + delta) as u64;
            }
        }
        Ok(())
    }

    /// Append `new_strings` to the string table at `section_index`,
    /// consuming slack from the `Dummy` chunk that must immediately follow
    /// it. Returns each new string's byte offset within the table.
    pub fn extend_string_table(
        &mut self,
        section_index: usize,
        new_strings: &[&str],
    ) -> Result<Vec<usize>> {
        self.cleanup_dummy_chunks();

        let section = self
            .section_headers()?
            .get(section_index)
            .cloned()
            .ok_or(Error::WrongChunkKind {
                context: ErrorContext::at(section_index),
                reason: "not a valid section index",
            })?;
        let (content_index, _) = self
            .chunk_at_file_offset(section.file_offset as usize)
            .ok_or(Error::WrongChunkKind {
                context: ErrorContext::at(section.file_offset as usize),
                reason: "section content chunk not found",
            })?;
        if !matches!(self.chunks[content_index], Chunk::StringTable { .. }) {
            return Err(Error::WrongChunkKind {
                context: ErrorContext::at(section.file_offset as usize),
                reason: "expected a StringTable chunk",
            });
        }

        let needed: usize = new_strings.iter().map(|s| s.len() + 1).sum();
        let dummy_index = content_index + 1;
        let available = self
            .chunks
            .get(dummy_index)
            .filter(|c| c.is_dummy())
            .map(Chunk::byte_length)
            .unwrap_or(0);
        if available < needed {
            return Err(Error::InsufficientSlack {
                context: ErrorContext::at(section.file_offset as usize),
                needed,
                available,
            });
        }

        let data = self.chunks[content_index].expect_string_table_mut(section.file_offset as usize)?;
        // A table ending in a NUL,NUL pair carries an explicit empty-string
        // terminator (offset 0's entry); splicing after it must preserve
        // that pair rather than splicing into the one NUL that terminates
        // the table's last real entry.
        let had_empty_string_marker =
            data.len() >= 2 && data[data.len() - 1] == 0 && data[data.len() - 2] == 0;
        if had_empty_string_marker {
            data.pop();
        }
        let mut offsets = Vec::with_capacity(new_strings.len());
        for s in new_strings {
            offsets.push(data.len());
            data.extend_from_slice(s.as_bytes());
            data.push(0);
        }
        if had_empty_string_marker {
            data.push(0);
        }

        shrink_dummy(&mut self.chunks[dummy_index], needed);

        let sht_index = self.section_header_table_chunk_index()?;
        self.chunks[sht_index].expect_section_header_table_mut()?[section_index].size +=
            needed as u64;

        self.cleanup_dummy_chunks();
        Ok(offsets)
    }

    /// Append new local symbols (`name_string_table_offset`, `value`) to
    /// the symbol table at `section_index`, each defined relative to
    /// `target_section_index` with `Func` type and zero size.
    pub fn extend_symbol_table(
        &mut self,
        section_index: usize,
        target_section_index: u16,
        new_symbols: &[(u32, u64)],
    ) -> Result<()> {
        self.cleanup_dummy_chunks();

        let section = self
            .section_headers()?
            .get(section_index)
            .cloned()
            .ok_or(Error::WrongChunkKind {
                context: ErrorContext::at(section_index),
                reason: "not a valid section index",
            })?;
        let (content_index, _) = self
            .chunk_at_file_offset(section.file_offset as usize)
            .ok_or(Error::WrongChunkKind {
                context: ErrorContext::at(section.file_offset as usize),
                reason: "section content chunk not found",
            })?;
        let entry_stride = match &self.chunks[content_index] {
            Chunk::SymbolTable { entry_stride, .. } => *entry_stride,
            _ => {
                return Err(Error::WrongChunkKind {
                    context: ErrorContext::at(section.file_offset as usize),
                    reason: "expected a SymbolTable chunk",
                })
            }
        };

        let needed = new_symbols.len() * entry_stride;
        let dummy_index = content_index + 1;
        let available = self
            .chunks
            .get(dummy_index)
            .filter(|c| c.is_dummy())
            .map(Chunk::byte_length)
            .unwrap_or(0);
        if available < needed {
            return Err(Error::InsufficientSlack {
                context: ErrorContext::at(section.file_offset as usize),
                needed,
                available,
            });
        }

        let (entries, _, _) =
            self.chunks[content_index].expect_symbol_table_mut(section.file_offset as usize)?;
        let insert_at = entries
            .iter()
            .rposition(|e| e.info.bind == Some(SymbolBind::Local))
            .map(|i| i + 1)
            .unwrap_or(0);
        let count = new_symbols.len();
        for (offset_in_batch, (name, value)) in new_symbols.iter().enumerate() {
            let entry = SymbolTableEntry::builder()
                .name_string_table_offset(*name)
                .info(SymbolInfo::new(SymbolBind::Local, SymbolType::Func))
                .other(SymbolVisibility::Default as u8)
                .section_header_index(target_section_index)
                .value(*value)
                .size(0)
                .build();
            entries.insert(insert_at + offset_in_batch, entry);
        }

        shrink_dummy(&mut self.chunks[dummy_index], needed);

        let sht_index = self.section_header_table_chunk_index()?;
        let header = &mut self.chunks[sht_index].expect_section_header_table_mut()?[section_index];
        header.size += needed as u64;
        header.info += count as u32;

        self.cleanup_dummy_chunks();
        Ok(())
    }

    /// Append `bytes` to the raw section at `section_index`, consuming
    /// slack from the `Dummy` chunk immediately following it.
    pub fn extend_raw_section(&mut self, section_index: usize, bytes: &[u8]) -> Result<()> {
        self.cleanup_dummy_chunks();

        let section = self
            .section_headers()?
            .get(section_index)
            .cloned()
            .ok_or(Error::WrongChunkKind {
                context: ErrorContext::at(section_index),
                reason: "not a valid section index",
            })?;
        let (content_index, _) = self
            .chunk_at_file_offset(section.file_offset as usize)
            .ok_or(Error::WrongChunkKind {
                context: ErrorContext::at(section.file_offset as usize),
                reason: "section content chunk not found",
            })?;
        let dummy_index = content_index + 1;
        let available = self
            .chunks
            .get(dummy_index)
            .filter(|c| c.is_dummy())
            .map(Chunk::byte_length)
            .unwrap_or(0);
        if available < bytes.len() {
            return Err(Error::InsufficientSlack {
                context: ErrorContext::at(section.file_offset as usize),
                needed: bytes.len(),
                available,
            });
        }

        let data = self.chunks[content_index].expect_raw_section_mut(section.file_offset as usize)?;
        data.extend_from_slice(bytes);
        shrink_dummy(&mut self.chunks[dummy_index], bytes.len());

        let sht_index = self.section_header_table_chunk_index()?;
        self.chunks[sht_index].expect_section_header_table_mut()?[section_index].size +=
            bytes.len() as u64;

        self.cleanup_dummy_chunks();
        Ok(())
    }

    /// Create a new section header and back it with content carved out of
    /// the `Dummy` chunk containing `new_header.file_offset`, inserting the
    /// header into the section header table in file-offset order. Returns
    /// the new section's index.
    pub fn create_section(&mut self, new_header: SectionHeader) -> Result<usize> {
        self.cleanup_dummy_chunks();

        let sht_index = self.section_header_table_chunk_index()?;
        let (_, entry_stride) = self.chunks[sht_index].expect_section_header_table()?;
        let sht_dummy_index = sht_index + 1;
        let sht_available = self
            .chunks
            .get(sht_dummy_index)
            .filter(|c| c.is_dummy())
            .map(Chunk::byte_length)
            .unwrap_or(0);
        if sht_available < entry_stride {
            return Err(Error::InsufficientSlack {
                context: ErrorContext::at(sht_index),
                needed: entry_stride,
                available: sht_available,
            });
        }

        let (target_index, base) = self
            .chunk_at_file_offset(new_header.file_offset as usize)
            .ok_or(Error::BadOffset {
                offset: new_header.file_offset as usize,
            })?;
        if !self.chunks[target_index].is_dummy() {
            return Err(Error::BadOffset {
                offset: new_header.file_offset as usize,
            });
        }
        let gap = new_header.file_offset as usize - base;
        let needed = gap + new_header.size as usize;
        let target_len = self.chunks[target_index].byte_length();
        if target_len < needed {
            return Err(Error::InsufficientSlack {
                context: ErrorContext::at(new_header.file_offset as usize),
                needed,
                available: target_len,
            });
        }
        // When the section's own content and the section header table's
        // one-entry reservation share this same dummy, the latter is carved
        // from the tail of the prefix left behind by the splice below, so
        // the prefix itself must hold at least `entry_stride` bytes.
        if target_index == sht_dummy_index && gap < entry_stride {
            return Err(Error::InsufficientSlack {
                context: ErrorContext::at(sht_index),
                needed: entry_stride,
                available: gap,
            });
        }

        let data = self.chunks[target_index]
            .data()
            .ok_or(Error::BadOffset {
                offset: new_header.file_offset as usize,
            })?
            .to_vec();
        let prefix = data[..gap].to_vec();
        let suffix = data[gap + new_header.size as usize..].to_vec();
        let mut replacement = Vec::with_capacity(3);
        if !prefix.is_empty() {
            replacement.push(Chunk::Dummy { data: prefix });
        }
        replacement.push(Chunk::RawSection {
            data: vec![0u8; new_header.size as usize],
        });
        if !suffix.is_empty() {
            replacement.push(Chunk::Dummy { data: suffix });
        }
        self.chunks.splice(target_index..=target_index, replacement);

        let sht_index = self.section_header_table_chunk_index()?;
        let entries = self.chunks[sht_index].expect_section_header_table_mut()?;
        let insert_pos = entries.partition_point(|s| s.file_offset < new_header.file_offset);
        entries.insert(insert_pos, new_header);
        let new_section_index = insert_pos;

        let header = self.header_mut()?;
        if (new_section_index as u16) <= header.section_header_string_table_index {
            header.section_header_string_table_index += 1;
        }
        header.section_header_table_entry_count += 1;

        let sht_index = self.section_header_table_chunk_index()?;
        shrink_dummy(&mut self.chunks[sht_index + 1], entry_stride);

        self.cleanup_dummy_chunks();
        Ok(new_section_index)
    }

    /// Append a new segment to the program header table, consuming slack
    /// from the `Dummy` chunk that must immediately follow it, and
    /// inserting the entry so entries of the same `SegmentType` stay
    /// ordered by ascending `virtual_memory_address`.
    pub fn extend_program_header_table(
        &mut self,
        new_entry: crate::header::program::ProgramHeader,
    ) -> Result<()> {
        self.cleanup_dummy_chunks();
        self.check_instrumentable()?;

        let phdr_index = self.program_header_table_chunk_index().ok_or(
            Error::UnsupportedLayout {
                reason: "missing program header table",
            },
        )?;
        let (_, entry_stride) = self.chunks[phdr_index].expect_program_header_table()?;
        let dummy_index = phdr_index + 1;
        let available = self
            .chunks
            .get(dummy_index)
            .filter(|c| c.is_dummy())
            .map(Chunk::byte_length)
            .unwrap_or(0);
        if available < entry_stride {
            return Err(Error::InsufficientSlack {
                context: ErrorContext::at(phdr_index),
                needed: entry_stride,
                available,
            });
        }

        let entries = self.chunks[phdr_index].expect_program_header_table_mut()?;
        let insert_pos = match entries.iter().position(|p| p.type_raw == new_entry.type_raw) {
            Some(first_of_type) => {
                let last_of_type = entries
                    .iter()
                    .rposition(|p| p.type_raw == new_entry.type_raw)
                    .unwrap_or(first_of_type);
                (first_of_type..=last_of_type)
                    .find(|&i| entries[i].virtual_memory_address > new_entry.virtual_memory_address)
                    .unwrap_or(last_of_type + 1)
            }
            None => entries.len(),
        };
        entries.insert(insert_pos, new_entry);

        let header = self.header_mut()?;
        header.program_header_table_entry_count += 1;

        let phdr_index = self.program_header_table_chunk_index().ok_or(
            Error::UnsupportedLayout {
                reason: "missing program header table",
            },
        )?;
        shrink_dummy(&mut self.chunks[phdr_index + 1], entry_stride);

        self.cleanup_dummy_chunks();
        Ok(())
    }

    /// Read `len` bytes from the `RawSection` chunk containing `offset`.
    pub fn get_raw_bytes_at_offset(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let (index, base) =
            self.chunk_at_file_offset(offset)
                .ok_or(Error::WrongChunkKind {
                    context: ErrorContext::at(offset),
                    reason: "offset past end of file",
                })?;
        let data = match &self.chunks[index] {
            Chunk::RawSection { data } => data,
            _ => {
                return Err(Error::WrongChunkKind {
                    context: ErrorContext::at(offset),
                    reason: "target is not a RawSection",
                })
            }
        };
        let local = offset - base;
        data.get(local..local + len).map(<[u8]>::to_vec).ok_or(Error::Truncated {
            context: ErrorContext::builder().offset(offset).expected(len).build(),
        })
    }

    /// Overwrite `bytes` in place at `offset`, which must fall entirely
    /// inside a single `RawSection` chunk.
    pub fn patch_raw_bytes_at_offset(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let (index, base) =
            self.chunk_at_file_offset(offset)
                .ok_or(Error::WrongChunkKind {
                    context: ErrorContext::at(offset),
                    reason: "offset past end of file",
                })?;
        let local = offset - base;
        let data = self.chunks[index].expect_raw_section_mut(offset)?;
        if local + bytes.len() > data.len() {
            return Err(Error::Truncated {
                context: ErrorContext::builder().offset(offset).expected(bytes.len()).build(),
            });
        }
        data[local..local + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Resolve `virtual_address` to a file offset and patch `bytes` there.
    pub fn patch_raw_bytes_at_address(&mut self, virtual_address: u64, bytes: &[u8]) -> Result<()> {
        let offset = self
            .file_offset_of_virtual_address(virtual_address)
            .ok_or(Error::BadOffset {
                offset: virtual_address as usize,
            })?;
        self.patch_raw_bytes_at_offset(offset as usize, bytes)
    }

    /// Replace `old_addend` with `new_addend` in every `RelocationAddendTable`
    /// entry whose `offset` matches. `Rel` tables, which carry no addend,
    /// are left untouched. Returns the number of entries patched.
    pub fn patch_value_in_relocation_table(
        &mut self,
        offset: u64,
        old_addend: i64,
        new_addend: i64,
    ) -> Result<usize> {
        let mut patched = 0;
        for chunk in self.chunks.iter_mut() {
            if let Some(entries) = chunk.expect_relocation_addend_table_mut() {
                for entry in entries.iter_mut() {
                    if entry.offset == offset && entry.addend == old_addend {
                        entry.addend = new_addend;
                        patched += 1;
                    }
                }
            }
        }
        Ok(patched)
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod test {
    use super::*;
    use crate::header::dynamic::DynamicEntry;
    use crate::header::header::{ElfMachine, ElfType, ElfVersion};
    use crate::header::identification::{
        ElfClass, ElfDataEncoding, ElfIdentifier, ElfIdentifierVersion, ElfOsAbi,
    };
    use crate::header::section::SectionFlags;

    fn sample_header(sht_offset: u64, sht_count: u16) -> ElfHeader {
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
            .program_header_table_file_offset(64)
            .section_header_table_file_offset(sht_offset)
            .flags(0)
            .header_size(64)
            .program_header_table_entry_size(56)
            .program_header_table_entry_count(0)
            .section_header_table_entry_size(64)
            .section_header_table_entry_count(sht_count)
            .section_header_string_table_index(0)
            .build()
    }

    fn sample_section(file_offset: u64, size: u64, alignment: u64) -> SectionHeader {
        SectionHeader::builder()
            .name_string_table_offset(0)
            .type_raw(SectionType::ProgBits as u32)
            .flags(SectionFlags::ALLOC)
            .virtual_address(0)
            .file_offset(file_offset)
            .size(size)
            .link(0)
            .info(0)
            .alignment(alignment)
            .entry_size(0)
            .build()
    }

    /// Header + empty program header table + a 16-byte raw section at
    /// offset 64 + a one-entry section header table right after it.
    fn fixture() -> ElfFile {
        let section = sample_section(64, 16, 1);
        ElfFile {
            chunks: vec![
                Chunk::Header(sample_header(80, 1)),
                Chunk::ProgramHeaderTable {
                    entries: vec![],
                    entry_stride: 56,
                },
                Chunk::RawSection {
                    data: vec![0xAAu8; 16],
                },
                Chunk::SectionHeaderTable {
                    entries: vec![section],
                    entry_stride: 64,
                },
            ],
        }
    }

    #[test]
    fn test_cleanup_merges_adjacent_dummies() {
        let mut file = fixture();
        file.chunks.insert(2, Chunk::dummy(4));
        file.chunks.insert(2, Chunk::dummy(4));
        file.cleanup_dummy_chunks();
        assert_eq!(file.chunks[1].byte_length(), 8);
        assert!(matches!(file.chunks[1], Chunk::Dummy { .. }));
    }

    #[test]
    fn test_allocate_file_memory_shifts_section_and_sht() {
        let mut file = fixture();
        let before_total = file.byte_length();
        file.allocate_file_memory(64, 8).unwrap();
        // The section (alignment 1) only absorbs the 8 inserted bytes, but
        // the section header table is pinned to a 16-byte boundary: its
        // naturally-shifted position (80 + 8 = 88) isn't a multiple of 16,
        // so realignment grows a second 8-byte dummy ahead of it, making the
        // total growth 16 rather than 8.
        assert_eq!(file.byte_length(), before_total + 16);

        let section = &file.section_headers().unwrap()[0];
        assert_eq!(section.file_offset, 72);
        assert_eq!(file.header().unwrap().section_header_table_file_offset, 96);
    }

    #[test]
    fn test_allocate_file_memory_rejects_mid_table_offset() {
        let mut file = fixture();
        assert!(file.allocate_file_memory(68, 4).is_err());
    }

    #[test]
    fn test_allocate_file_memory_rejects_zero_size() {
        let mut file = fixture();
        assert!(file.allocate_file_memory(64, 0).is_err());
    }

    #[test]
    fn test_allocate_file_memory_remaps_dynamic_table_entry() {
        // A StrTab entry pointing inside the StringTable section must be
        // remapped by the same delta applied to that section, confirming
        // phase 6 reads the displacement rather than leaving stale values.
        let mut strtab_header = sample_section(64, 16, 1);
        strtab_header.type_raw = SectionType::StringTable as u32;
        let mut dynamic_header = sample_section(80, 16, 1);
        dynamic_header.type_raw = SectionType::Dynamic as u32;

        let mut file = ElfFile {
            chunks: vec![
                Chunk::Header(sample_header(96, 2)),
                Chunk::ProgramHeaderTable {
                    entries: vec![],
                    entry_stride: 56,
                },
                Chunk::StringTable {
                    data: vec![0u8; 16],
                },
                Chunk::DynamicTable {
                    entries: vec![DynamicEntry::new(DynamicEntryType::StrTab as i64, 64)],
                    entry_stride: 16,
                    trailing_padding: 0,
                },
                Chunk::SectionHeaderTable {
                    entries: vec![strtab_header, dynamic_header],
                    entry_stride: 64,
                },
            ],
        };

        file.allocate_file_memory(64, 8).unwrap();

        let sections = file.section_headers().unwrap();
        assert_eq!(sections[0].file_offset, 72);
        let entries = file.chunks[3].expect_dynamic_table_mut(0).unwrap();
        assert_eq!(entries[0].tag, Some(DynamicEntryType::StrTab));
        assert_eq!(entries[0].value, 72);
    }

    #[test]
    fn test_allocate_file_memory_updates_virtual_address_in_non_load_segment() {
        // A PT_DYNAMIC segment exactly coextensive with the `.dynamic`
        // section: once the section moves, the segment's file_offset and
        // (being non-LOAD) its virtual_memory_address both move with it,
        // and the section's own virtual_address must track the segment.
        // Regression test for an epoch mismatch where phase 5 compared the
        // section's pre-shift offset against the segment's already-shifted
        // range and so never saw it as contained.
        use crate::header::program::{ProgramHeader, SegmentFlags};

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
            .section_header_table_file_offset(140)
            .flags(0)
            .header_size(64)
            .program_header_table_entry_size(56)
            .program_header_table_entry_count(1)
            .section_header_table_entry_size(64)
            .section_header_table_entry_count(1)
            .section_header_string_table_index(0)
            .build();

        let segment = ProgramHeader::builder()
            .type_raw(SegmentType::Dynamic as u32)
            .flags(SegmentFlags::READABLE | SegmentFlags::WRITABLE)
            .file_offset(124)
            .virtual_memory_address(0x3000)
            .physical_memory_address(0x3000)
            .file_size(16)
            .memory_size(16)
            .alignment(8)
            .build();

        let mut dynamic_section = sample_section(124, 16, 1);
        dynamic_section.type_raw = SectionType::Dynamic as u32;
        dynamic_section.virtual_address = 0x3000;

        let mut file = ElfFile {
            chunks: vec![
                Chunk::Header(header),
                Chunk::ProgramHeaderTable {
                    entries: vec![segment],
                    entry_stride: 56,
                },
                Chunk::Dummy { data: vec![0u8; 4] },
                Chunk::DynamicTable {
                    entries: vec![DynamicEntry::new(DynamicEntryType::Null as i64, 0)],
                    entry_stride: 16,
                    trailing_padding: 0,
                },
                Chunk::SectionHeaderTable {
                    entries: vec![dynamic_section],
                    entry_stride: 64,
                },
            ],
        };

        file.allocate_file_memory(120, 8).unwrap();

        let segment = &file.program_headers()[0];
        assert_eq!(segment.file_offset, 128);
        assert_eq!(segment.virtual_memory_address, 0x3004);

        let section = &file.section_headers().unwrap()[0];
        assert_eq!(section.file_offset, 128);
        assert_eq!(section.virtual_address, 0x3004);
    }

    #[test]
    fn test_extend_string_table_keeps_trailing_nul() {
        let mut strtab_header = sample_section(64, 12, 1);
        strtab_header.type_raw = SectionType::StringTable as u32;
        let mut file = ElfFile {
            chunks: vec![
                Chunk::Header(sample_header(80, 1)),
                Chunk::ProgramHeaderTable {
                    entries: vec![],
                    entry_stride: 56,
                },
                Chunk::StringTable {
                    data: b"\0.foo\0.bar\0\0".to_vec(),
                },
                Chunk::Dummy { data: vec![0u8; 8] },
                Chunk::SectionHeaderTable {
                    entries: vec![strtab_header],
                    entry_stride: 64,
                },
            ],
        };
        let offsets = file.extend_string_table(0, &["baz"]).unwrap();
        assert_eq!(offsets, vec![11]);
        let data = file.chunks[2].data().unwrap();
        assert_eq!(data, b"\0.foo\0.bar\0baz\0\0");
        assert_eq!(file.chunks[3].byte_length(), 4);
        assert_eq!(file.section_headers().unwrap()[0].size, 16);
    }

    #[test]
    fn test_extend_string_table_single_trailing_nul_preserves_last_entry() {
        // The common case: the table ends in exactly one NUL, with no
        // empty-string marker pair. Appending must not eat `.bar`'s
        // terminator, or it would splice directly into the new string.
        let mut strtab_header = sample_section(64, 11, 1);
        strtab_header.type_raw = SectionType::StringTable as u32;
        let mut file = ElfFile {
            chunks: vec![
                Chunk::Header(sample_header(75, 1)),
                Chunk::ProgramHeaderTable {
                    entries: vec![],
                    entry_stride: 56,
                },
                Chunk::StringTable {
                    data: b"\0.foo\0.bar\0".to_vec(),
                },
                Chunk::Dummy { data: vec![0u8; 8] },
                Chunk::SectionHeaderTable {
                    entries: vec![strtab_header],
                    entry_stride: 64,
                },
            ],
        };
        let offsets = file.extend_string_table(0, &["baz"]).unwrap();
        assert_eq!(offsets, vec![11]);
        let data = file.chunks[2].data().unwrap();
        assert_eq!(data, b"\0.foo\0.bar\0baz\0");
        assert_eq!(file.chunks[3].byte_length(), 4);
        assert_eq!(file.section_headers().unwrap()[0].size, 15);
    }

    #[test]
    fn test_extend_string_table_rejects_insufficient_slack() {
        let mut strtab_header = sample_section(64, 2, 1);
        strtab_header.type_raw = SectionType::StringTable as u32;
        let mut file = ElfFile {
            chunks: vec![
                Chunk::Header(sample_header(66, 1)),
                Chunk::ProgramHeaderTable {
                    entries: vec![],
                    entry_stride: 56,
                },
                Chunk::StringTable {
                    data: b"\0\0".to_vec(),
                },
                Chunk::SectionHeaderTable {
                    entries: vec![strtab_header],
                    entry_stride: 64,
                },
            ],
        };
        assert!(matches!(
            file.extend_string_table(0, &["toolong"]),
            Err(Error::InsufficientSlack { .. })
        ));
    }

    #[test]
    fn test_extend_raw_section_consumes_slack() {
        let mut file = fixture();
        file.chunks.insert(3, Chunk::Dummy { data: vec![0u8; 4] });
        file.extend_raw_section(0, &[1, 2]).unwrap();
        assert_eq!(
            file.chunks[2].data().unwrap(),
            &[[0xAAu8; 16].as_slice(), &[1, 2]].concat()[..]
        );
        assert_eq!(file.chunks[3].byte_length(), 2);
        assert_eq!(file.section_headers().unwrap()[0].size, 18);
    }

    #[test]
    fn test_patch_raw_bytes_at_offset() {
        let mut file = fixture();
        file.patch_raw_bytes_at_offset(64, &[1, 2, 3]).unwrap();
        assert_eq!(&file.chunks[2].data().unwrap()[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_patch_raw_bytes_rejects_wrong_chunk() {
        let mut file = fixture();
        assert!(file.patch_raw_bytes_at_offset(0, &[1]).is_err());
    }
}
