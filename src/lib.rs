//! Read, mutate, and write ELF64 little-endian object files with structural
//! instrumentation: inserting new sections and segments into an existing
//! file while keeping every offset, alignment constraint, segment coverage
//! range, and cross-referential table (program headers, section headers,
//! the dynamic table) consistent.
//!
//! The crate is organized the way the file itself is organized:
//!
//! - [`codec`] — little-endian primitive reads/writes and the
//!   [`codec::FromReader`]/[`codec::ToWriter`] traits every on-disk
//!   structure implements.
//! - [`header`] — the fixed-layout structures themselves: the ELF header,
//!   program and section headers, symbol/dynamic/relocation table entries.
//! - [`chunk`] — the [`chunk::Chunk`] model: an ordered, contiguous
//!   decomposition of the file into semantically-tagged regions.
//! - [`parser`] — turns a byte buffer into a `Vec<Chunk>`.
//! - [`file`] — [`file::ElfFile`], which owns the chunk sequence and
//!   provides read-only lookups.
//! - [`instrument`] — the mutating operations: `allocate_file_memory` and
//!   the table-growth/byte-patch operations built on it.
//! - [`allocator`] — a façade over `instrument` for the common case of
//!   adding one new loaded `PROGBITS` section.
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(missing_docs)]

pub mod allocator;
pub mod chunk;
pub mod codec;
pub mod error;
pub mod file;
pub mod header;
pub mod instrument;
pub mod parser;

pub use allocator::NewProgBitsSection;
pub use error::{Error, ErrorContext, Result};
pub use file::ElfFile;
