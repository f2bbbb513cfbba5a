//! The `e_ident` field: the 16 bytes at the start of every ELF file that
//! specify how the rest of the file is to be decoded.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use typed_builder::TypedBuilder;

use crate::codec::{FromReader, HasWrittenSize, Reader, ToWriter};
use crate::error::{Error, ErrorContext, Result};

/// Magic bytes every ELF file begins with.
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[non_exhaustive]
/// The file's class, i.e. whether it is 32-bit or 64-bit.
///
/// This crate only ever accepts [`ElfClass::Elf64`]; other values are parsed
/// (so a caller can produce a useful error message) but any further
/// decoding fails with [`Error::Unsupported`].
pub enum ElfClass {
    /// Unspecified.
    None = 0,
    /// 32-bit.
    Elf32 = 1,
    /// 64-bit.
    Elf64 = 2,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[non_exhaustive]
/// The file's data encoding, i.e. whether it is little- or big-endian.
///
/// This crate only ever accepts [`ElfDataEncoding::LittleEndian`].
pub enum ElfDataEncoding {
    /// Unspecified.
    None = 0,
    /// Little-endian.
    LittleEndian = 1,
    /// Big-endian.
    BigEndian = 2,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[non_exhaustive]
/// Identifier version; always `Current` in files this crate produces.
pub enum ElfIdentifierVersion {
    /// Invalid version.
    None = 0,
    /// The only defined version.
    Current = 1,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[non_exhaustive]
/// Operating system / ABI the file targets.
///
/// Some fields in other ELF structures have flags and values whose meaning
/// is OS/ABI specific; this byte selects the interpretation.
pub enum ElfOsAbi {
    /// UNIX System V ABI, or unspecified.
    NoneSystemV = 0,
    /// HP-UX.
    HpUx = 1,
    /// NetBSD.
    NetBsd = 2,
    /// Object uses GNU ELF extensions.
    GnuLinux = 3,
    /// SUN Solaris.
    Solaris = 6,
    /// IBM AIX.
    Aix = 7,
    /// SGI Irix.
    Irix = 8,
    /// FreeBSD.
    FreeBsd = 9,
    /// Compaq TRU64 UNIX.
    Tru64 = 10,
    /// Novell Modesto.
    NovellModesto = 11,
    /// OpenBSD.
    OpenBsd = 12,
    /// Open Virtual Memory System.
    OpenVms = 13,
    /// NSK Non-Stop Kernel.
    NonStopKernel = 14,
    /// Amiga Research OS.
    Aros = 15,
    /// FenixOS.
    FenixOs = 16,
    /// Nuxi CloudABI.
    CloudAbi = 17,
    /// Stratus Technologies OpenVOS.
    OpenVos = 18,
    /// ARM EABI.
    ArmAeabi = 64,
    /// ARM (non-EABI).
    Arm = 97,
    /// Standalone system.
    Standalone = 255,
}

/// The 16-byte `e_ident` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TypedBuilder)]
pub struct ElfIdentifier {
    /// Class (this crate requires [`ElfClass::Elf64`]).
    pub class: ElfClass,
    /// Data encoding (this crate requires [`ElfDataEncoding::LittleEndian`]).
    pub data_encoding: ElfDataEncoding,
    /// Literal on-disk identifier version byte. Unlike `class`/`data_encoding`
    /// above, an unrecognized value here is not a reason to reject the file;
    /// see [`ElfIdentifier::version`].
    pub version_raw: u8,
    /// Literal on-disk OS/ABI byte; see [`ElfIdentifier::os_abi`].
    pub os_abi_raw: u8,
    /// ABI version, interpretation depends on `os_abi_raw`.
    pub abi_version: u8,
}

impl HasWrittenSize for ElfIdentifier {
    const SIZE: usize = 16;
}

impl ElfIdentifier {
    /// The recognized interpretation of `version_raw`, if any.
    pub fn version(&self) -> Option<ElfIdentifierVersion> {
        ElfIdentifierVersion::from_u8(self.version_raw)
    }

    /// The recognized interpretation of `os_abi_raw`, if any.
    pub fn os_abi(&self) -> Option<ElfOsAbi> {
        ElfOsAbi::from_u8(self.os_abi_raw)
    }
}

impl FromReader for ElfIdentifier {
    fn from_reader(reader: &mut Reader<'_>) -> Result<Self> {
        let start = reader.offset();
        let magic = reader.read_bytes(4)?;
        if magic != ELF_MAGIC {
            return Err(Error::Corrupted {
                context: ErrorContext::at(start),
                reason: "bad ELF magic",
            });
        }
        let class_byte = reader.read_u8()?;
        let data_encoding_byte = reader.read_u8()?;
        let class = ElfClass::from_u8(class_byte).ok_or(Error::Unsupported {
            context: ErrorContext::at(start + 4),
        })?;
        let data_encoding =
            ElfDataEncoding::from_u8(data_encoding_byte).ok_or(Error::Unsupported {
                context: ErrorContext::at(start + 5),
            })?;
        if class != ElfClass::Elf64 || data_encoding != ElfDataEncoding::LittleEndian {
            return Err(Error::Unsupported {
                context: ErrorContext::at(start),
            });
        }
        // Unlike class/data_encoding above, an unrecognized version or
        // OS/ABI byte is not grounds to reject the file: both are captured
        // raw and only interpreted when they name a recognized value.
        let version_raw = reader.read_u8()?;
        let os_abi_raw = reader.read_u8()?;
        let abi_version = reader.read_u8()?;
        let _padding = reader.read_bytes(7)?;
        Ok(Self::builder()
            .class(class)
            .data_encoding(data_encoding)
            .version_raw(version_raw)
            .os_abi_raw(os_abi_raw)
            .abi_version(abi_version)
            .build())
    }
}

impl ToWriter for ElfIdentifier {
    fn to_writer(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&ELF_MAGIC);
        buf.push(self.class as u8);
        buf.push(self.data_encoding as u8);
        buf.push(self.version_raw);
        buf.push(self.os_abi_raw);
        buf.push(self.abi_version);
        buf.extend_from_slice(&[0u8; 7]);
    }
}

impl std::fmt::Display for ElfIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ELF class={:?} encoding={:?} version={:?} (raw={}) os_abi={:?} (raw={}) abi_version={}",
            self.class,
            self.data_encoding,
            self.version(),
            self.version_raw,
            self.os_abi(),
            self.os_abi_raw,
            self.abi_version
        )
    }
}
