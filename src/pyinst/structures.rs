use byteorder::{BigEndian, ReadBytesExt};
use std::fmt;
use std::io::Cursor;

use anyhow::Result;

use super::error::FormatError;

/// CArchive cookie signature: `MEI\014\013\012\013\016`
pub const COOKIE_MAGIC: &[u8; 8] = b"MEI\x0c\x0b\x0a\x0b\x0e";

/// Size of the fixed fields at the start of every TOC record
pub const TOC_RECORD_FIXED_SIZE: usize = 18;

/// Compression flag value for zlib-compressed entries
pub const COMPRESSED: u8 = 1;

/// Cookie layout. PyInstaller 2.1 appended a 64-byte library name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieVariant {
    /// `magic, len, toc, toc_len, pyver` (signed fields)
    V20,
    /// `magic, len, toc, toc_len, pyver, pylibname[64]`
    V21,
}

impl CookieVariant {
    pub const fn size(self) -> usize {
        match self {
            CookieVariant::V20 => 24,
            CookieVariant::V21 => 24 + 64,
        }
    }
}

impl fmt::Display for CookieVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CookieVariant::V20 => f.write_str("2.0"),
            CookieVariant::V21 => f.write_str("2.1+"),
        }
    }
}

/// Interpreter version recorded in the cookie
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PythonVersion {
    pub major: u32,
    pub minor: u32,
}

impl PythonVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Decode the packed integer: `308` is 3.8, `27` is 2.7
    pub fn from_packed(v: u32) -> Self {
        if v >= 100 {
            Self::new(v / 100, v % 100)
        } else {
            Self::new(v / 10, v % 10)
        }
    }
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Decoded CArchive cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub variant: CookieVariant,
    pub package_length: u64,
    pub toc_offset: u64,
    pub toc_length: u64,
    pub python_version: PythonVersion,
    /// Library name from a 2.1+ cookie, NUL-trimmed
    pub python_library: Option<String>,
}

impl Cookie {
    /// Decode a cookie of the given variant from `data`, which starts at the signature.
    pub fn from_bytes(variant: CookieVariant, data: &[u8]) -> Result<Self> {
        if data.len() < variant.size() || &data[..8] != COOKIE_MAGIC {
            return Err(FormatError::CookieNotFound.into());
        }

        let mut cursor = Cursor::new(&data[8..]);
        let (package_length, toc_offset) = match variant {
            CookieVariant::V20 => (
                non_negative("package length", cursor.read_i32::<BigEndian>()?)?,
                non_negative("toc offset", cursor.read_i32::<BigEndian>()?)?,
            ),
            CookieVariant::V21 => (
                cursor.read_u32::<BigEndian>()? as u64,
                cursor.read_u32::<BigEndian>()? as u64,
            ),
        };
        let toc_length = non_negative("toc length", cursor.read_i32::<BigEndian>()?)?;
        let pyver = non_negative("python version", cursor.read_i32::<BigEndian>()?)?;

        let python_library = match variant {
            CookieVariant::V20 => None,
            CookieVariant::V21 => {
                let raw = &data[24..88];
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                Some(String::from_utf8_lossy(&raw[..end]).into_owned())
            }
        };

        Ok(Self {
            variant,
            package_length,
            toc_offset,
            toc_length,
            python_version: PythonVersion::from_packed(pyver as u32),
            python_library,
        })
    }
}

fn non_negative(field: &'static str, value: i32) -> Result<u64> {
    u64::try_from(value).map_err(|_| {
        FormatError::InvalidCookieField {
            field,
            value: value as i64,
        }
        .into()
    })
}

/// Cookie plus the absolute positions derived from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub cookie: Cookie,
    pub cookie_pos: u64,
    pub file_size: u64,
    /// Absolute offset of the package start; entry positions are relative to it
    pub overlay_pos: u64,
    pub overlay_size: u64,
    pub toc_pos: u64,
}

impl ArchiveInfo {
    /// Compute overlay and TOC positions, checking they lie inside the file
    pub fn derive(cookie: Cookie, cookie_pos: u64, file_size: u64) -> Result<Self> {
        let cookie_end = cookie_pos + cookie.variant.size() as u64;
        let tail_bytes = file_size.saturating_sub(cookie_end);
        let overlay_size = cookie.package_length + tail_bytes;

        let overlay_pos = file_size
            .checked_sub(overlay_size)
            .ok_or(FormatError::OverlayOutOfBounds {
                overlay_size,
                size: file_size,
            })?;

        let toc_pos = overlay_pos + cookie.toc_offset;
        if toc_pos + cookie.toc_length > file_size {
            return Err(FormatError::TocOutOfBounds {
                toc_pos,
                toc_len: cookie.toc_length,
                size: file_size,
            }
            .into());
        }

        Ok(Self {
            cookie,
            cookie_pos,
            file_size,
            overlay_pos,
            overlay_size,
            toc_pos,
        })
    }

    pub fn python_version(&self) -> PythonVersion {
        self.cookie.python_version
    }

    pub fn toc_length(&self) -> u64 {
        self.cookie.toc_length
    }
}

/// Where an entry's name came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameOrigin {
    Stored,
    /// The stored bytes were unusable and a random name was generated
    Synthesized { reason: String },
}

/// One record of the CArchive table of contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocEntry {
    /// Absolute offset of the entry data in the file
    pub position: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub compression_flag: u8,
    pub type_tag: u8,
    pub name: String,
    pub name_origin: NameOrigin,
}

impl TocEntry {
    pub fn is_compressed(&self) -> bool {
        self.compression_flag == COMPRESSED
    }

    pub fn kind(&self) -> EntryKind {
        EntryKind::from_tag(self.type_tag)
    }
}

/// Entry type, decoded from the one-byte TOC tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// `d`: dependency on another archive
    Dependency,
    /// `o`: runtime option for the bootloader
    RuntimeOption,
    /// `s`: entry-point script, stored without a pyc header
    EntryScript,
    /// `m`, `M`: module or package, with or without its own pyc header
    Module,
    /// `z`, `Z`: nested module store
    NestedStore,
    /// `b`, `x`, `l`, `n`: binary, data file, splash resources, symlink
    Data,
    /// Any other tag. Written raw like [`EntryKind::Data`].
    Unrecognized(u8),
}

impl EntryKind {
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            b'd' => EntryKind::Dependency,
            b'o' => EntryKind::RuntimeOption,
            b's' => EntryKind::EntryScript,
            b'm' | b'M' => EntryKind::Module,
            b'z' | b'Z' => EntryKind::NestedStore,
            b'b' | b'x' | b'l' | b'n' => EntryKind::Data,
            other => EntryKind::Unrecognized(other),
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::Dependency => f.write_str("dependency"),
            EntryKind::RuntimeOption => f.write_str("option"),
            EntryKind::EntryScript => f.write_str("script"),
            EntryKind::Module => f.write_str("module"),
            EntryKind::NestedStore => f.write_str("pyz"),
            EntryKind::Data => f.write_str("data"),
            EntryKind::Unrecognized(tag) => write!(f, "unknown({})", *tag as char),
        }
    }
}
