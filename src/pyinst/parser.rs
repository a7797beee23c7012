//! Low-level CArchive parser.
//!
//! This module reads the PyInstaller CArchive from any source implementing
//! the [`ReadAt`] trait.
//!
//! ## Parsing Strategy
//!
//! The CArchive is appended to the bootloader and is read from the end:
//! 1. Scan backwards for the cookie signature
//! 2. Decide between the 2.0 and 2.1+ cookie layouts and decode it
//! 3. Derive the package start and the TOC position from the file size
//! 4. Read the whole TOC in one request and walk its records
//!
//! Entry data is only touched when an entry is actually read.

use byteorder::{BigEndian, ReadBytesExt};
use flate2::read::ZlibDecoder;
use std::io::{Cursor, Read};
use std::sync::Arc;

use crate::io::ReadAt;
use anyhow::{Context, Result, bail};

use super::error::FormatError;
use super::locator::find_cookie;
use super::structures::*;

/// Library name marker that identifies a 2.1+ cookie
const PYLIB_MARKER: &[u8] = b"python";
const PYLIB_FIELD_SIZE: usize = 64;

/// CArchive parser over a random-access reader.
pub struct CArchiveParser<R: ReadAt> {
    reader: Arc<R>,
    info: ArchiveInfo,
}

impl<R: ReadAt> CArchiveParser<R> {
    /// Locate and decode the cookie.
    ///
    /// # Errors
    ///
    /// Fails with a [`FormatError`] when the file is not a CArchive. This is
    /// the only all-or-nothing stage: without a cookie there is no TOC.
    pub async fn open(reader: Arc<R>) -> Result<Self> {
        let size = reader.size();
        let cookie_pos = find_cookie(reader.as_ref(), size).await?;
        let variant = detect_variant(reader.as_ref(), cookie_pos, size).await?;

        let needed = variant.size() as u64;
        if cookie_pos + needed > size {
            return Err(FormatError::TruncatedCookie {
                offset: cookie_pos,
                needed,
                size,
            }
            .into());
        }
        let mut buf = vec![0u8; variant.size()];
        reader.read_exact_at(cookie_pos, &mut buf).await?;
        let cookie = Cookie::from_bytes(variant, &buf)?;

        let info = ArchiveInfo::derive(cookie, cookie_pos, size)?;
        log::debug!(
            "cookie {} at {}: overlay {}+{}, toc {}+{}",
            info.cookie.variant,
            cookie_pos,
            info.overlay_pos,
            info.overlay_size,
            info.toc_pos,
            info.toc_length()
        );

        Ok(Self { reader, info })
    }

    pub fn info(&self) -> &ArchiveInfo {
        &self.info
    }

    /// Read the raw TOC region in a single request
    pub async fn read_toc(&self) -> Result<Vec<u8>> {
        let mut toc = vec![0u8; self.info.toc_length() as usize];
        self.reader
            .read_exact_at(self.info.toc_pos, &mut toc)
            .await
            .context("Could not read the table of contents")?;
        Ok(toc)
    }

    /// Read the TOC and collect every decodable record.
    ///
    /// Malformed records are skipped here; use [`TocIter`] directly to see them.
    pub async fn list_entries(&self) -> Result<Vec<TocEntry>> {
        let toc = self.read_toc().await?;
        Ok(TocIter::new(&toc, self.info.overlay_pos)
            .filter_map(|r| r.ok())
            .collect())
    }

    /// Read an entry's bytes and inflate them if the entry is compressed.
    ///
    /// A size mismatch after inflation is not an error; it is reported in
    /// [`EntryData::size_mismatch`] so the caller can decide.
    pub async fn read_entry(&self, entry: &TocEntry) -> Result<EntryData> {
        if entry.position + entry.compressed_size > self.info.file_size {
            bail!(
                "data at {}+{} lies outside the file",
                entry.position,
                entry.compressed_size
            );
        }
        let mut raw = vec![0u8; entry.compressed_size as usize];
        self.reader.read_exact_at(entry.position, &mut raw).await?;

        if !entry.is_compressed() {
            return Ok(EntryData {
                data: raw,
                size_mismatch: None,
            });
        }

        let data = inflate(&raw).context("Failed to decompress")?;
        let size_mismatch = (data.len() as u64 != entry.uncompressed_size)
            .then_some((entry.uncompressed_size, data.len() as u64));
        Ok(EntryData {
            data,
            size_mismatch,
        })
    }
}

/// Decoded entry bytes
#[derive(Debug, Clone)]
pub struct EntryData {
    pub data: Vec<u8>,
    /// `(declared, actual)` uncompressed sizes when they disagree
    pub size_mismatch: Option<(u64, u64)>,
}

/// Inflate a zlib stream completely
pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 2);
    ZlibDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Pick the cookie layout by looking for the library name that a 2.1+
/// cookie carries right after the 2.0 fields.
async fn detect_variant<R: ReadAt + ?Sized>(
    reader: &R,
    cookie_pos: u64,
    size: u64,
) -> Result<CookieVariant> {
    let probe_pos = cookie_pos + CookieVariant::V20.size() as u64;
    let available = size.saturating_sub(probe_pos).min(PYLIB_FIELD_SIZE as u64) as usize;
    let mut probe = vec![0u8; available];
    reader.read_exact_at(probe_pos, &mut probe).await?;

    Ok(if contains_pylib_marker(&probe) {
        CookieVariant::V21
    } else {
        CookieVariant::V20
    })
}

fn contains_pylib_marker(field: &[u8]) -> bool {
    field
        .to_ascii_lowercase()
        .windows(PYLIB_MARKER.len())
        .any(|w| w == PYLIB_MARKER)
}

/// Lazy walk over the records of a TOC.
///
/// Each record starts with its own length. The walk advances by that
/// declared length, not by what was decoded, and never reads past the end
/// of the TOC buffer: a record that runs over the end has its name cut at
/// the boundary and ends the walk.
pub struct TocIter<'a> {
    toc: &'a [u8],
    overlay_pos: u64,
    consumed: usize,
    done: bool,
}

/// A record that could not be decoded at all
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRecord {
    /// Offset of the record inside the TOC
    pub offset: usize,
    pub reason: String,
}

impl<'a> TocIter<'a> {
    pub fn new(toc: &'a [u8], overlay_pos: u64) -> Self {
        Self {
            toc,
            overlay_pos,
            consumed: 0,
            done: false,
        }
    }

    /// Bytes of the TOC accounted for so far
    pub fn consumed(&self) -> usize {
        self.consumed
    }
}

fn malformed(offset: usize, reason: String) -> MalformedRecord {
    log::debug!("malformed toc record at {}: {}", offset, reason);
    MalformedRecord { offset, reason }
}

impl Iterator for TocIter<'_> {
    type Item = Result<TocEntry, MalformedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.consumed >= self.toc.len() {
            return None;
        }

        let toc = self.toc;
        let offset = self.consumed;
        let rest = &toc[offset..];
        if rest.len() < 4 {
            self.done = true;
            self.consumed = toc.len();
            return Some(Err(malformed(
                offset,
                format!("{} trailing bytes are too short for a record", rest.len()),
            )));
        }

        let declared = i32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        if declared <= 0 {
            // Cannot advance past a record without a positive length
            self.done = true;
            self.consumed = toc.len();
            return Some(Err(
                malformed(offset, format!("record length {} is not positive", declared))
            ));
        }
        let declared = declared as usize;
        self.consumed = offset.saturating_add(declared).min(toc.len());

        if declared < TOC_RECORD_FIXED_SIZE || rest.len() < TOC_RECORD_FIXED_SIZE {
            return Some(Err(malformed(
                offset,
                format!("record of {} bytes is shorter than its fixed fields", declared),
            )));
        }

        let record = &rest[..declared.min(rest.len())];
        Some(Ok(decode_record(record, self.overlay_pos)))
    }
}

fn decode_record(record: &[u8], overlay_pos: u64) -> TocEntry {
    let mut cursor = Cursor::new(&record[4..TOC_RECORD_FIXED_SIZE]);
    // The slice is exactly the fixed fields, so these reads cannot fail
    let mut field = || cursor.read_u32::<BigEndian>().unwrap_or_default();
    let entry_pos = field() as u64;
    let compressed_size = field() as u64;
    let uncompressed_size = field() as u64;
    let compression_flag = record[16];
    let type_tag = record[17];

    let (name, name_origin) = decode_name(&record[TOC_RECORD_FIXED_SIZE..]);

    TocEntry {
        position: overlay_pos + entry_pos,
        compressed_size,
        uncompressed_size,
        compression_flag,
        type_tag,
        name,
        name_origin,
    }
}

/// UTF-8 name with NUL padding and leading `/` removed, or a random name
fn decode_name(raw: &[u8]) -> (String, NameOrigin) {
    let synthesize = |reason: String| {
        (
            uuid::Uuid::new_v4().to_string(),
            NameOrigin::Synthesized { reason },
        )
    };

    match std::str::from_utf8(raw) {
        Ok(s) => {
            let name = s.trim_end_matches('\0').trim_start_matches('/');
            if name.is_empty() {
                synthesize("entry has no name".to_string())
            } else {
                (name.to_string(), NameOrigin::Stored)
            }
        }
        Err(_) => synthesize(format!(
            "name {} contains invalid bytes",
            String::from_utf8_lossy(raw).trim_end_matches('\0')
        )),
    }
}
