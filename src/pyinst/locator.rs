//! Backward scan for the CArchive cookie signature.

use anyhow::Result;

use crate::io::ReadAt;

use super::error::FormatError;
use super::structures::COOKIE_MAGIC;

/// Window size of the backward scan
pub const SEARCH_CHUNK_SIZE: u64 = 8192;

/// Find the absolute offset of the last cookie signature in `reader`.
///
/// The file is walked from the end in [`SEARCH_CHUNK_SIZE`] windows. Each
/// window overlaps the previous one by `signature length - 1` bytes so a
/// signature split across a window boundary is still seen whole. Within a
/// window the last occurrence wins, since the real cookie is the one closest
/// to the end of the file.
pub async fn find_cookie<R: ReadAt + ?Sized>(reader: &R, size: u64) -> Result<u64> {
    let sig_len = COOKIE_MAGIC.len() as u64;
    if size < sig_len {
        return Err(FormatError::TooShort { size }.into());
    }

    let mut end = size;
    let mut buf = vec![0u8; SEARCH_CHUNK_SIZE as usize];

    loop {
        let start = end.saturating_sub(SEARCH_CHUNK_SIZE);
        let len = (end - start) as usize;
        if (len as u64) < sig_len {
            break;
        }

        let window = &mut buf[..len];
        reader.read_exact_at(start, window).await?;
        log::trace!("scanning window {}..{}", start, end);

        if let Some(pos) = rfind(window, COOKIE_MAGIC) {
            let offset = start + pos as u64;
            log::debug!("cookie signature found at {}", offset);
            return Ok(offset);
        }

        if start == 0 {
            break;
        }
        end = start + sig_len - 1;
    }

    Err(FormatError::CookieNotFound.into())
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}
