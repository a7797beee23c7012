/// Errors that make a file unusable as a CArchive.
///
/// These abort the whole run. Everything that goes wrong with a single
/// entry is recorded in the extraction report instead.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("file is too short or truncated ({size} bytes)")]
    TooShort { size: u64 },

    #[error("missing cookie, unsupported pyinstaller version or not a pyinstaller archive")]
    CookieNotFound,

    #[error("cookie at offset {offset} needs {needed} bytes but the file ends at {size}")]
    TruncatedCookie { offset: u64, needed: u64, size: u64 },

    #[error("invalid cookie field {field}: {value}")]
    InvalidCookieField { field: &'static str, value: i64 },

    #[error("package of {overlay_size} bytes does not fit in a {size} byte file")]
    OverlayOutOfBounds { overlay_size: u64, size: u64 },

    #[error("table of contents at {toc_pos}+{toc_len} lies outside a {size} byte file")]
    TocOutOfBounds { toc_pos: u64, toc_len: u64, size: u64 },
}
