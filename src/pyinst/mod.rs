//! PyInstaller archive parsing and extraction.
//!
//! This module reads the archive PyInstaller appends to its bootloader and
//! writes its contents back out as files, rebuilding pyc headers where the
//! archive stored bare bytecode.
//!
//! ## Architecture
//!
//! - [`structures`]: Cookie, TOC entry and version types
//! - [`locator`]: Backward scan for the cookie signature
//! - [`parser`]: Cookie decoding, TOC walking and entry decoding
//! - [`extractor`]: Per-entry routing and the header fix-up pass
//! - [`pyz`]: The nested module store, with [`marshal`] for its table
//!
//! ## Format Overview
//!
//! An executable built by PyInstaller consists of:
//! 1. The native bootloader
//! 2. The CArchive package: entry data, then the table of contents
//! 3. A cookie at the end of the package giving its length, the TOC
//!    position and the Python version
//!
//! Anything after the cookie (a code signature, for example) is tolerated.
//!
//! ## Limitations
//!
//! - Encrypted PYZ modules are left as `.encrypted` files; see [`decrypt`]
//! - Extracted bytecode is not validated or decompiled

pub mod decrypt;
mod error;
mod extractor;
pub mod locator;
pub mod magic;
pub mod marshal;
mod options;
mod parser;
pub mod pyz;
mod report;
pub mod sanitize;
mod structures;

pub use error::FormatError;
pub use extractor::{Extractor, Route, default_output_dir};
pub use options::{ExtractOptions, glob_match};
pub use parser::{CArchiveParser, EntryData, MalformedRecord, TocIter, inflate};
pub use report::{ExtractionReport, Failure, StoreReport};
pub use structures::*;
