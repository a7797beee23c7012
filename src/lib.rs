//! # pyxtract
//!
//! Extract the contents of PyInstaller-built executables.
//!
//! PyInstaller appends an archive (the CArchive) to its native bootloader.
//! This library locates that archive, walks its table of contents and writes
//! every stored file to disk. Bytecode stored without its header gets one
//! rebuilt, and the nested PYZ module store is unpacked into its own
//! directory.
//!
//! ## Features
//!
//! - Both cookie layouts (PyInstaller 2.0 and 2.1+)
//! - Local files and HTTP/HTTPS URLs using Range requests
//! - Header reconstruction for bare bytecode, with a late fix-up pass when
//!   the interpreter magic is only discovered after the first writes
//! - PYZ stores with dict or list tables; encrypted modules are kept aside
//! - Listing and single-entry decoding without extraction
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use pyxtract::{Extractor, LocalFileReader, Status};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let reader = Arc::new(LocalFileReader::new(Path::new("app.exe"))?);
//!
//!     let extractor = Extractor::open(reader)
//!         .await?
//!         .with_status(Status::new(|line| println!("{}", line)));
//!
//!     let report = extractor.extract_all(Path::new("app.exe_extracted")).await?;
//!     for failure in &report.failures {
//!         eprintln!("{}", failure);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod io;
pub mod pyinst;
pub mod status;

pub use cli::Cli;
pub use io::{HttpRangeReader, LocalFileReader, MemoryReader, ReadAt};
pub use pyinst::{
    ExtractOptions, ExtractionReport, Extractor, Failure, FormatError, StoreReport, TocEntry,
};
pub use status::Status;
