use std::fmt;
use std::path::PathBuf;

use super::structures::PythonVersion;

/// Something that went wrong with one entry or module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Entry name or output path the failure is about
    pub path: String,
    pub reason: String,
}

impl Failure {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

/// Outcome of extracting one nested PYZ store
#[derive(Debug, Clone, Default)]
pub struct StoreReport {
    /// Entry name of the store in the CArchive
    pub name: String,
    /// `<name>_extracted` directory
    pub output_dir: PathBuf,
    /// Modules listed in the store's table
    pub total: usize,
    /// Modules written as decompressed bytecode
    pub extracted: usize,
    /// `.encrypted` sentinel files left for a decryption stage
    pub encrypted: Vec<PathBuf>,
    pub failures: Vec<Failure>,
}

/// Outcome of one extraction run
#[derive(Debug, Clone)]
pub struct ExtractionReport {
    pub output_dir: PathBuf,
    pub python_version: PythonVersion,
    /// Entries in the TOC, malformed records included
    pub total: usize,
    /// Entries handled without any problem
    pub extracted: usize,
    /// Entries left out by an exclusion pattern
    pub skipped: usize,
    pub failures: Vec<Failure>,
    pub stores: Vec<StoreReport>,
    /// Bytecode magic in effect at the end of the run
    pub magic: Option<[u8; 4]>,
    /// Files whose header still has a zero placeholder magic
    pub unresolved_headers: Vec<PathBuf>,
    /// Possible entry points (`s` entries)
    pub entry_points: Vec<PathBuf>,
    pub cancelled: bool,
}

impl ExtractionReport {
    pub(crate) fn new(output_dir: PathBuf, python_version: PythonVersion) -> Self {
        Self {
            output_dir,
            python_version,
            total: 0,
            extracted: 0,
            skipped: 0,
            failures: Vec::new(),
            stores: Vec::new(),
            magic: None,
            unresolved_headers: Vec::new(),
            entry_points: Vec::new(),
            cancelled: false,
        }
    }

    /// Every `.encrypted` file produced across all stores
    pub fn encrypted_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.stores.iter().flat_map(|s| s.encrypted.iter())
    }

    /// Whether every entry and module came out cleanly
    pub fn is_complete(&self) -> bool {
        !self.cancelled
            && self.failures.is_empty()
            && self.unresolved_headers.is_empty()
            && self.stores.iter().all(|s| s.failures.is_empty())
    }
}
