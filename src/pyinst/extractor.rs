use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::io::ReadAt;
use crate::status::Status;
use anyhow::{Result, bail};

use super::magic::{self, bare_header, format_magic, has_pyc_header, lookup_version};
use super::options::ExtractOptions;
use super::parser::{CArchiveParser, TocIter};
use super::pyz;
use super::report::{ExtractionReport, Failure};
use super::sanitize::{entry_path, with_suffix};
use super::structures::{EntryKind, NameOrigin, PythonVersion, TocEntry};

/// How an entry's bytes are written, decided from its tag and payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Dependency and runtime-option records carry nothing to write
    Discard,
    /// Entry-point script, always bare
    Script,
    Module { has_own_header: bool },
    /// Written raw, then unpacked as a PYZ store
    NestedStore,
    Data,
    /// Unknown tag; written raw like [`Route::Data`]
    Unrecognized(u8),
}

impl Route {
    pub fn resolve(kind: EntryKind, data: &[u8]) -> Self {
        match kind {
            EntryKind::Dependency | EntryKind::RuntimeOption => Route::Discard,
            EntryKind::EntryScript => Route::Script,
            EntryKind::Module => Route::Module {
                has_own_header: has_pyc_header(data),
            },
            EntryKind::NestedStore => Route::NestedStore,
            EntryKind::Data => Route::Data,
            EntryKind::Unrecognized(tag) => Route::Unrecognized(tag),
        }
    }
}

/// State shared by every write of one extraction run.
///
/// The bytecode magic may only become known after some bare files have been
/// written; those files are remembered and patched once it is.
pub(crate) struct ExtractionContext<'s> {
    root: PathBuf,
    version: PythonVersion,
    known_magic: Option<[u8; 4]>,
    pending_fixups: Vec<PathBuf>,
    status: &'s Status,
}

impl<'s> ExtractionContext<'s> {
    pub(crate) fn new(root: PathBuf, version: PythonVersion, status: &'s Status) -> Self {
        Self {
            root,
            version,
            known_magic: None,
            pending_fixups: Vec::new(),
            status,
        }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn status(&self) -> &'s Status {
        self.status
    }

    /// Take the magic of a payload that carries its own header, if none is known yet
    fn adopt_module_magic(&mut self, magic: [u8; 4], source: &str) {
        if self.known_magic.is_some() {
            return;
        }
        self.known_magic = Some(magic);
        self.report_magic(magic, source);
    }

    /// A PYZ store's magic replaces whatever was known before
    pub(crate) fn adopt_store_magic(&mut self, magic: [u8; 4], source: &str) {
        match self.known_magic {
            None => {
                self.known_magic = Some(magic);
                self.report_magic(magic, source);
            }
            Some(known) if known != magic => {
                self.known_magic = Some(magic);
                self.status.warn(format!(
                    "pyc magic of files inside {} ({}) differs from the CArchive ({})",
                    source,
                    format_magic(&magic),
                    format_magic(&known)
                ));
                self.report_magic(magic, source);
            }
            Some(_) => {}
        }
    }

    fn report_magic(&self, magic: [u8; 4], source: &str) {
        match lookup_version(&magic) {
            Some(v) => {
                self.status.info(format!(
                    "Bytecode magic {} (Python {}) taken from {}",
                    format_magic(&magic),
                    v,
                    source
                ));
                let built = self.version.to_string();
                if v != built && !v.starts_with(&format!("{}.", built)) {
                    self.status.warn(format!(
                        "magic says Python {} but the archive was built with Python {}",
                        v, self.version
                    ));
                }
            }
            None => self.status.warn(format!(
                "Unknown bytecode magic {} taken from {}",
                format_magic(&magic),
                source
            )),
        }
    }

    async fn write_parts(&self, rel: &Path, parts: &[&[u8]]) -> Result<PathBuf> {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let mut file = fs::File::create(&path).await?;
        for part in parts {
            file.write_all(part).await?;
        }
        file.flush().await?;
        Ok(path)
    }

    /// Write bytes as they are
    pub(crate) async fn write_raw(&self, rel: &Path, data: &[u8]) -> Result<PathBuf> {
        self.write_parts(rel, &[data]).await
    }

    /// Write a bare payload behind a reconstructed pyc header
    pub(crate) async fn write_bare_pyc(&mut self, rel: &Path, payload: &[u8]) -> Result<PathBuf> {
        let header = bare_header(self.known_magic, self.version);
        let path = self.write_parts(rel, &[header.as_slice(), payload]).await?;
        if self.known_magic.is_none() {
            self.pending_fixups.push(path.clone());
        }
        Ok(path)
    }

    /// Patch the magic into every file written before it was known.
    ///
    /// Returns the files that still carry a zero placeholder, and any files
    /// that could not be patched.
    async fn resolve_pending(&mut self, assume_from_version: bool) -> (Vec<PathBuf>, Vec<Failure>) {
        let pending = std::mem::take(&mut self.pending_fixups);
        if pending.is_empty() {
            return (Vec::new(), Vec::new());
        }

        if self.known_magic.is_none() && assume_from_version {
            if let Some(m) = magic::magic_for_version(self.version) {
                self.status.warn(format!(
                    "No bytecode magic found; assuming {} for Python {}",
                    format_magic(&m),
                    self.version
                ));
                self.known_magic = Some(m);
            }
        }

        let Some(magic) = self.known_magic else {
            self.status.warn(format!(
                "Bytecode magic never found; {} files keep a zero placeholder header",
                pending.len()
            ));
            return (pending, Vec::new());
        };

        let mut failures = Vec::new();
        for path in pending {
            if let Err(e) = patch_magic(&path, &magic).await {
                self.status
                    .error(format!("Could not fix header of {}: {}", path.display(), e));
                failures.push(Failure::new(path.display().to_string(), e.to_string()));
            }
        }
        (Vec::new(), failures)
    }
}

async fn patch_magic(path: &Path, magic: &[u8; 4]) -> Result<()> {
    let mut file = fs::OpenOptions::new().write(true).open(path).await?;
    file.write_all(magic).await?;
    file.flush().await?;
    Ok(())
}

/// Default output directory: `<file name>_extracted` beside the input
pub fn default_output_dir(input: &Path) -> PathBuf {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    let dir = format!("{}_extracted", name);
    match input.parent() {
        Some(parent) => parent.join(dir),
        None => PathBuf::from(dir),
    }
}

/// PyInstaller CArchive extractor
pub struct Extractor<R: ReadAt> {
    parser: CArchiveParser<R>,
    options: ExtractOptions,
    status: Status,
}

impl<R: ReadAt> Extractor<R> {
    /// Open the archive; fails if the file has no usable cookie
    pub async fn open(reader: Arc<R>) -> Result<Self> {
        Ok(Self {
            parser: CArchiveParser::open(reader).await?,
            options: ExtractOptions::default(),
            status: Status::silent(),
        })
    }

    pub fn with_options(mut self, options: ExtractOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn parser(&self) -> &CArchiveParser<R> {
        &self.parser
    }

    /// List all entries in the archive
    pub async fn list_files(&self) -> Result<Vec<TocEntry>> {
        self.parser.list_entries().await
    }

    /// Decoded bytes of a single entry
    pub async fn extract_to_memory(&self, entry: &TocEntry) -> Result<Vec<u8>> {
        Ok(self.parser.read_entry(entry).await?.data)
    }

    /// Extract every entry under `root` (or the configured output directory).
    ///
    /// Only problems reading the TOC or creating the root are returned as
    /// errors. Per-entry problems land in the report.
    pub async fn extract_all(&self, root: &Path) -> Result<ExtractionReport> {
        let root = self.options.output_dir.clone().unwrap_or_else(|| root.to_path_buf());
        let info = self.parser.info();
        let version = info.python_version();

        self.status
            .info(format!("Pyinstaller version: {}", info.cookie.variant));
        self.status.info(format!("Python version: {}", version));
        self.status
            .info(format!("Length of package: {} bytes", info.cookie.package_length));

        let toc = self.parser.read_toc().await?;
        let records: Vec<_> = TocIter::new(&toc, info.overlay_pos).collect();
        self.status
            .info(format!("Found {} files in CArchive", records.len()));

        fs::create_dir_all(&root).await?;
        self.status.info("Beginning extraction...please standby");

        let mut ctx = ExtractionContext::new(root.clone(), version, &self.status);
        let mut report = ExtractionReport::new(root.clone(), version);
        let total = records.len();

        for (i, record) in records.into_iter().enumerate() {
            if self.options.is_cancelled() {
                self.status.warn("Extraction cancelled");
                report.cancelled = true;
                break;
            }
            report.total += 1;

            match record {
                Ok(entry) => {
                    if self.options.is_excluded(&entry.name) {
                        log::debug!("excluded {}", entry.name);
                        report.skipped += 1;
                    } else {
                        let (rel, renamed) = self.output_path(&entry);
                        match (self.dispatch(&mut ctx, &entry, &rel, &mut report).await, renamed) {
                            // Written, but under a name the archive did not give it
                            (Ok(()), Some(reason)) => report
                                .failures
                                .push(Failure::new(rel.display().to_string(), reason)),
                            (Ok(()), None) => report.extracted += 1,
                            (Err(e), _) => {
                                self.status
                                    .error(format!("{}: {:#}", entry.name, e));
                                report
                                    .failures
                                    .push(Failure::new(entry.name.clone(), format!("{:#}", e)));
                            }
                        }
                    }
                }
                Err(bad) => {
                    self.status.warn(format!(
                        "Skipping malformed TOC record at {}: {}",
                        bad.offset, bad.reason
                    ));
                    report.failures.push(Failure::new(
                        format!("toc record at {}", bad.offset),
                        bad.reason,
                    ));
                }
            }

            if i % self.options.progress_every.max(1) == 0 || i + 1 == total {
                self.status.progress("Extracting files", i + 1, total);
            }
        }

        let (unresolved, failures) = ctx
            .resolve_pending(self.options.assume_magic_from_version)
            .await;
        report.unresolved_headers = unresolved;
        report.failures.extend(failures);
        report.magic = ctx.known_magic;

        self.status.info(format!(
            "Extraction complete! Files extracted to: {}",
            root.display()
        ));
        Ok(report)
    }

    /// Root-relative output path of an entry, and why it was renamed if the
    /// stored name was unusable
    fn output_path(&self, entry: &TocEntry) -> (PathBuf, Option<String>) {
        if let NameOrigin::Synthesized { reason } = &entry.name_origin {
            self.status
                .warn(format!("{}. Using random name {}", reason, entry.name));
            return (entry_path(&entry.name), Some(reason.clone()));
        }

        let rel = entry_path(&entry.name);
        if !rel.as_os_str().is_empty() {
            return (rel, None);
        }
        let rel = PathBuf::from(uuid::Uuid::new_v4().to_string());
        self.status.warn(format!(
            "Entry name {:?} has no usable path. Using random name {}",
            entry.name,
            rel.display()
        ));
        (rel, Some(format!("entry name {:?} has no usable path", entry.name)))
    }

    /// Read one entry and write it according to its route
    async fn dispatch(
        &self,
        ctx: &mut ExtractionContext<'_>,
        entry: &TocEntry,
        rel: &Path,
        report: &mut ExtractionReport,
    ) -> Result<()> {
        let decoded = self.parser.read_entry(entry).await?;
        let data = &decoded.data;

        match Route::resolve(entry.kind(), data) {
            Route::Discard => {}
            Route::Script => {
                let pyc = with_suffix(rel, "pyc");
                self.status
                    .info(format!("Possible entry point: {}", pyc.display()));
                let path = ctx.write_bare_pyc(&pyc, data).await?;
                report.entry_points.push(path);
            }
            Route::Module {
                has_own_header: true,
            } => {
                let mut magic = [0u8; 4];
                magic.copy_from_slice(&data[..4]);
                ctx.adopt_module_magic(magic, &entry.name);
                ctx.write_raw(&with_suffix(rel, "pyc"), data).await?;
            }
            Route::Module {
                has_own_header: false,
            } => {
                ctx.write_bare_pyc(&with_suffix(rel, "pyc"), data).await?;
            }
            Route::NestedStore => {
                ctx.write_raw(rel, data).await?;
                let store = pyz::extract_store(
                    ctx,
                    &entry.name,
                    rel,
                    self.options.store_progress_every.max(1),
                )
                .await;
                report.stores.push(store);
            }
            Route::Data => {
                ctx.write_raw(rel, data).await?;
            }
            Route::Unrecognized(tag) => {
                log::debug!(
                    "unrecognized type tag {:?} on {}, writing raw",
                    tag as char,
                    entry.name
                );
                ctx.write_raw(rel, data).await?;
            }
        }

        if let Some((declared, actual)) = decoded.size_mismatch {
            bail!(
                "Decompressed size mismatch: expected {} bytes, got {}",
                declared,
                actual
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_from_tag_and_payload() {
        let headered = [0x55, 0x0D, 0x0D, 0x0A, 0, 0, 0, 0];
        let bare = [0xE3, 0, 0, 0, 0, 0];

        assert_eq!(Route::resolve(EntryKind::from_tag(b'd'), &bare), Route::Discard);
        assert_eq!(Route::resolve(EntryKind::from_tag(b'o'), &bare), Route::Discard);
        assert_eq!(Route::resolve(EntryKind::from_tag(b's'), &headered), Route::Script);
        assert_eq!(
            Route::resolve(EntryKind::from_tag(b'm'), &headered),
            Route::Module {
                has_own_header: true
            }
        );
        assert_eq!(
            Route::resolve(EntryKind::from_tag(b'M'), &bare),
            Route::Module {
                has_own_header: false
            }
        );
        assert_eq!(Route::resolve(EntryKind::from_tag(b'Z'), &bare), Route::NestedStore);
        assert_eq!(Route::resolve(EntryKind::from_tag(b'x'), &bare), Route::Data);
        assert_eq!(
            Route::resolve(EntryKind::from_tag(b'?'), &bare),
            Route::Unrecognized(b'?')
        );
    }

    #[test]
    fn output_dir_beside_input() {
        assert_eq!(
            default_output_dir(Path::new("/tmp/app.exe")),
            Path::new("/tmp/app.exe_extracted")
        );
        assert_eq!(
            default_output_dir(Path::new("app")),
            Path::new("app_extracted")
        );
    }

    #[tokio::test]
    async fn pending_headers_are_patched_once_magic_is_known() {
        let dir = tempfile::tempdir().unwrap();
        let status = Status::silent();
        let mut ctx =
            ExtractionContext::new(dir.path().to_path_buf(), PythonVersion::new(3, 6), &status);

        let early = ctx.write_bare_pyc(Path::new("early.pyc"), b"CODE").await.unwrap();
        ctx.adopt_module_magic([0x33, 0x0D, 0x0D, 0x0A], "mod");
        // Later adoption by a module does not replace the first magic
        ctx.adopt_module_magic([0x42, 0x0D, 0x0D, 0x0A], "other");
        let late = ctx.write_bare_pyc(Path::new("late.pyc"), b"CODE").await.unwrap();

        let (unresolved, failures) = ctx.resolve_pending(false).await;
        assert!(unresolved.is_empty());
        assert!(failures.is_empty());

        for path in [early, late] {
            let bytes = std::fs::read(path).unwrap();
            assert_eq!(bytes.len(), 12 + 4);
            assert_eq!(&bytes[..4], &[0x33, 0x0D, 0x0D, 0x0A]);
            assert_eq!(&bytes[4..12], &[0u8; 8]);
            assert_eq!(&bytes[12..], b"CODE");
        }
    }

    #[tokio::test]
    async fn store_magic_overrides_and_unknown_magic_stays_zero() {
        let dir = tempfile::tempdir().unwrap();
        let status = Status::silent();
        let mut ctx =
            ExtractionContext::new(dir.path().to_path_buf(), PythonVersion::new(2, 7), &status);

        let path = ctx.write_bare_pyc(Path::new("a/b.pyc"), b"X").await.unwrap();
        let (unresolved, _) = ctx.resolve_pending(false).await;
        assert_eq!(unresolved, vec![path.clone()]);
        assert_eq!(std::fs::read(&path).unwrap(), b"\0\0\0\0\0\0\0\0X");

        ctx.adopt_module_magic([0x03, 0xF3, 0x0D, 0x0A], "m");
        ctx.adopt_store_magic([0xD1, 0xF2, 0x0D, 0x0A], "PYZ-00.pyz");
        assert_eq!(ctx.known_magic, Some([0xD1, 0xF2, 0x0D, 0x0A]));
    }

    #[test]
    fn replacing_store_magic_is_checked_against_the_archive_version() {
        let lines = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let sink = lines.clone();
        let status = Status::new(move |line| sink.lock().unwrap().push(line.to_string()));
        let mut ctx = ExtractionContext::new(PathBuf::from("out"), PythonVersion::new(3, 8), &status);

        ctx.adopt_module_magic([0x55, 0x0D, 0x0D, 0x0A], "mod");
        ctx.adopt_store_magic([0x42, 0x0D, 0x0D, 0x0A], "PYZ-00.pyz");

        let lines = lines.lock().unwrap();
        assert!(lines.iter().any(|l| l.contains("differs from the CArchive")));
        assert!(lines
            .iter()
            .any(|l| l.contains("Python 3.7") && l.contains("taken from PYZ-00.pyz")));
        assert!(lines
            .iter()
            .any(|l| l.starts_with("[!]") && l.contains("magic says Python 3.7")));
    }
}
