//! PYZ module stores.
//!
//! A PYZ store is one CArchive entry holding the pure-Python modules of the
//! application:
//!
//! ```text
//! "PYZ\0" | pyc magic (4) | TOC offset (BE i32) | zlib module blobs ... | marshal TOC
//! ```
//!
//! The TOC maps dotted module names to `(is_package, offset, length)` and is
//! marshalled either as a dict or as a list of pairs.

use byteorder::{BigEndian, ReadBytesExt};
use std::collections::HashMap;
use std::ffi::OsString;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow, bail};

use super::extractor::ExtractionContext;
use super::magic::format_magic;
use super::marshal::{self, Value};
use super::parser::inflate;
use super::report::{Failure, StoreReport};
use super::sanitize::{module_path, with_suffix};
use super::structures::NameOrigin;

/// Signature at the start of every PYZ store
pub const PYZ_MAGIC: &[u8; 4] = b"PYZ\0";
pub const PYZ_HEADER_SIZE: usize = 12;

/// Suffix for module blobs that did not inflate, left for a decryption stage
pub const ENCRYPTED_SUFFIX: &str = "encrypted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PyzHeader {
    pub pyc_magic: [u8; 4],
    pub toc_offset: u64,
}

/// One module in a store's table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PyzEntry {
    pub name: String,
    pub name_origin: NameOrigin,
    pub is_package: bool,
    pub offset: u64,
    pub length: u64,
}

impl PyzEntry {
    /// `a/b/__init__.pyc` for package `a.b`, `a/b.pyc` for module `a.b`
    pub fn relative_path(&self) -> PathBuf {
        let base = module_path(&self.name);
        if self.is_package {
            base.join("__init__.pyc")
        } else {
            with_suffix(&base, "pyc")
        }
    }
}

/// Normalized store table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PyzToc {
    pub entries: Vec<PyzEntry>,
    /// Table items that could not be understood
    pub malformed: Vec<Failure>,
}

pub fn parse_header(data: &[u8]) -> Result<PyzHeader> {
    if data.len() < PYZ_HEADER_SIZE || &data[..4] != PYZ_MAGIC {
        bail!("not a valid PYZ archive");
    }
    let mut pyc_magic = [0u8; 4];
    pyc_magic.copy_from_slice(&data[4..8]);
    let toc_offset = Cursor::new(&data[8..12]).read_i32::<BigEndian>()?;
    let toc_offset = u64::try_from(toc_offset)
        .ok()
        .filter(|&o| o < data.len() as u64)
        .ok_or_else(|| anyhow!("TOC offset {} lies outside the store", toc_offset))?;
    Ok(PyzHeader {
        pyc_magic,
        toc_offset,
    })
}

/// Unmarshal and normalize the table at `header.toc_offset`
pub fn parse_toc(data: &[u8], header: &PyzHeader) -> Result<PyzToc> {
    let value = marshal::loads(&data[header.toc_offset as usize..])?;
    normalize(value)
}

/// Turn a dict or a list of `(name, (flag, offset, length))` pairs into a table.
///
/// A repeated name keeps its first position and its last value, like
/// building a dict from the pairs would.
pub fn normalize(value: Value) -> Result<PyzToc> {
    let pairs: Vec<(Value, Value)> = match value {
        Value::Dict(pairs) => pairs,
        Value::List(items) | Value::Tuple(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Tuple(mut kv) | Value::List(mut kv) if kv.len() == 2 => {
                    let v = kv.pop().unwrap_or(Value::None);
                    let k = kv.pop().unwrap_or(Value::None);
                    (k, v)
                }
                other => (Value::Null, other),
            })
            .collect(),
        other => bail!("table is a {}, expected dict or list", other.type_name()),
    };

    let mut toc = PyzToc::default();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for (index, (key, value)) in pairs.into_iter().enumerate() {
        match decode_item(key, &value) {
            Ok(entry) => match seen.get(&entry.name) {
                Some(&at) => toc.entries[at] = entry,
                None => {
                    seen.insert(entry.name.clone(), toc.entries.len());
                    toc.entries.push(entry);
                }
            },
            Err(e) => toc
                .malformed
                .push(Failure::new(format!("table item {}", index), e.to_string())),
        }
    }
    Ok(toc)
}

fn decode_item(key: Value, value: &Value) -> Result<PyzEntry> {
    let (name, name_origin) = match key {
        Value::Str(s) if !s.is_empty() => (s, NameOrigin::Stored),
        Value::Bytes(b) if !b.is_empty() => match String::from_utf8(b) {
            Ok(s) => (s, NameOrigin::Stored),
            Err(e) => (
                uuid::Uuid::new_v4().to_string(),
                NameOrigin::Synthesized {
                    reason: format!("module name {:?} is not UTF-8", e.as_bytes()),
                },
            ),
        },
        Value::Str(_) | Value::Bytes(_) => (
            uuid::Uuid::new_v4().to_string(),
            NameOrigin::Synthesized {
                reason: "module has no name".to_string(),
            },
        ),
        Value::Null => bail!("item is not a (name, value) pair"),
        other => bail!("module name is a {}", other.type_name()),
    };

    let fields = value
        .as_sequence()
        .filter(|f| f.len() == 3)
        .ok_or_else(|| anyhow!("{}: value is not an (is_package, offset, length) triple", name))?;
    let number = |i: usize, what: &str| -> Result<u64> {
        fields[i]
            .as_int()
            .and_then(|v| u64::try_from(v).ok())
            .ok_or_else(|| anyhow!("{}: bad {} {:?}", name, what, fields[i]))
    };

    Ok(PyzEntry {
        is_package: number(0, "package flag")? == 1,
        offset: number(1, "offset")?,
        length: number(2, "length")?,
        name,
        name_origin,
    })
}

/// `<store>_extracted` beside the store itself
fn output_dir_for(store: &Path) -> PathBuf {
    let mut s = OsString::from(store.as_os_str());
    s.push("_extracted");
    PathBuf::from(s)
}

/// Extract every module of the store already written at `store_rel` under the
/// context root.
///
/// Problems never escape: a bad header or table ends this store with a
/// failure, a bad module is recorded and the next one is tried.
pub(crate) async fn extract_store(
    ctx: &mut ExtractionContext<'_>,
    name: &str,
    store_rel: &Path,
    progress_every: usize,
) -> StoreReport {
    let out_rel = output_dir_for(store_rel);
    let mut report = StoreReport {
        name: name.to_string(),
        output_dir: ctx.root().join(&out_rel),
        ..Default::default()
    };

    let data = match tokio::fs::read(ctx.root().join(store_rel)).await {
        Ok(data) => data,
        Err(e) => {
            ctx.status().error(format!("Could not reopen {}: {}", name, e));
            report.failures.push(Failure::new(name, e.to_string()));
            return report;
        }
    };

    let header = match parse_header(&data) {
        Ok(h) => h,
        Err(e) => {
            ctx.status().warn(format!("{} is not a valid PYZ archive", name));
            report.failures.push(Failure::new(name, e.to_string()));
            return report;
        }
    };
    ctx.adopt_store_magic(header.pyc_magic, name);

    let toc = match parse_toc(&data, &header) {
        Ok(toc) => toc,
        Err(e) => {
            ctx.status().error(format!(
                "Unmarshalling FAILED. Cannot extract {}. Extracting remaining files.",
                name
            ));
            report.failures.push(Failure::new(name, format!("bad table: {}", e)));
            return report;
        }
    };

    if let Err(e) = tokio::fs::create_dir_all(&report.output_dir).await {
        report.failures.push(Failure::new(name, e.to_string()));
        return report;
    }

    ctx.status()
        .info(format!("Found {} files in PYZ archive", toc.entries.len()));
    log::debug!(
        "{}: magic {}, {} modules, {} malformed",
        name,
        format_magic(&header.pyc_magic),
        toc.entries.len(),
        toc.malformed.len()
    );

    for bad in &toc.malformed {
        ctx.status().warn(format!("Skipping {} in {}: {}", bad.path, name, bad.reason));
    }
    report.total = toc.entries.len() + toc.malformed.len();
    report.failures.extend(toc.malformed);

    let count = toc.entries.len();
    for (i, entry) in toc.entries.iter().enumerate() {
        if let NameOrigin::Synthesized { reason } = &entry.name_origin {
            ctx.status()
                .warn(format!("{}. Using random name {}", reason, entry.name));
        }

        let rel = out_rel.join(entry.relative_path());
        match extract_module(ctx, &data, entry, &rel).await {
            Ok(ModuleOutcome::Written) => match &entry.name_origin {
                NameOrigin::Stored => report.extracted += 1,
                NameOrigin::Synthesized { reason } => report
                    .failures
                    .push(Failure::new(rel.display().to_string(), reason.clone())),
            },
            Ok(ModuleOutcome::Encrypted(path)) => {
                report.failures.push(Failure::new(
                    rel.display().to_string(),
                    "did not decompress; kept as .encrypted",
                ));
                report.encrypted.push(path);
            }
            Err(e) => {
                ctx.status()
                    .error(format!("Failed to extract {}: {}", rel.display(), e));
                report
                    .failures
                    .push(Failure::new(rel.display().to_string(), e.to_string()));
            }
        }

        if i % progress_every == 0 || i + 1 == count {
            ctx.status()
                .progress("Extracting PYZ contents", i + 1, count);
        }
    }

    report
}

enum ModuleOutcome {
    Written,
    Encrypted(PathBuf),
}

async fn extract_module(
    ctx: &mut ExtractionContext<'_>,
    data: &[u8],
    entry: &PyzEntry,
    rel: &Path,
) -> Result<ModuleOutcome> {
    let blob = entry
        .offset
        .checked_add(entry.length)
        .and_then(|end| data.get(entry.offset as usize..end as usize))
        .ok_or_else(|| {
            anyhow!(
                "module data {}+{} lies outside the store",
                entry.offset,
                entry.length
            )
        })?;

    match inflate(blob) {
        Ok(code) => {
            ctx.write_bare_pyc(rel, &code).await?;
            Ok(ModuleOutcome::Written)
        }
        Err(_) => {
            let sentinel = with_suffix(rel, ENCRYPTED_SUFFIX);
            ctx.status().error(format!(
                "Failed to decompress {}, probably encrypted. Extracting as is.",
                rel.display()
            ));
            let path = ctx.write_raw(&sentinel, blob).await?;
            Ok(ModuleOutcome::Encrypted(path))
        }
    }
}
