//! Turning archive names into paths that stay under the extraction root.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Relative path for an archive entry name.
///
/// Both `/` and `\` separate components. `..` becomes `__`, `.` and empty
/// components are dropped, so the result never climbs out of the root and
/// never starts with a root or drive prefix.
pub fn entry_path(name: &str) -> PathBuf {
    name.split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != ".")
        .map(|part| {
            let part = part.replace("..", "__");
            // `C:` would turn the join into a drive-relative path on Windows
            part.replace(':', "_")
        })
        .collect()
}

/// Relative path for a dotted module name from a PYZ store
pub fn module_path(name: &str) -> PathBuf {
    let dotted = name.replace("..", "__");
    entry_path(&dotted.replace('.', "/"))
}

/// `path` with `.ext` appended to its final component, keeping existing dots
pub fn with_suffix(path: &Path, ext: &str) -> PathBuf {
    let mut s = OsString::from(path.as_os_str());
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}
