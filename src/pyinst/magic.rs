//! Bytecode magic numbers and pyc header synthesis.

use super::structures::PythonVersion;

/// Marker at bytes 2..4 of every pyc magic since Python 1.3
pub const PYC_HEADER_MARKER: &[u8; 2] = b"\r\n";

/// Known pyc magic numbers, CPython 1.0 through 3.13
pub const MAGIC_NUMBERS: &[([u8; 4], &str)] = &[
    ([0x02, 0x99, 0x99, 0x00], "1.0"),
    ([0x03, 0x99, 0x99, 0x00], "1.1"),
    ([0x89, 0x2E, 0x0D, 0x0A], "1.3"),
    ([0x04, 0x17, 0x0D, 0x0A], "1.4"),
    ([0x99, 0x4E, 0x0D, 0x0A], "1.5"),
    ([0xFC, 0xC4, 0x0D, 0x0A], "1.6"),
    ([0x87, 0xC6, 0x0D, 0x0A], "2.0"),
    ([0x2A, 0xEB, 0x0D, 0x0A], "2.1"),
    ([0x2D, 0xED, 0x0D, 0x0A], "2.2"),
    ([0x3B, 0xF2, 0x0D, 0x0A], "2.3"),
    ([0x6D, 0xF2, 0x0D, 0x0A], "2.4"),
    ([0xB3, 0xF2, 0x0D, 0x0A], "2.5"),
    ([0xD1, 0xF2, 0x0D, 0x0A], "2.6"),
    ([0x03, 0xF3, 0x0D, 0x0A], "2.7"),
    ([0x3A, 0x0C, 0x0D, 0x0A], "3.0"),
    ([0x4E, 0x0C, 0x0D, 0x0A], "3.1"),
    ([0x6C, 0x0C, 0x0D, 0x0A], "3.2"),
    ([0x9E, 0x0C, 0x0D, 0x0A], "3.3"),
    ([0xEE, 0x0C, 0x0D, 0x0A], "3.4"),
    ([0x16, 0x0D, 0x0D, 0x0A], "3.5"),
    ([0x17, 0x0D, 0x0D, 0x0A], "3.5.3"),
    ([0x33, 0x0D, 0x0D, 0x0A], "3.6"),
    ([0x42, 0x0D, 0x0D, 0x0A], "3.7"),
    ([0x55, 0x0D, 0x0D, 0x0A], "3.8"),
    ([0x61, 0x0D, 0x0D, 0x0A], "3.9"),
    ([0x6F, 0x0D, 0x0D, 0x0A], "3.10"),
    ([0xA7, 0x0D, 0x0D, 0x0A], "3.11"),
    ([0xCB, 0x0D, 0x0D, 0x0A], "3.12"),
    ([0xF3, 0x0D, 0x0D, 0x0A], "3.13"),
];

/// Python version string for a magic number, if known.
///
/// Accepts 2 to 4 leading bytes; shorter input matches on the prefix only.
pub fn lookup_version(magic: &[u8]) -> Option<&'static str> {
    if magic.len() < 2 {
        return None;
    }
    let n = magic.len().min(4);
    MAGIC_NUMBERS
        .iter()
        .find(|(m, _)| m[..n] == magic[..n])
        .map(|(_, v)| *v)
}

/// Canonical magic number for a major.minor version
pub fn magic_for_version(version: PythonVersion) -> Option<[u8; 4]> {
    let wanted = version.to_string();
    MAGIC_NUMBERS
        .iter()
        .find(|(_, v)| *v == wanted)
        .map(|(m, _)| *m)
}

/// Whether a payload already begins with a pyc header
pub fn has_pyc_header(data: &[u8]) -> bool {
    data.len() >= 4 && &data[2..4] == PYC_HEADER_MARKER
}

/// Length of the pyc header for `version`, magic included
pub fn header_len(version: PythonVersion) -> usize {
    if version >= PythonVersion::new(3, 7) {
        16
    } else if version >= PythonVersion::new(3, 3) {
        12
    } else {
        8
    }
}

/// Header to prepend to a bare payload.
///
/// The first four bytes are the magic, or zeros while it is still unknown.
/// The rest is zero filler: flags and mtime/size fields depending on version.
pub fn bare_header(magic: Option<[u8; 4]>, version: PythonVersion) -> Vec<u8> {
    let mut header = vec![0u8; header_len(version)];
    if let Some(m) = magic {
        header[..4].copy_from_slice(&m);
    }
    header
}

/// Hex rendering used in status lines, e.g. `55 0D 0D 0A`
pub fn format_magic(magic: &[u8]) -> String {
    magic
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_and_unknown() {
        assert_eq!(lookup_version(&[0x55, 0x0D, 0x0D, 0x0A]), Some("3.8"));
        assert_eq!(lookup_version(&[0x03, 0xF3, 0x0D, 0x0A, 0xFF]), Some("2.7"));
        assert_eq!(lookup_version(&[0xF3, 0x0D]), Some("3.13"));
        assert_eq!(lookup_version(&[0x00, 0x00, 0x00, 0x00]), None);
        assert_eq!(lookup_version(&[0x55]), None);
    }

    #[test]
    fn version_to_magic() {
        assert_eq!(
            magic_for_version(PythonVersion::new(3, 8)),
            Some([0x55, 0x0D, 0x0D, 0x0A])
        );
        assert_eq!(
            magic_for_version(PythonVersion::new(3, 5)),
            Some([0x16, 0x0D, 0x0D, 0x0A])
        );
        assert_eq!(magic_for_version(PythonVersion::new(4, 2)), None);
    }

    #[test]
    fn header_lengths_by_version() {
        assert_eq!(header_len(PythonVersion::new(2, 7)), 8);
        assert_eq!(header_len(PythonVersion::new(3, 2)), 8);
        assert_eq!(header_len(PythonVersion::new(3, 3)), 12);
        assert_eq!(header_len(PythonVersion::new(3, 6)), 12);
        assert_eq!(header_len(PythonVersion::new(3, 7)), 16);
        assert_eq!(header_len(PythonVersion::new(3, 12)), 16);
    }

    #[test]
    fn bare_header_for_38() {
        let magic = magic_for_version(PythonVersion::new(3, 8));
        let header = bare_header(magic, PythonVersion::new(3, 8));
        assert_eq!(header.len(), 16);
        assert_eq!(&header[..4], &[0x55, 0x0D, 0x0D, 0x0A]);
        assert!(header[4..].iter().all(|&b| b == 0));

        let placeholder = bare_header(None, PythonVersion::new(3, 8));
        assert_eq!(placeholder, vec![0u8; 16]);
    }

    #[test]
    fn header_marker_detection() {
        assert!(has_pyc_header(&[0x55, 0x0D, 0x0D, 0x0A, 0, 0]));
        assert!(!has_pyc_header(&[0xE3, 0, 0, 0, 0]));
        assert!(!has_pyc_header(b"\r\n"));
        assert_eq!(format_magic(&[0x55, 0x0D, 0x0D, 0x0A]), "55 0D 0D 0A");
    }
}
