//! Builders for synthetic PyInstaller executables.

#![allow(dead_code)]

use flate2::Compression;
use flate2::write::ZlibEncoder;
use std::io::Write;
use std::sync::{Arc, Mutex};

use pyxtract::Status;

pub const COOKIE_MAGIC: &[u8; 8] = b"MEI\x0c\x0b\x0a\x0b\x0e";
pub const MAGIC_27: [u8; 4] = [0x03, 0xF3, 0x0D, 0x0A];
pub const MAGIC_37: [u8; 4] = [0x42, 0x0D, 0x0D, 0x0A];
pub const MAGIC_38: [u8; 4] = [0x55, 0x0D, 0x0D, 0x0A];

pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// A module payload that carries its own 16-byte pyc header
pub fn headered_pyc(magic: [u8; 4], code: &[u8]) -> Vec<u8> {
    let mut out = magic.to_vec();
    out.extend_from_slice(&[0u8; 12]);
    out.extend_from_slice(code);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// 24-byte cookie
    V20,
    /// 88-byte cookie with the Python library name
    V21,
}

pub struct Entry {
    pub name: Vec<u8>,
    pub tag: u8,
    pub data: Vec<u8>,
    pub compress: bool,
    /// Bytes to store instead of the (compressed) data
    pub stored: Option<Vec<u8>>,
    /// Uncompressed size to declare instead of the real one
    pub declared_size: Option<u32>,
}

impl Entry {
    pub fn new(name: &str, tag: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.as_bytes().to_vec(),
            tag,
            data: data.into(),
            compress: true,
            stored: None,
            declared_size: None,
        }
    }

    /// Entry whose stored name is arbitrary bytes
    pub fn with_raw_name(name: &[u8], tag: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.to_vec(),
            ..Self::new("", tag, data)
        }
    }

    pub fn raw(mut self) -> Self {
        self.compress = false;
        self
    }

    pub fn stored_as(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stored = Some(bytes.into());
        self
    }

    pub fn declared_size(mut self, size: u32) -> Self {
        self.declared_size = Some(size);
        self
    }
}

/// Bootloader stub, entries, TOC and cookie, in that order
pub struct ArchiveBuilder {
    pub layout: Layout,
    /// Packed version, `308` for 3.8
    pub pyver: i32,
    pub prefix: Vec<u8>,
    pub trailer: Vec<u8>,
    pub entries: Vec<Entry>,
}

impl ArchiveBuilder {
    pub fn new(layout: Layout, pyver: i32) -> Self {
        Self {
            layout,
            pyver,
            prefix: b"\x7fELF fake bootloader".repeat(64),
            trailer: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn entry(mut self, entry: Entry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Bytes after the cookie, like an appended code signature
    pub fn trailer(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.trailer = bytes.into();
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::new();
        let mut toc = Vec::new();

        for e in &self.entries {
            let stored = match (&e.stored, e.compress) {
                (Some(bytes), _) => bytes.clone(),
                (None, true) => zlib(&e.data),
                (None, false) => e.data.clone(),
            };
            let pos = body.len() as u32;
            body.extend_from_slice(&stored);

            // Name is NUL terminated and padded so records stay 16-byte aligned
            let mut name = e.name.clone();
            name.push(0);
            while (18 + name.len()) % 16 != 0 {
                name.push(0);
            }

            let record_len = (18 + name.len()) as i32;
            toc.extend_from_slice(&record_len.to_be_bytes());
            toc.extend_from_slice(&pos.to_be_bytes());
            toc.extend_from_slice(&(stored.len() as u32).to_be_bytes());
            let declared = e.declared_size.unwrap_or(e.data.len() as u32);
            toc.extend_from_slice(&declared.to_be_bytes());
            toc.push(e.compress as u8);
            toc.push(e.tag);
            toc.extend_from_slice(&name);
        }

        let toc_offset = body.len() as i32;
        let toc_len = toc.len() as i32;
        body.extend_from_slice(&toc);

        let cookie_size = match self.layout {
            Layout::V20 => 24,
            Layout::V21 => 88,
        };
        let package_len = (body.len() + cookie_size) as i32;

        let mut cookie = COOKIE_MAGIC.to_vec();
        cookie.extend_from_slice(&package_len.to_be_bytes());
        cookie.extend_from_slice(&toc_offset.to_be_bytes());
        cookie.extend_from_slice(&toc_len.to_be_bytes());
        cookie.extend_from_slice(&self.pyver.to_be_bytes());
        if self.layout == Layout::V21 {
            let mut lib = format!("libpython{}.{}.so.1.0", self.pyver / 100, self.pyver % 100)
                .into_bytes();
            lib.resize(64, 0);
            cookie.extend_from_slice(&lib);
        }

        let mut out = self.prefix.clone();
        out.extend_from_slice(&body);
        out.extend_from_slice(&cookie);
        out.extend_from_slice(&self.trailer);
        out
    }
}

/// Minimal marshal writer for PYZ tables
pub mod marshal {
    pub fn text(s: &str) -> Vec<u8> {
        let mut out = vec![b'z', s.len() as u8];
        out.extend_from_slice(s.as_bytes());
        out
    }

    pub fn bytes(b: &[u8]) -> Vec<u8> {
        let mut out = vec![b's'];
        out.extend_from_slice(&(b.len() as i32).to_le_bytes());
        out.extend_from_slice(b);
        out
    }

    pub fn int(v: i32) -> Vec<u8> {
        let mut out = vec![b'i'];
        out.extend_from_slice(&v.to_le_bytes());
        out
    }

    pub fn tuple(items: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![b')', items.len() as u8];
        for item in items {
            out.extend_from_slice(item);
        }
        out
    }

    pub fn list(items: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![b'['];
        out.extend_from_slice(&(items.len() as i32).to_le_bytes());
        for item in items {
            out.extend_from_slice(item);
        }
        out
    }

    pub fn dict(pairs: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
        let mut out = vec![b'{'];
        for (k, v) in pairs {
            out.extend_from_slice(k);
            out.extend_from_slice(v);
        }
        out.push(b'0');
        out
    }
}

pub struct PyzModule {
    pub name: String,
    /// Marshalled as a bytes key instead of `name`
    pub raw_name: Option<Vec<u8>>,
    pub is_package: bool,
    /// Bytes stored in the PYZ, normally zlib-compressed code
    pub blob: Vec<u8>,
}

impl PyzModule {
    pub fn new(name: &str, is_package: bool, code: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            raw_name: None,
            is_package,
            blob: zlib(code),
        }
    }

    pub fn with_blob(name: &str, blob: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.to_string(),
            raw_name: None,
            is_package: false,
            blob: blob.into(),
        }
    }

    pub fn with_raw_name(name: &[u8], code: &[u8]) -> Self {
        Self {
            raw_name: Some(name.to_vec()),
            ..Self::new("", false, code)
        }
    }
}

/// `PYZ\0`, magic, TOC offset, module blobs, marshalled table
pub fn pyz(magic: [u8; 4], modules: &[PyzModule], as_list: bool) -> Vec<u8> {
    let mut out = b"PYZ\0".to_vec();
    out.extend_from_slice(&magic);
    out.extend_from_slice(&[0u8; 4]);

    let mut items = Vec::new();
    for m in modules {
        let offset = out.len() as i32;
        out.extend_from_slice(&m.blob);
        let value = marshal::tuple(&[
            marshal::int(m.is_package as i32),
            marshal::int(offset),
            marshal::int(m.blob.len() as i32),
        ]);
        let key = match &m.raw_name {
            Some(raw) => marshal::bytes(raw),
            None => marshal::text(&m.name),
        };
        items.push((key, value));
    }

    let toc_offset = out.len() as i32;
    out[8..12].copy_from_slice(&toc_offset.to_be_bytes());

    let table = if as_list {
        let pairs: Vec<Vec<u8>> = items
            .into_iter()
            .map(|(k, v)| marshal::tuple(&[k, v]))
            .collect();
        marshal::list(&pairs)
    } else {
        marshal::dict(&items)
    };
    out.extend_from_slice(&table);
    out
}

/// Store with a valid header followed directly by `table` as its TOC
pub fn pyz_with_table(magic: [u8; 4], table: &[u8]) -> Vec<u8> {
    let mut out = b"PYZ\0".to_vec();
    out.extend_from_slice(&magic);
    out.extend_from_slice(&12i32.to_be_bytes());
    out.extend_from_slice(table);
    out
}

/// Status that records every line it is given
pub fn recording_status() -> (Status, Arc<Mutex<Vec<String>>>) {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let status = Status::new(move |line| sink.lock().unwrap().push(line.to_string()));
    (status, lines)
}
