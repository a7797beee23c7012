//! Hand-off to an external decryption stage.
//!
//! Modules of an encrypted PYZ store are left on disk as `*.pyc.encrypted`.
//! Each such file is a 16-byte IV followed by ciphertext; the plaintext is a
//! zlib stream of the bare module. The cipher itself is supplied by the
//! caller through [`StreamDecryptor`].

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use anyhow::{Context, Result, bail};

use super::magic::{bare_header, magic_for_version};
use super::parser::inflate;
use super::pyz::ENCRYPTED_SUFFIX;
use super::report::{ExtractionReport, Failure};
use super::structures::PythonVersion;

pub const CRYPT_BLOCK_SIZE: usize = 16;

/// A symmetric cipher supplied by the caller
pub trait StreamDecryptor {
    fn decrypt(&self, ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Debug, Default)]
pub struct DecryptReport {
    pub decrypted: Vec<PathBuf>,
    pub failures: Vec<Failure>,
}

/// Decrypt every `.encrypted` file a run produced, writing `<name>.pyc` next to it
pub async fn decrypt_artifacts<D: StreamDecryptor>(
    report: &ExtractionReport,
    key: &[u8],
    decryptor: &D,
) -> DecryptReport {
    let magic = report
        .magic
        .or_else(|| magic_for_version(report.python_version));
    decrypt_files(
        report.encrypted_files().map(PathBuf::as_path),
        key,
        decryptor,
        magic,
        report.python_version,
    )
    .await
}

pub async fn decrypt_files<'a, D: StreamDecryptor>(
    files: impl IntoIterator<Item = &'a Path>,
    key: &[u8],
    decryptor: &D,
    magic: Option<[u8; 4]>,
    version: PythonVersion,
) -> DecryptReport {
    let mut out = DecryptReport::default();
    for file in files {
        match decrypt_one(file, key, decryptor, magic, version).await {
            Ok(path) => out.decrypted.push(path),
            Err(e) => out
                .failures
                .push(Failure::new(file.display().to_string(), format!("{:#}", e))),
        }
    }
    out
}

async fn decrypt_one<D: StreamDecryptor>(
    file: &Path,
    key: &[u8],
    decryptor: &D,
    magic: Option<[u8; 4]>,
    version: PythonVersion,
) -> Result<PathBuf> {
    let target = decrypted_path(file)?;
    let data = fs::read(file).await?;
    if data.len() < CRYPT_BLOCK_SIZE {
        bail!("shorter than the {} byte IV", CRYPT_BLOCK_SIZE);
    }
    let (iv, ciphertext) = data.split_at(CRYPT_BLOCK_SIZE);

    let plaintext = decryptor.decrypt(ciphertext, key, iv)?;
    let code = inflate(&plaintext).context("decrypted data is not a zlib stream; wrong key?")?;

    let mut out = fs::File::create(&target).await?;
    out.write_all(&bare_header(magic, version)).await?;
    out.write_all(&code).await?;
    out.flush().await?;
    Ok(target)
}

/// `a/b.pyc.encrypted` -> `a/b.pyc`
fn decrypted_path(file: &Path) -> Result<PathBuf> {
    let name = file.to_string_lossy();
    match name.strip_suffix(&format!(".{}", ENCRYPTED_SUFFIX)) {
        Some(stem) => Ok(PathBuf::from(stem)),
        None => bail!("not an .{} file", ENCRYPTED_SUFFIX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    /// XOR with key and IV; stands in for the real cipher
    struct XorDecryptor;

    impl StreamDecryptor for XorDecryptor {
        fn decrypt(&self, ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
            Ok(ciphertext
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ key[i % key.len()] ^ iv[i % iv.len()])
                .collect())
        }
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[tokio::test]
    async fn decrypts_sentinel_files() {
        let dir = tempfile::tempdir().unwrap();
        let key = b"0123456789abcdef";
        let iv = [7u8; CRYPT_BLOCK_SIZE];

        let plain = zlib(b"module code");
        let mut file = iv.to_vec();
        file.extend(XorDecryptor.decrypt(&plain, key, &iv).unwrap());
        let enc_path = dir.path().join("mod.pyc.encrypted");
        std::fs::write(&enc_path, &file).unwrap();

        let short_path = dir.path().join("short.pyc.encrypted");
        std::fs::write(&short_path, b"tiny").unwrap();

        let magic = Some([0x55, 0x0D, 0x0D, 0x0A]);
        let report = decrypt_files(
            [enc_path.as_path(), short_path.as_path()],
            key,
            &XorDecryptor,
            magic,
            PythonVersion::new(3, 8),
        )
        .await;

        assert_eq!(report.decrypted, vec![dir.path().join("mod.pyc")]);
        assert_eq!(report.failures.len(), 1);

        let out = std::fs::read(dir.path().join("mod.pyc")).unwrap();
        assert_eq!(&out[..4], &[0x55, 0x0D, 0x0D, 0x0A]);
        assert_eq!(&out[16..], b"module code");
    }

    #[tokio::test]
    async fn wrong_key_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let iv = [1u8; CRYPT_BLOCK_SIZE];
        let mut file = iv.to_vec();
        file.extend(XorDecryptor.decrypt(&zlib(b"x"), b"right key", &iv).unwrap());
        let path = dir.path().join("m.pyc.encrypted");
        std::fs::write(&path, &file).unwrap();

        let report = decrypt_files(
            [path.as_path()],
            b"wrong key",
            &XorDecryptor,
            None,
            PythonVersion::new(3, 8),
        )
        .await;
        assert!(report.decrypted.is_empty());
        assert!(report.failures[0].reason.contains("wrong key"));
    }

    #[test]
    fn sentinel_names() {
        assert_eq!(
            decrypted_path(Path::new("a/b.pyc.encrypted")).unwrap(),
            Path::new("a/b.pyc")
        );
        assert!(decrypted_path(Path::new("a/b.pyc")).is_err());
    }
}
