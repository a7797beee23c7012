//! Main entry point for the pyxtract CLI application.
//!
//! This binary extracts PyInstaller executables read from the local
//! filesystem or from HTTP URLs.

use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;

use pyxtract::pyinst::{default_output_dir, glob_match, magic};
use pyxtract::{
    Cli, ExtractOptions, ExtractionReport, Extractor, HttpRangeReader, LocalFileReader, ReadAt,
    Status, TocEntry,
};

/// Application entry point.
///
/// Parses command-line arguments and dispatches to the appropriate handler
/// based on whether the input is a local file or HTTP URL.
#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if cli.is_http_url() {
        let reader = HttpRangeReader::new(cli.file.clone()).await?;
        let transferred_before = reader.transferred_bytes();
        // URL inputs extract into the working directory
        let default_dir = PathBuf::from(format!("{}_extracted", reader.file_name()));
        let reader = Arc::new(reader);

        process_archive(reader.clone(), &cli, default_dir).await?;

        if !cli.is_quiet() {
            let transferred = reader.transferred_bytes() - transferred_before;
            eprintln!("\nTotal bytes transferred: {}", format_size(transferred));
        }
    } else {
        let path = Path::new(&cli.file);
        let reader = Arc::new(LocalFileReader::new(path)?);
        process_archive(reader, &cli, default_output_dir(path)).await?;
    }

    Ok(())
}

/// Run the mode selected on the command line against one input.
async fn process_archive<R: ReadAt + 'static>(
    reader: Arc<R>,
    cli: &Cli,
    default_dir: PathBuf,
) -> Result<()> {
    if cli.identify {
        return identify(reader.as_ref()).await;
    }

    let status = if cli.is_quiet() {
        Status::silent()
    } else {
        Status::new(|line| println!("{}", line))
    };
    status.info(format!("Processing {}", cli.file));

    let cancel = Arc::new(AtomicBool::new(false));
    let mut options = ExtractOptions::default()
        .assume_magic_from_version(cli.assume_magic)
        .cancel_flag(cancel.clone());
    for pattern in &cli.exclude {
        options = options.exclude(pattern.clone());
    }

    let extractor = Extractor::open(reader)
        .await?
        .with_options(options)
        .with_status(status);

    if cli.list || cli.verbose {
        return list_entries(&extractor, cli.verbose).await;
    }
    if cli.pipe {
        return pipe_entries(&extractor, &cli.entries).await;
    }

    // Stop between entries on Ctrl-C; pending headers still get patched
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.store(true, Ordering::Relaxed);
        }
    });

    let root = cli
        .extract_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or(default_dir);
    let report = extractor.extract_all(&root).await?;

    if !cli.is_very_quiet() {
        print_summary(&report);
    }

    Ok(())
}

/// Report the Python version whose magic starts the file.
async fn identify<R: ReadAt + ?Sized>(reader: &R) -> Result<()> {
    let mut head = [0u8; 4];
    let n = reader.read_at(0, &mut head).await?;
    let head = &head[..n];

    match magic::lookup_version(head) {
        Some(version) => println!("{}: Python {}", magic::format_magic(head), version),
        None => println!("{}: unknown magic", magic::format_magic(head)),
    }
    Ok(())
}

/// List TOC entries.
///
/// - Simple format (`-l`): entry names, one per line
/// - Verbose format (`-v`): sizes, compression ratio and type tag
async fn list_entries<R: ReadAt + 'static>(extractor: &Extractor<R>, verbose: bool) -> Result<()> {
    let entries = extractor.list_files().await?;

    if verbose {
        let info = extractor.parser().info();
        println!(
            "PyInstaller {} archive, Python {}",
            info.cookie.variant,
            info.python_version()
        );
        println!(
            "{:>10}  {:>10}  {:>5}  {:>4}  Name",
            "Length", "Size", "Cmpr", "Type"
        );
        println!("{}", "-".repeat(60));
    }

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;

    for entry in &entries {
        if verbose {
            println!(
                "{:>10}  {:>10}  {}  {:>4}  {}",
                entry.uncompressed_size,
                entry.compressed_size,
                ratio(entry.compressed_size, entry.uncompressed_size),
                entry.type_tag as char,
                entry.name
            );
            total_uncompressed += entry.uncompressed_size;
            total_compressed += entry.compressed_size;
        } else {
            println!("{}", entry.name);
        }
    }

    if verbose {
        println!("{}", "-".repeat(60));
        println!(
            "{:>10}  {:>10}  {}  {:>4}  {} entries",
            total_uncompressed,
            total_compressed,
            ratio(total_compressed, total_uncompressed),
            "",
            entries.len()
        );
    }

    Ok(())
}

/// Write the decoded payload of the selected entries to stdout.
///
/// With more than one match each payload is preceded by a `--- name ---` marker.
async fn pipe_entries<R: ReadAt + 'static>(extractor: &Extractor<R>, wanted: &[String]) -> Result<()> {
    let entries = extractor.list_files().await?;
    let selected: Vec<&TocEntry> = entries
        .iter()
        .filter(|e| wanted.is_empty() || wanted.iter().any(|w| matches_entry(w, &e.name)))
        .collect();

    let mut stdout = tokio::io::stdout();
    let show_names = selected.len() > 1;
    for entry in selected {
        if show_names {
            stdout
                .write_all(format!("--- {} ---\n", entry.name).as_bytes())
                .await?;
        }
        let data = extractor.extract_to_memory(entry).await?;
        stdout.write_all(&data).await?;
    }
    stdout.flush().await?;
    Ok(())
}

/// Exact name, base name, or glob pattern when the argument has wildcards.
fn matches_entry(wanted: &str, name: &str) -> bool {
    if wanted.contains('*') || wanted.contains('?') {
        return glob_match(wanted, name);
    }
    let basename = name.rsplit(['/', '\\']).next().unwrap_or(name);
    name == wanted || basename == wanted
}

fn print_summary(report: &ExtractionReport) {
    let modules: usize = report.stores.iter().map(|s| s.extracted).sum();
    eprintln!(
        "\n{} of {} entries extracted, {} skipped, {} PYZ modules",
        report.extracted, report.total, report.skipped, modules
    );

    let encrypted = report.encrypted_files().count();
    if encrypted > 0 {
        eprintln!("{} encrypted modules left as .encrypted files", encrypted);
    }
    if !report.unresolved_headers.is_empty() {
        eprintln!(
            "{} files still carry a zero magic; rerun with --assume-magic to fill it in",
            report.unresolved_headers.len()
        );
    }
    for failure in report
        .failures
        .iter()
        .chain(report.stores.iter().flat_map(|s| s.failures.iter()))
    {
        eprintln!("  failed: {}", failure);
    }
    if report.cancelled {
        eprintln!("Extraction was cancelled before all entries were written");
    }
}

/// Share of the original size saved by compression, as `" NN%"`.
fn ratio(compressed: u64, uncompressed: u64) -> String {
    if uncompressed > 0 && compressed <= uncompressed {
        format!("{:>4}%", 100 - (compressed * 100 / uncompressed))
    } else {
        "  0%".to_string()
    }
}

/// Format a byte size into a human-readable string.
///
/// ```ignore
/// assert_eq!(format_size(500), "500 bytes");
/// assert_eq!(format_size(1536), "1.50 KB");
/// ```
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
