//! Line-oriented status events.
//!
//! Extraction reports what it is doing through a single-argument callback
//! receiving one line of text. Lines starting with `[+]` are progress or
//! information; lines starting with `[!]` are warnings or errors. Progress
//! percentages are embedded in the text as `(NN%)` and can be recovered with
//! [`parse_percentage`].

use std::fmt::Display;

/// Callback receiving one status line at a time
pub type StatusCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Marker for progress and informational lines
pub const INFO_MARKER: &str = "[+]";
/// Marker for warnings and per-entry errors
pub const WARN_MARKER: &str = "[!]";

/// Passive sink for status lines. Invoked in-line with extraction.
#[derive(Default)]
pub struct Status {
    callback: Option<StatusCallback>,
}

impl Status {
    pub fn new(callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    /// A sink that drops everything
    pub fn silent() -> Self {
        Self { callback: None }
    }

    fn emit(&self, line: String) {
        log::trace!("{}", line);
        if let Some(cb) = &self.callback {
            cb(&line);
        }
    }

    pub fn info(&self, msg: impl Display) {
        self.emit(format!("{} {}", INFO_MARKER, msg));
    }

    pub fn warn(&self, msg: impl Display) {
        self.emit(format!("{} Warning: {}", WARN_MARKER, msg));
    }

    pub fn error(&self, msg: impl Display) {
        self.emit(format!("{} Error: {}", WARN_MARKER, msg));
    }

    /// Emit `[+] label: done/total (NN%)`
    pub fn progress(&self, label: &str, done: usize, total: usize) {
        let pct = if total == 0 { 100 } else { done * 100 / total };
        self.emit(format!(
            "{} {}: {}/{} ({}%)",
            INFO_MARKER, label, done, total, pct
        ));
    }
}

/// Whether a status line is a progress/info line
pub fn is_info(line: &str) -> bool {
    line.starts_with(INFO_MARKER)
}

/// Pull the `NN` out of the last `(NN%)` in a status line
pub fn parse_percentage(line: &str) -> Option<u8> {
    let end = line.rfind("%)")?;
    let start = line[..end].rfind('(')? + 1;
    line[start..end].trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn capture() -> (Status, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let status = Status::new(move |l| sink.lock().unwrap().push(l.to_string()));
        (status, lines)
    }

    #[test]
    fn markers_and_progress() {
        let (status, lines) = capture();
        status.info("Processing app.exe");
        status.warn("odd name");
        status.progress("Extracting files", 3, 4);

        let lines = lines.lock().unwrap();
        assert_eq!(lines[0], "[+] Processing app.exe");
        assert!(is_info(&lines[0]));
        assert_eq!(lines[1], "[!] Warning: odd name");
        assert!(!is_info(&lines[1]));
        assert_eq!(lines[2], "[+] Extracting files: 3/4 (75%)");
        assert_eq!(parse_percentage(&lines[2]), Some(75));
    }

    #[test]
    fn percentage_absent_or_garbled() {
        assert_eq!(parse_percentage("[+] Found 12 files in CArchive"), None);
        assert_eq!(parse_percentage("[+] weird (abc%)"), None);
        assert_eq!(parse_percentage("[+] done (100%)"), Some(100));
    }

    #[test]
    fn silent_sink_does_nothing() {
        Status::silent().error("nobody hears this");
    }
}
