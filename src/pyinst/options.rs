use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Knobs for an extraction run
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Output directory; defaults to `<input>_extracted` beside the input
    pub output_dir: Option<PathBuf>,
    /// Glob patterns (`*`, `?`) of TOC names to skip
    pub exclude: Vec<String>,
    /// Emit a progress line every this many entries
    pub progress_every: usize,
    /// Progress interval inside PYZ stores
    pub store_progress_every: usize,
    /// When no magic is ever found, take it from the table for the cookie's
    /// Python version instead of leaving zero placeholders
    pub assume_magic_from_version: bool,
    /// Checked between entries; set it to stop the run early
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            output_dir: None,
            exclude: Vec::new(),
            progress_every: 10,
            store_progress_every: 20,
            assume_magic_from_version: false,
            cancel: None,
        }
    }
}

impl ExtractOptions {
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    pub fn progress_every(mut self, n: usize) -> Self {
        self.progress_every = n.max(1);
        self
    }

    pub fn assume_magic_from_version(mut self, yes: bool) -> Self {
        self.assume_magic_from_version = yes;
        self
    }

    pub fn cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|f| f.load(Ordering::Relaxed))
    }

    /// Whether a TOC name matches one of the exclusion patterns
    pub fn is_excluded(&self, name: &str) -> bool {
        self.exclude
            .iter()
            .any(|x| name == x || glob_match(x, name))
    }
}

/// Glob matching with `*` (any run) and `?` (any one char)
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    // Iterative with single-star backtracking
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                star = Some((p, t));
                p += 1;
            }
            Some('?') => {
                p += 1;
                t += 1;
            }
            Some(c) if *c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    p = sp + 1;
                    t = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}
