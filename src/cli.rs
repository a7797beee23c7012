use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "pyxtract")]
#[command(version)]
#[command(about = "Extract the contents of PyInstaller executables", long_about = None)]
#[command(after_help = "Examples:\n  \
  pyxtract app.exe                  extract everything into app.exe_extracted\n  \
  pyxtract app.exe -x '*.dll'       extract all entries except DLLs\n  \
  pyxtract -p app.exe main | more   send the decoded main script into more\n  \
  pyxtract -l https://example.com/app.exe   list entries of a remote executable")]
pub struct Cli {
    /// Executable path or HTTP URL
    #[arg(value_name = "FILE")]
    pub file: String,

    /// Entries to pipe with -p (default: all)
    #[arg(value_name = "ENTRIES")]
    pub entries: Vec<String>,

    /// List entries (short format)
    #[arg(short = 'l')]
    pub list: bool,

    /// List verbosely with sizes and type tags
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Decode entries to pipe, no messages
    #[arg(short = 'p')]
    pub pipe: bool,

    /// Extract into this directory instead of <FILE>_extracted
    #[arg(short = 'd', value_name = "DIR")]
    pub extract_dir: Option<String>,

    /// Exclude entries matching these patterns
    #[arg(short = 'x', value_name = "PATTERN", num_args = 1..)]
    pub exclude: Vec<String>,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', action = clap::ArgAction::Count)]
    pub quiet: u8,

    /// Use the magic of the archive's Python version when none is found
    #[arg(long = "assume-magic")]
    pub assume_magic: bool,

    /// Treat FILE as a single .pyc and report the version of its magic
    #[arg(long)]
    pub identify: bool,
}

impl Cli {
    pub fn is_http_url(&self) -> bool {
        self.file.starts_with("http://") || self.file.starts_with("https://")
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet > 0 || self.pipe
    }

    pub fn is_very_quiet(&self) -> bool {
        self.quiet > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let cli = Cli::parse_from([
            "pyxtract", "-d", "out", "-x", "*.dll", "*.so", "--", "app.exe",
        ]);
        assert_eq!(cli.file, "app.exe");
        assert_eq!(cli.extract_dir.as_deref(), Some("out"));
        assert_eq!(cli.exclude, vec!["*.dll", "*.so"]);
        assert!(!cli.is_quiet());
    }

    #[test]
    fn pipe_implies_quiet() {
        let cli = Cli::parse_from(["pyxtract", "-p", "app.exe", "main"]);
        assert!(cli.is_quiet());
        assert!(!cli.is_very_quiet());
        assert_eq!(cli.entries, vec!["main"]);
    }

    #[test]
    fn recognises_urls() {
        let cli = Cli::parse_from(["pyxtract", "-l", "https://example.com/app.exe"]);
        assert!(cli.is_http_url());
        let cli = Cli::parse_from(["pyxtract", "-qq", "--assume-magic", "app.exe"]);
        assert!(!cli.is_http_url());
        assert!(cli.is_very_quiet());
        assert!(cli.assume_magic);
    }
}
