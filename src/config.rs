use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use clap::builder::TypedValueParser;

use crate::filter::{self, PathFilter};

/// Continuously mirror a local directory against an iCloud Drive
/// account.
#[derive(Parser, Debug)]
#[command(name = "icloud-sync", version, about)]
pub struct Cli {
    /// Local directory to keep in sync (the sync root)
    #[arg(long)]
    pub directory: PathBuf,

    /// iCloud account id
    #[arg(long)]
    pub username: String,

    /// Account password; taken from the keyring or prompted when absent
    #[arg(long)]
    pub password: Option<String>,

    /// Directory holding the persistent authentication cookies
    #[arg(long)]
    pub cookie_directory: Option<PathBuf>,

    /// File with one ignore regex per line ('#' comments allowed)
    #[arg(long)]
    pub ignore_regexes: Option<PathBuf>,

    /// File with one include regex per line ('#' comments allowed)
    #[arg(long)]
    pub include_regexes: Option<PathBuf>,

    /// Seconds between cheap remote change-checks
    #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u64).range(20..))]
    pub icloud_check_period: u64,

    /// Seconds between unconditional full remote refreshes
    #[arg(long, default_value_t = 90, value_parser = clap::value_parser!(u64).range(90..))]
    pub icloud_refresh_period: u64,

    /// Seconds of per-path silence before watcher events are released
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(10..))]
    pub debounce_period: u64,

    /// Width of the worker pool for remote reads and local work
    #[arg(long, default_value_t = 32, value_parser = clap::value_parser!(u64).range(1..).map(|v| v as usize))]
    pub max_workers: usize,

    /// File whose first directive line configures the log filter
    #[arg(long)]
    pub logging_config: Option<PathBuf>,
}

impl Cli {
    pub fn validate(&self) -> Result<()> {
        if !self.directory.is_dir() {
            bail!(
                "sync directory {} does not exist or is not a directory",
                self.directory.display()
            );
        }
        Ok(())
    }

    pub fn cookie_directory(&self) -> PathBuf {
        match &self.cookie_directory {
            Some(dir) => dir.clone(),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".pyicloud"),
        }
    }

    pub fn build_filter(&self) -> Result<PathFilter> {
        let ignore = match &self.ignore_regexes {
            Some(path) => filter::load_patterns(path)
                .with_context(|| format!("ignore list {}", path.display()))?,
            None => Vec::new(),
        };
        let include = match &self.include_regexes {
            Some(path) => filter::load_patterns(path)
                .with_context(|| format!("include list {}", path.display()))?,
            None => Vec::new(),
        };
        PathFilter::new(&ignore, &include)
    }
}
