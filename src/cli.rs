use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{BrowserProfile, Config};

/// Watches the university portal and pushes a message when a grade appears or changes.
#[derive(Debug, Parser)]
#[command(name = "gradewatch", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Args)]
pub struct GlobalArgs {
    /// Browser profile presented to the portal.
    #[arg(long, global = true, value_enum)]
    pub browser: Option<BrowserProfile>,

    /// Seconds to wait after each page load.
    #[arg(long, global = true, value_name = "SECS")]
    pub wait: Option<u64>,

    /// Where `print` stores the transcript.
    #[arg(long, global = true, value_name = "DIR")]
    pub download_dir: Option<PathBuf>,

    /// Directory for the saved session, grades and log.
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Show the current grades.
    Show,
    /// Save the current grades to a .csv, .xlsx or .json file.
    Save {
        path: PathBuf,
    },
    /// Download the transcript PDF.
    Print,
    /// Forget the saved login session.
    Reset,
    /// Check for new grades periodically.
    Monitor(MonitorArgs),
}

#[derive(Debug, Clone, Args)]
pub struct MonitorArgs {
    /// Run a single check and exit.
    #[arg(long)]
    pub once: bool,

    /// Minutes between checks (defaults to CHECK_INTERVAL, then 30).
    #[arg(long, value_name = "MIN", value_parser = clap::value_parser!(u64).range(1..))]
    pub interval: Option<u64>,

    /// Ask for a login on this terminal when the saved session expired.
    #[arg(long)]
    pub interactive: bool,
}

impl GlobalArgs {
    /// Flags win over the environment.
    pub fn apply(&self, config: &mut Config) {
        if let Some(browser) = self.browser {
            config.portal.browser = browser;
        }
        if let Some(wait) = self.wait {
            config.portal.settle = std::time::Duration::from_secs(wait);
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
    }
}
