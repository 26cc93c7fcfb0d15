mod auth;
mod cli;
mod config;
mod diff;
mod error;
mod models;
mod monitor;
mod notifier;
mod repository;
mod session_store;
mod utils;

use std::fs::OpenOptions;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use log::{error, info, warn};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};

use crate::auth::{AuthSettings, Authenticator, LoginPrompt, StdinPrompt, UnattendedPrompt};
use crate::cli::{Cli, Commands, GlobalArgs, MonitorArgs};
use crate::config::{check_interval, Config, StorePolicy};
use crate::models::GradeSnapshot;
use crate::monitor::{CycleOutcome, Monitor};
use crate::notifier::NotifierSet;
use crate::repository::{HistoryLogRepository, LatestFileRepository, SnapshotRepository};
use crate::session_store::SessionStore;
use crate::utils::portal::{HttpPortal, Portal};
use crate::utils::{export, table};

#[tokio::main]
async fn main() {
    // Loads environment variables from a `.env` file, if present.
    dotenv().ok();
    let cli = Cli::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e:#}");
            std::process::exit(2);
        }
    };
    cli.global.apply(&mut config);
    init_logging(&config, cli.global.verbose);

    if let Err(e) = run(cli.command, &cli.global, config).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

/// Terminal plus `<data-dir>/gradewatch.log`. Other crates' records are filtered out.
fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    let log_config = ConfigBuilder::new()
        .add_filter_allow_str(env!("CARGO_PKG_NAME"))
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        log_config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];

    let log_path = config.log_path();
    let file = std::fs::create_dir_all(&config.data_dir).and_then(|()| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
    });
    let file_error = match file {
        Ok(file) => {
            loggers.push(WriteLogger::new(level, log_config, file));
            None
        }
        Err(e) => Some(e),
    };

    if let Err(e) = CombinedLogger::init(loggers) {
        eprintln!("Failed to initialise logging: {e}");
    }
    if let Some(e) = file_error {
        warn!("Logging to the terminal only, {} is not writable: {}", log_path.display(), e);
    }
}

async fn run(command: Commands, global: &GlobalArgs, config: Config) -> Result<()> {
    match command {
        Commands::Show => {
            let snapshot = fetch_once(&config).await?;
            print_snapshot(&snapshot);
        }
        Commands::Save { path } => {
            let snapshot = fetch_once(&config).await?;
            export::save(&snapshot, &path)?;
            println!("Saved {} grade(s) to {}", snapshot.len(), path.display());
        }
        Commands::Print => {
            let dir = match &global.download_dir {
                Some(dir) => dir.clone(),
                None => std::env::current_dir().context("Failed to resolve the current directory")?,
            };
            std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
            let mut portal = connect(&config, &mut StdinPrompt).await?;
            let path = portal
                .download_transcript(&dir)
                .await
                .context("Failed to download the transcript")?;
            println!("Transcript saved to {}", path.display());
        }
        Commands::Reset => {
            let store = SessionStore::new(config.credential_path());
            if store.clear().context("Failed to remove the saved session")? {
                println!("Removed {}, the next run will ask for a login", store.path().display());
            } else {
                println!("No saved session to remove");
            }
        }
        Commands::Monitor(args) => monitor(&config, args).await?,
    }
    Ok(())
}

fn authenticator(config: &Config) -> Authenticator {
    Authenticator::new(
        SessionStore::new(config.credential_path()),
        AuthSettings {
            poll_interval: config.poll_interval,
            login_timeout: config.login_timeout,
            ..AuthSettings::default()
        },
    )
}

async fn connect(config: &Config, prompt: &mut dyn LoginPrompt) -> Result<HttpPortal> {
    let mut portal = HttpPortal::new(config.portal.clone()).context("Failed to build the HTTP client")?;
    authenticator(config)
        .ensure_session(&mut portal, prompt)
        .await
        .context("Could not log in to the portal")?;
    Ok(portal)
}

/// Reads the grades without touching the monitor's baseline.
async fn fetch_once(config: &Config) -> Result<GradeSnapshot> {
    let mut portal = connect(config, &mut StdinPrompt).await?;
    let snapshot = portal.fetch_grades().await.context("Failed to read the grades")?;
    info!("Fetched {} grade(s)", snapshot.len());
    Ok(snapshot)
}

fn print_snapshot(snapshot: &GradeSnapshot) {
    if snapshot.is_empty() {
        println!("No grades published yet");
        return;
    }
    println!("{}", table::render(snapshot));
    println!();
    println!("加权平均分: {:.2}", diff::weighted_average(snapshot));
    for line in snapshot.summary() {
        println!("{line}");
    }
}

fn repository(config: &Config) -> Box<dyn SnapshotRepository> {
    match config.store_policy {
        StorePolicy::Latest => Box::new(LatestFileRepository::new(config.grades_path())),
        StorePolicy::History => Box::new(HistoryLogRepository::new(config.grades_path())),
    }
}

async fn monitor(config: &Config, args: MonitorArgs) -> Result<()> {
    let notifier = NotifierSet::from_config(config)?;
    info!("Notifying via {}", notifier.names().join(", "));

    let portal = HttpPortal::new(config.portal.clone()).context("Failed to build the HTTP client")?;
    let prompt: Box<dyn LoginPrompt> = if args.interactive {
        Box::new(StdinPrompt)
    } else {
        Box::new(UnattendedPrompt)
    };

    let mut monitor = Monitor::new(
        authenticator(config),
        Box::new(portal),
        prompt,
        repository(config),
        Box::new(notifier),
    );

    if args.once {
        return match monitor.run_cycle().await {
            CycleOutcome::Skipped(e) => Err(e).context("Check failed"),
            _ => Ok(()),
        };
    }

    let interval = match args.interval {
        Some(minutes) => check_interval(minutes).context("--interval")?,
        None => config.check_interval,
    };
    monitor.run_forever(interval, config.jitter).await;
    Ok(())
}
