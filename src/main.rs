mod config;
mod drive;
mod executor;
mod filter;
mod icloud;
mod lock;
mod reconcile;
mod replica;
mod scanner;
mod scheduler;
mod secrets;
mod snapshot;
mod suppress;
mod watcher;

use std::{
    fs,
    io::{self, BufRead, Write as _},
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Cli;
use drive::DriveClient;
use executor::{Executor, ExecutorOptions};
use replica::{Replica, SharedReplica};
use scheduler::{Scheduler, SchedulerConfig};
use suppress::SuppressionSet;
use watcher::{Debouncer, LocalWatcher};

/// Extra time past the debounce window during which executor-initiated
/// paths stay suppressed, to swallow trailing echo events.
const QUIESCENCE_MARGIN: Duration = Duration::from_secs(2);

const EXIT_FATAL: u8 = 1;
const EXIT_AUTH: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let message = format!("{err:#}");
            error!(error = %message, "exiting");
            ExitCode::from(if message.contains("authentication") {
                EXIT_AUTH
            } else {
                EXIT_FATAL
            })
        }
    }
}

fn init_logging(cli: &Cli) {
    let directive = cli
        .logging_config
        .as_ref()
        .and_then(|path| fs::read_to_string(path).ok())
        .and_then(|contents| {
            contents
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
        });

    let filter = match directive {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(cli: Cli) -> Result<()> {
    cli.validate()?;
    let filter = Arc::new(cli.build_filter()?);

    let root = cli
        .directory
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", cli.directory.display()))?;

    // Single instance per sync root, held until exit.
    let _lock = lock::acquire(&root)?;

    let password = resolve_password(&cli)?;
    let cookie_dir = cli.cookie_directory();
    let client: Arc<dyn DriveClient> = Arc::new(
        icloud::WebDrive::connect(&cli.username, &password, &cookie_dir)
            .context("authentication failed")?,
    );

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            cancel.store(true, Ordering::SeqCst);
        })
        .context("failed to install shutdown handler")?;
    }

    let debounce = Duration::from_secs(cli.debounce_period);
    let local = SharedReplica::new(Replica::new());
    let remote = SharedReplica::new(Replica::new());
    let suppression = SuppressionSet::new();

    let executor = Executor::new(
        client.clone(),
        root.clone(),
        local.clone(),
        remote.clone(),
        suppression.clone(),
        cancel.clone(),
        ExecutorOptions {
            max_workers: cli.max_workers,
            quiescence: debounce + QUIESCENCE_MARGIN,
            ..ExecutorOptions::default()
        },
    );

    let local_watcher = LocalWatcher::start(&root)?;
    let debouncer = Debouncer::new(debounce, suppression.clone());
    let snapshots = snapshot::SnapshotWriter::new(&cookie_dir.join("state"))?;

    let mut scheduler = Scheduler::new(
        client,
        root.clone(),
        filter,
        local,
        remote,
        executor,
        local_watcher,
        debouncer,
        snapshots,
        cancel.clone(),
        SchedulerConfig {
            check_period: Duration::from_secs(cli.icloud_check_period),
            refresh_period: Duration::from_secs(cli.icloud_refresh_period),
            debounce,
            max_workers: cli.max_workers,
        },
    );

    info!(root = %root.display(), "starting sync");
    scheduler.initial_sync()?;
    scheduler.run()?;
    info!("clean shutdown");
    Ok(())
}

/// Password resolution order: flag, keyring, interactive prompt. A
/// prompted password is stored back into the keyring for next time.
fn resolve_password(cli: &Cli) -> Result<String> {
    if let Some(password) = &cli.password {
        return Ok(password.clone());
    }
    match secrets::load(&cli.username) {
        Ok(Some(password)) => return Ok(password),
        Ok(None) => {}
        Err(err) => warn!(error = %format!("{err:#}"), "keyring unavailable"),
    }

    eprint!("Password for {}: ", cli.username);
    io::stderr().flush().ok();
    let mut password = String::new();
    io::stdin()
        .lock()
        .read_line(&mut password)
        .context("failed to read password")?;
    let password = password.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("no password provided");
    }
    if let Err(err) = secrets::store(&cli.username, &password) {
        warn!(error = %format!("{err:#}"), "could not store password in keyring");
    }
    Ok(password)
}
