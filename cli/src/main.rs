use std::env;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::{self, Command};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use trackfetch_core::config::EngineConfig;
use trackfetch_core::settings::{JsonSettingsStore, SettingKey, SettingsStore};
use trackfetch_core::update::{GitRepository, RestartRequest, UpdateChecker, UpdateOutcome};
use trackfetch_core::{CoreError, DownloadEngine, EngineEvent};

#[derive(Parser, Debug)]
#[command(name = "trackfetch", version, about = "Download tracks, albums and playlists as audio files")]
struct Args {
    /// Settings document (defaults to the platform config dir)
    #[arg(long, global = true, env = "TRACKFETCH_SETTINGS")]
    settings: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download one link and wait for it to finish
    Download {
        link: String,
        /// Overrides and persists downloadPath before starting
        #[arg(long)]
        dest: Option<PathBuf>,
    },
    /// Read links from stdin, one batch at a time
    Shell {
        #[command(flatten)]
        update: UpdateArgs,
        /// Do not run the background update check
        #[arg(long)]
        no_update: bool,
    },
    /// Show or change persisted settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Compare the checkout with its remote and reset when it moved
    UpdateCheck {
        #[command(flatten)]
        update: UpdateArgs,
        /// Check once and exit
        #[arg(long)]
        once: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    Show,
    Get { key: String },
    Set { key: String, value: String },
}

#[derive(clap::Args, Debug, Clone)]
struct UpdateArgs {
    /// Git checkout to keep up to date
    #[arg(long, default_value = ".")]
    repo: PathBuf,
    #[arg(long, default_value = "origin")]
    remote: String,
    #[arg(long, default_value = "main")]
    branch: String,
    /// Seconds between checks
    #[arg(long)]
    interval: Option<u64>,
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(err) = run(args) {
        error!(error = %err, "command failed");
        eprintln!("error: {}", err);
        process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run(args: Args) -> Result<(), CoreError> {
    let config = EngineConfig::from_env();
    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(JsonSettingsStore::default_path);

    match args.command {
        Commands::Download { link, dest } => {
            let engine = build_engine(config, &settings_path)?;
            if let Some(dest) = dest {
                engine.set_setting(SettingKey::DownloadPath, &dest.to_string_lossy())?;
            }
            let printer = spawn_printer(engine.subscribe());
            let result = engine.run(&link);
            drop(engine);
            let _ = printer.join();
            let report = result?;
            println!("{}", report);
            if report.failed() > 0 {
                for (item, outcome) in &report.outcomes {
                    if let trackfetch_core::ItemOutcome::Failed { error } = outcome {
                        println!("  failed: {} ({})", item.display_name(), error);
                    }
                }
            }
            Ok(())
        }
        Commands::Shell { update, no_update } => {
            let interval = update_interval(&config, &update);
            let engine = Arc::new(build_engine(config, &settings_path)?);
            if !no_update {
                spawn_update_watch(Arc::clone(&engine), &update, interval);
            }
            let printer = spawn_printer(engine.subscribe());
            shell(&engine)?;
            if engine.is_running() {
                println!("waiting for the current download to finish...");
            }
            let _ = engine.wait();
            // Detached: the update watch still holds an engine handle.
            drop(printer);
            Ok(())
        }
        Commands::Settings { action } => {
            let mut store = JsonSettingsStore::new(settings_path);
            settings_command(&mut store, action)
        }
        Commands::UpdateCheck { update, once } => {
            let interval = update_interval(&config, &update);
            let checker = UpdateChecker::new(Arc::new(git_repository(&update)), interval);
            if once {
                match checker.check_once()? {
                    UpdateOutcome::UpToDate(rev) => println!("up to date at {}", rev),
                    UpdateOutcome::Updated { from, to } => println!("updated {} -> {}", from, to),
                }
                return Ok(());
            }
            let handle = checker.spawn();
            match handle.restart_requests().recv() {
                Ok(request) => restart(&request),
                Err(_) => Ok(()),
            }
        }
    }
}

fn build_engine(config: EngineConfig, settings_path: &Path) -> Result<DownloadEngine, CoreError> {
    let engine = DownloadEngine::new(config)?
        .with_settings(Box::new(JsonSettingsStore::new(settings_path)));
    Ok(engine)
}

fn git_repository(update: &UpdateArgs) -> GitRepository {
    GitRepository::new(update.repo.clone(), &update.remote, &update.branch)
}

fn update_interval(config: &EngineConfig, update: &UpdateArgs) -> Duration {
    update
        .interval
        .map(|secs| Duration::from_secs(secs.max(1)))
        .unwrap_or(config.update_interval)
}

fn shell(engine: &DownloadEngine) -> Result<(), CoreError> {
    println!("paste a link to download, :help for commands");
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.map_err(|err| CoreError::Io(err.to_string()))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(command) = line.strip_prefix(':') {
            let parts: Vec<&str> = command.splitn(3, ' ').collect();
            match parts.as_slice() {
                ["quit"] | ["q"] => break,
                ["help"] => print_shell_help(),
                ["settings"] => match engine.settings() {
                    Ok(settings) => {
                        for (key, value) in settings.iter() {
                            println!("{}\t{}", key, value);
                        }
                    }
                    Err(err) => eprintln!("error: {}", err),
                },
                ["get", key] => match parse_key(key).and_then(|key| {
                    engine.settings().map(|s| s.get(key).to_string())
                }) {
                    Ok(value) => println!("{}", value),
                    Err(err) => eprintln!("error: {}", err),
                },
                ["set", key, value] => {
                    if let Err(err) = parse_key(key).and_then(|key| engine.set_setting(key, value)) {
                        eprintln!("error: {}", err);
                    }
                }
                _ => print_shell_help(),
            }
            continue;
        }

        match engine.submit(line) {
            Ok(link) => info!(link = %link, "batch submitted"),
            Err(CoreError::Busy) if engine.is_running() => println!("a download is already running"),
            Err(CoreError::Busy) => println!("restarting for an update, try again shortly"),
            Err(err) => println!("{}", err),
        }
    }
    Ok(())
}

fn print_shell_help() {
    println!(
        "  <link>              download a track, album or playlist\n\
  :settings           show settings\n\
  :get <key>          show one setting\n\
  :set <key> <value>  change a setting\n\
  :quit               leave"
    );
}

fn settings_command(store: &mut JsonSettingsStore, action: SettingsAction) -> Result<(), CoreError> {
    match action {
        SettingsAction::Show => {
            let settings = store.load()?;
            for (key, value) in settings.iter() {
                println!("{}\t{}", key, value);
            }
        }
        SettingsAction::Get { key } => {
            let key = parse_key(&key)?;
            println!("{}", store.get(key)?);
        }
        SettingsAction::Set { key, value } => {
            let key = parse_key(&key)?;
            store.set(key, &value)?;
        }
    }
    Ok(())
}

fn parse_key(key: &str) -> Result<SettingKey, CoreError> {
    SettingKey::from_str(key).ok_or_else(|| {
        CoreError::InvalidSetting(format!(
            "unknown setting {} (expected downloadPath, appearanceMode or colorTheme)",
            key
        ))
    })
}

/// Prints engine events until every sender is gone.
fn spawn_printer(events: Receiver<EngineEvent>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut stdout = io::stdout();
        for event in events {
            match event {
                EngineEvent::Status(text) if !text.is_empty() => {
                    let _ = writeln!(stdout, "{}", text);
                }
                EngineEvent::Progress { percent, processed, total, .. } => {
                    let _ = writeln!(stdout, "{} {} % ({}/{})", bar(percent), percent, processed, total);
                }
                EngineEvent::StreamProgress {
                    percent: Some(percent),
                    downloaded,
                    ..
                } if downloaded > 0 => {
                    let _ = write!(stdout, "\r  {} {} %", bar(percent), percent);
                    if percent >= 100 {
                        let _ = writeln!(stdout);
                    }
                }
                EngineEvent::JobStarted { total, destination, .. } => {
                    let _ = writeln!(stdout, "{} item(s) -> {}", total, destination.display());
                }
                EngineEvent::Thumbnail { path, .. } => {
                    info!(path = %path.display(), "thumbnail ready");
                }
                EngineEvent::TierFailed { tier, error, .. } => {
                    warn!(tier = %tier, error = %error, "quality unavailable, trying next");
                }
                _ => {}
            }
            let _ = stdout.flush();
        }
    })
}

fn bar(percent: u8) -> String {
    let filled = (percent as usize).min(100) / 5;
    format!("[{}{}]", "#".repeat(filled), "-".repeat(20 - filled))
}

fn spawn_update_watch(engine: Arc<DownloadEngine>, update: &UpdateArgs, interval: Duration) {
    let checker = UpdateChecker::new(Arc::new(git_repository(update)), interval);
    thread::spawn(move || {
        let handle = checker.spawn();
        let Ok(request) = handle.restart_requests().recv() else {
            return;
        };
        loop {
            match engine.claim_for_shutdown() {
                Ok(()) => break,
                Err(CoreError::Busy) => thread::sleep(Duration::from_millis(500)),
                Err(err) => {
                    error!(error = %err, "cannot reserve engine for restart");
                    return;
                }
            }
        }
        if let Err(err) = restart(&request) {
            error!(error = %err, "restart failed");
            engine.release_shutdown();
        }
    });
}

/// Starts a fresh copy of this binary with the same arguments and exits.
fn restart(request: &RestartRequest) -> Result<(), CoreError> {
    info!(from = %request.from, to = %request.to, "restarting after update");
    let exe = env::current_exe().map_err(|err| CoreError::Io(err.to_string()))?;
    Command::new(exe)
        .args(env::args_os().skip(1))
        .spawn()
        .map_err(|err| CoreError::Io(err.to_string()))?;
    process::exit(0);
}
