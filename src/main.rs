pub mod models {
    pub mod channel;
}

pub mod aggregator;
pub mod clock;
pub mod config;
pub mod events;
pub mod persister;
pub mod sampler;
pub mod scheduler;
pub mod source;

use crate::aggregator::Aggregator;
use crate::clock::SystemClock;
use crate::config::{Config, SourceKind};
use crate::models::channel::ChannelSelector;
use crate::persister::Persister;
use crate::scheduler::Scheduler;
use crate::source::simulated::SimulatedBoard;
use crate::source::sysfs::SysfsBoard;
use crate::source::ChannelSource;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

fn build_source(kind: &SourceKind) -> Result<Box<dyn ChannelSource + Send>, String> {
    match kind {
        SourceKind::IonoPi { root, w1_root } => {
            let board = SysfsBoard::open(root, w1_root).map_err(|e| format!("Iono Pi board unavailable: {}", e))?;
            info!("Using Iono Pi board at {} (1-Wire at {})", root.display(), w1_root.display());
            Ok(Box::new(board))
        }
        SourceKind::Simulated { seed } => {
            info!("Using simulated board (seed={:#x})", seed);
            Ok(Box::new(SimulatedBoard::new(*seed)))
        }
    }
}

/// Log which 1-Wire sensor each channel id currently maps to.
fn log_one_wire_channels(source: &mut dyn ChannelSource, aggregated: &ChannelSelector) {
    let channels = match source.read_one_wire_inputs() {
        Ok(channels) => channels,
        Err(e) => {
            warn!("Listing 1-Wire channels failed: {}", e);
            return;
        }
    };
    for ch in &channels {
        let marker = if aggregated.matches(ch) { " (aggregated)" } else { "" };
        info!("1-Wire channel {} = {}{}", ch.id, ch.name, marker);
    }
    if !channels.iter().any(|ch| aggregated.matches(ch)) {
        warn!("Aggregated channel {} is not on the 1-Wire bus", aggregated);
    }
}

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (polling={}s, aggregation={}s, data={}, export={}, header={}, channel={}, db_id={}, decimals={}, settle={}ms)",
        cfg.polling_period_secs,
        cfg.aggregation_period_secs,
        cfg.data_path.display(),
        cfg.export_path.display(),
        cfg.file_header,
        cfg.aggregate_channel,
        cfg.aggregate_db_id,
        cfg.aggregate_decimals,
        cfg.settle_delay.as_millis()
    );

    // 2) Output directories must exist before the first write
    let persister = Persister::new(&cfg.data_path, &cfg.export_path, cfg.file_header.clone());
    persister.prepare()?;

    // 3) Board
    let mut source = build_source(&cfg.source)?;
    log_one_wire_channels(source.as_mut(), &cfg.aggregate_channel);

    // 4) Cooperative shutdown on Ctrl+C / SIGTERM
    let cancel = Arc::new(AtomicBool::new(false));
    let handler_cancel = Arc::clone(&cancel);
    ctrlc::set_handler(move || {
        info!("Shutdown requested");
        handler_cancel.store(true, Ordering::SeqCst);
    })
    .map_err(|e| format!("installing signal handler failed: {}", e))?;

    // 5) Polling loop on its own thread; this thread only waits for it
    let aggregator = Aggregator::new(
        cfg.aggregate_channel.clone(),
        cfg.aggregate_db_id,
        cfg.aggregate_decimals,
    );
    let mut scheduler = Scheduler::new(cfg.scheduler_config(), source, SystemClock::new(), aggregator, persister);
    let worker_cancel = Arc::clone(&cancel);
    let worker = thread::Builder::new()
        .name("polling".to_string())
        .spawn(move || {
            scheduler.run(&worker_cancel);
            scheduler.into_source()
        })
        .map_err(|e| format!("starting polling thread failed: {}", e))?;

    let mut source = worker.join().map_err(|_| "polling thread panicked".to_string())?;

    // 6) Leave the board in a safe state
    source.cleanup();
    Ok(())
}

fn configure_env_from_cli() -> Result<Option<LoadedEnvFile>, String> {
    let mut args = std::env::args_os();
    args.next(); // skip program name

    let mut env_file: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        let path = match arg.to_str() {
            Some("--env-file") => args
                .next()
                .map(PathBuf::from)
                .ok_or_else(|| "`--env-file` requires a path argument".to_string())?,
            Some(s) if s.starts_with("--env-file=") => match &s["--env-file=".len()..] {
                "" => return Err("`--env-file` requires a path argument".to_string()),
                p => PathBuf::from(p),
            },
            Some("--") => break,
            Some(other) => return Err(format!("unrecognised argument: {}", other)),
            None => return Err("argument contains invalid UTF-8".to_string()),
        };
        if env_file.replace(path).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }

    let (path, explicit) = match env_file {
        Some(path) if !path.is_file() => return Err(format!("env file not found: {}", path.display())),
        Some(path) => (path, true),
        None => {
            let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
            let default_path = cwd.join(".env");
            if !default_path.is_file() {
                return Ok(None);
            }
            (default_path, false)
        }
    };
    config::load_env_file(&path)?;
    Ok(Some(LoadedEnvFile { path, explicit }))
}

fn main() {
    let loaded_env = match configure_env_from_cli() {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "iono-das {} (git {}) starting on {}",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH"),
        std::env::consts::OS
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
    info!("End");
}
