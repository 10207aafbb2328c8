//! dab-proxy: DAB tuner orchestration server.
//!
//! Coordinates exclusive access to RTL-SDR dongles, runs one decoder
//! backend per active device, and exposes device-aware HTTP endpoints
//! for scanning, tuning, and audio streaming.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{error, info, warn};

mod backend;
mod catalog;
mod channels;
mod device;
mod logging;
mod scan;
mod setup;
mod tuner;
mod web;

use catalog::ChannelCatalog;
use device::{DeviceRegistry, ProbeCommand};
use scan::{LaunchedScanBackend, ScanConfig, ScanCoordinator};
use setup::{SetupStateMachine, REPLAY_GRACE};
use tuner::lock::{LockRegistry, DEFAULT_MAX_LOCK_AGE};
use tuner::pool::{InstancePool, InstancePoolConfig};
use tuner::{ProcessLauncher, SignalProbe};
use web::state::AppState;
use web::stream::MetaCache;

/// dab-proxy - DAB tuner orchestration server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:8000")]
    listen: SocketAddr,

    /// Directory for persisted state (setup, devices, catalog, locks)
    #[arg(short, long, default_value = "data")]
    data_dir: PathBuf,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Shared secret required on destructive endpoints
    #[arg(long)]
    admin_token: Option<String>,

    /// Default tuner gain (-1 = AGC, 0..=49 manual)
    #[arg(long, default_value = "-1", allow_hyphen_values = true)]
    gain: i32,

    /// Command that prints the device listing as JSON
    #[arg(long, default_value = "rtl-device-probe")]
    probe_command: String,

    /// Directory where log files are stored
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,
}

/// Configuration file format.
#[derive(Debug, serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    ports: PortsSection,
    #[serde(default)]
    scan: ScanSection,
    #[serde(default)]
    locks: LocksSection,
    #[serde(default)]
    storage: StorageSection,
    #[serde(default)]
    logging: LoggingSection,
    #[serde(default)]
    devices: DevicesSection,
}

#[derive(Debug, serde::Deserialize, Default)]
struct ServerSection {
    listen: Option<String>,
    admin_token: Option<String>,
    health_interval_secs: Option<u64>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct PortsSection {
    rtl_tcp_base: Option<u16>,
    backend_base: Option<u16>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct ScanSection {
    channel_timeout_secs: Option<u64>,
    settle_window_secs: Option<u64>,
    poll_interval_ms: Option<u64>,
    overall_timeout_secs: Option<u64>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct LocksSection {
    dir: Option<String>,
    reap_interval_secs: Option<u64>,
    max_age_secs: Option<u64>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct StorageSection {
    data_dir: Option<String>,
    keep_catalog_on_reset: Option<bool>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct LoggingSection {
    log_dir: Option<String>,
    retention_days: Option<u64>,
    level: Option<String>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct DevicesSection {
    probe_command: Option<String>,
    default_gain: Option<i32>,
    rtl_tcp_bin: Option<String>,
    decoder_bin: Option<String>,
}

/// Merge the gain setting (command line takes precedence over config).
fn merge_gain(cli_gain: i32, file_gain: Option<i32>) -> i32 {
    if cli_gain != -1 {
        cli_gain
    } else {
        file_gain.unwrap_or(-1)
    }
}

fn load_config(path: &PathBuf) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from("dab-proxy.toml");
        if default_path.exists() {
            Some(default_path)
        } else {
            None
        }
    });
    let file_config = if let Some(config_path) = &config_path {
        match load_config(config_path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", config_path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e);
            }
        }
    } else {
        ConfigFile::default()
    };

    // Merge logging configs (command line takes precedence)
    let log_dir = if args.log_dir.to_string_lossy() != "logs" {
        args.log_dir.clone()
    } else {
        PathBuf::from(file_config.logging.log_dir.as_deref().unwrap_or("logs"))
    };
    let log_retention_days = if args.log_retention_days != 7 {
        args.log_retention_days
    } else {
        file_config.logging.retention_days.unwrap_or(7)
    };
    let log_level = file_config.logging.level.as_deref();
    logging::init_logging(&log_dir, log_retention_days, args.verbose, log_level)?;

    let listen_addr = match file_config.server.listen.as_deref() {
        Some(addr) if args.listen.to_string() == "0.0.0.0:8000" => addr.parse()?,
        _ => args.listen,
    };
    let data_dir = if args.data_dir.to_string_lossy() != "data" {
        args.data_dir.clone()
    } else {
        PathBuf::from(file_config.storage.data_dir.as_deref().unwrap_or("data"))
    };
    std::fs::create_dir_all(&data_dir)?;

    let admin_token = args.admin_token.or(file_config.server.admin_token);
    let default_gain = merge_gain(args.gain, file_config.devices.default_gain);
    if !channels::is_valid_gain(default_gain) {
        return Err(format!("invalid default gain {}", default_gain).into());
    }
    let probe_command = file_config
        .devices
        .probe_command
        .unwrap_or(args.probe_command);

    info!("dab-proxy starting...");
    info!("  Listen address: {}", listen_addr);
    info!("  Data directory: {:?}", data_dir);
    info!("  Default gain: {}", default_gain);

    // Lock registry, recovering records left behind by a previous run.
    let lock_dir = file_config
        .locks
        .dir
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("locks"));
    let max_lock_age = file_config
        .locks
        .max_age_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_MAX_LOCK_AGE);
    let reap_interval = Duration::from_secs(file_config.locks.reap_interval_secs.unwrap_or(30));
    let locks = Arc::new(LockRegistry::open(
        &lock_dir,
        Box::new(SignalProbe),
        max_lock_age,
    )?);
    let reaped = locks.reap_stale();
    if reaped > 0 {
        info!("Reaped {} stale lock(s) at startup", reaped);
    }

    // Device registry with an initial hardware probe.
    let devices = Arc::new(DeviceRegistry::load(
        data_dir.join("devices.json"),
        Box::new(ProbeCommand::new(probe_command)),
    ));
    match devices.probe().await {
        Ok(found) => info!("  Devices: {}", found.len()),
        Err(e) => warn!("Initial device probe failed: {}", e),
    }

    let catalog = Arc::new(ChannelCatalog::load(data_dir.join("catalog.json")));

    // Instance pool over the real process launcher.
    let rtl_tcp_bin = file_config
        .devices
        .rtl_tcp_bin
        .unwrap_or_else(|| "rtl_tcp".to_string());
    let decoder_bin = file_config
        .devices
        .decoder_bin
        .unwrap_or_else(|| "welle-cli".to_string());
    let pool_config = InstancePoolConfig {
        rtl_tcp_base_port: file_config.ports.rtl_tcp_base.unwrap_or(1234),
        backend_base_port: file_config.ports.backend_base.unwrap_or(7979),
        ..InstancePoolConfig::default()
    };
    let launcher = Arc::new(ProcessLauncher::new(rtl_tcp_bin, decoder_bin));
    let pool = Arc::new(InstancePool::new(
        launcher,
        Arc::clone(&locks),
        pool_config.clone(),
    ));

    // Scan coordinator over the same launcher and port plan.
    let scan_defaults = ScanConfig::default();
    let scan_config = ScanConfig {
        channel_timeout: file_config
            .scan
            .channel_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(scan_defaults.channel_timeout),
        settle_window: file_config
            .scan
            .settle_window_secs
            .map(Duration::from_secs)
            .unwrap_or(scan_defaults.settle_window),
        poll_interval: file_config
            .scan
            .poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(scan_defaults.poll_interval),
        overall_timeout: file_config
            .scan
            .overall_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(scan_defaults.overall_timeout),
    };
    let scan_backend = Arc::new(LaunchedScanBackend::new(
        pool.launcher(),
        pool_config.rtl_tcp_base_port,
        pool_config.backend_base_port,
        pool_config.start_timeout,
    ));
    let scans = ScanCoordinator::new(
        Arc::clone(&locks),
        scan_backend,
        Arc::clone(&catalog),
        scan_config,
    );

    let keep_catalog = file_config.storage.keep_catalog_on_reset.unwrap_or(true);
    let setup = Arc::new(SetupStateMachine::load(
        data_dir.join("setup.json"),
        Arc::clone(&devices),
        Arc::clone(&catalog),
        Arc::clone(&pool),
        Arc::clone(&scans),
        Arc::clone(&locks),
        keep_catalog,
    ));

    // Periodic stale-lock reaper.
    {
        let locks = Arc::clone(&locks);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reap_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                locks.reap_stale();
            }
        });
    }

    // Periodic instance health checks.
    let health_interval =
        Duration::from_secs(file_config.server.health_interval_secs.unwrap_or(15));
    {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(health_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                pool.run_health_checks().await;
            }
        });
    }

    // Replay the persisted setup after a warm-up delay.
    {
        let setup = Arc::clone(&setup);
        tokio::spawn(async move {
            setup.replay(REPLAY_GRACE).await;
        });
    }

    let state = Arc::new(AppState {
        devices,
        locks,
        pool,
        scans,
        catalog,
        setup,
        meta_cache: MetaCache::new(data_dir.join("meta")),
        started_at: Instant::now(),
        admin_token,
        default_gain,
    });

    if let Err(e) = web::serve(listen_addr, state).await {
        error!("Server error: {}", e);
        return Err(e);
    }
    Ok(())
}
