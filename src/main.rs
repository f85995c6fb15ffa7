mod cli;

use clap::Parser;
use cli::{Cli, Command};
use std::path::PathBuf;
use std::time::Duration;
use stabsstelle_sync::{
    config, identity, transport, EngineConfig, LicenseStore, MetadataStore, PrimaryStore,
    Reconciler, Result, Scheduler, SyncError,
};
use tracing::error;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

fn init_logging(config_dir: &PathBuf) -> tracing_appender::non_blocking::WorkerGuard {
    let log_dir = config_dir.join("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::never(&log_dir, "sync.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("default log filter always parses");

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(non_blocking))
        .init();

    guard
}

fn load_config(config_dir: &PathBuf) -> Result<EngineConfig> {
    let config_path = config_dir.join("sync_config.json");
    EngineConfig::load(&config_path)
}

/// Build a `LicenseStore` against the configured server URL — honors
/// `sync_config.json`'s `server_url` and the `SYNC_SERVER_URL` override,
/// the same way `build_reconciler` does for the sync/daemon commands.
fn license_store(config_dir: &PathBuf) -> Result<LicenseStore> {
    let config = load_config(config_dir)?;
    Ok(LicenseStore::new(config_dir.clone(), config.server_url))
}

fn build_reconciler(config_dir: &PathBuf) -> Result<(Reconciler, EngineConfig)> {
    let config = load_config(config_dir)?;

    let device_id = identity::device_id();
    let metadata = MetadataStore::open(&config.sync_db_path)?;
    let primary = PrimaryStore::open(&config.database_path)?;
    let transport = transport::Transport::new(config.server_url.clone());
    let license = LicenseStore::new(config_dir.clone(), config.server_url.clone());

    let reconciler = Reconciler::new(device_id, metadata, primary, transport, license, config.clone());
    Ok((reconciler, config))
}

fn main() {
    let cli = Cli::parse();
    let config_dir = cli.config_dir.clone().unwrap_or_else(config::default_config_dir);
    let _log_guard = init_logging(&config_dir);

    let exit_code = match run(cli, &config_dir) {
        Ok(()) => 0,
        Err(err) => {
            error!(error = %err, "command failed");
            eprintln!("stabctl: {err}");
            1
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli, config_dir: &PathBuf) -> Result<()> {
    match cli.command {
        Command::Validate { license_key } => {
            let license = license_store(config_dir)?;
            let record = license.validate_online(&license_key)?;
            println!(
                "license valid for {} until {}",
                record.tier,
                record.valid_until.to_rfc3339()
            );
            Ok(())
        }
        Command::Register { license_key } => {
            let license = license_store(config_dir)?;
            let registration = license.register_device(&license_key)?;
            println!("registered device {}", registration.device_id);
            if registration.token.is_none() {
                let legacy = license.register_legacy(
                    &license_key,
                    &identity::DeviceIdentity::current().hostname,
                    "stabsstelle-pi",
                    &identity::system_info().os_label,
                    env!("CARGO_PKG_VERSION"),
                )?;
                println!("legacy api key: {}", legacy.api_key);
            }
            Ok(())
        }
        Command::Check => {
            let license = license_store(config_dir)?;
            if license.is_valid() {
                println!("license is valid");
                Ok(())
            } else {
                Err(SyncError::LicenseInvalid)
            }
        }
        Command::Info => {
            let identity = identity::DeviceIdentity::current();
            let license = license_store(config_dir)?;
            let sync_config = license.sync_config();
            let report = serde_json::json!({
                "identity": identity,
                "license_valid": license.is_valid(),
                "sync": sync_config,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Sync { mode } => {
            let (reconciler, _config) = build_reconciler(config_dir)?;
            reconciler.sync(mode.into())
        }
        Command::Initial => {
            let (reconciler, _config) = build_reconciler(config_dir)?;
            let report = reconciler.initial_sync()?;
            for table in report.tables {
                println!(
                    "{}: {} inserted, {} updated, {} skipped",
                    table.table_name, table.inserted, table.updated, table.skipped
                );
            }
            if report.success {
                Ok(())
            } else {
                Err(SyncError::StoreUnavailable(
                    "one or more tables failed to import completely".to_string(),
                ))
            }
        }
        Command::Daemon { interval, api_key } => {
            let (reconciler, config) = build_reconciler(config_dir)?;
            let sync_interval = Duration::from_secs(interval.unwrap_or(config.sync_interval));
            let scheduler = Scheduler::new(reconciler, sync_interval);
            scheduler.install_signal_handler()?;
            scheduler.run_daemon(api_key);
            Ok(())
        }
        Command::Heartbeat { api_key } => {
            let (reconciler, _config) = build_reconciler(config_dir)?;
            if reconciler.heartbeat(&api_key) {
                println!("heartbeat sent");
                Ok(())
            } else {
                Err(SyncError::TransportFailure("heartbeat failed".to_string()))
            }
        }
    }
}
